//! Multi-tab terminal over the container runtime.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::runtime::ContainerRuntime;
use crate::errors::ContainerError;

pub type TabId = u32;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalTab {
    pub id: TabId,
    pub name: String,
    pub scrollback: Vec<String>,
    pub history: Vec<String>,
    /// `history.len()` means past the newest entry.
    pub history_cursor: usize,
}

impl TerminalTab {
    fn new(id: TabId) -> Self {
        Self {
            id,
            name: format!("Terminal {}", id),
            scrollback: Vec::new(),
            history: Vec::new(),
            history_cursor: 0,
        }
    }
}

/// Tab summary for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabInfo {
    pub id: TabId,
    pub name: String,
}

struct TabSlot {
    id: TabId,
    tab: Mutex<TerminalTab>,
    /// Held for the whole of a command so a tab runs one command at a time.
    exec: tokio::sync::Mutex<()>,
}

struct Tabs {
    /// Creation order.
    slots: Vec<Arc<TabSlot>>,
    active: TabId,
    next_id: TabId,
}

pub struct TerminalMultiplexer {
    runtime: Arc<dyn ContainerRuntime>,
    tabs: Mutex<Tabs>,
}

impl TerminalMultiplexer {
    /// Starts with a single "Terminal 1" tab.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let first = new_slot(1);
        Self {
            runtime,
            tabs: Mutex::new(Tabs {
                slots: vec![first],
                active: 1,
                next_id: 2,
            }),
        }
    }

    /// Open a new tab and make it active.
    pub fn add_tab(&self) -> TabId {
        let mut tabs = self.lock_tabs();
        let id = tabs.next_id;
        tabs.next_id += 1;
        tabs.slots.push(new_slot(id));
        tabs.active = id;
        id
    }

    /// Close a tab. The last remaining tab cannot be closed; the call is a
    /// no-op. Closing the active tab activates the newest remaining one.
    pub fn close_tab(&self, id: TabId) -> Result<(), ContainerError> {
        let mut tabs = self.lock_tabs();
        let index = tabs
            .slots
            .iter()
            .position(|slot| slot.id == id)
            .ok_or(ContainerError::UnknownTab { id })?;
        if tabs.slots.len() == 1 {
            return Ok(());
        }
        tabs.slots.remove(index);
        if tabs.active == id
            && let Some(newest) = tabs.slots.last().map(|slot| slot.id)
        {
            tabs.active = newest;
        }
        Ok(())
    }

    pub fn switch_tab(&self, id: TabId) -> Result<(), ContainerError> {
        let mut tabs = self.lock_tabs();
        if !tabs.slots.iter().any(|slot| slot.id == id) {
            return Err(ContainerError::UnknownTab { id });
        }
        tabs.active = id;
        Ok(())
    }

    pub fn tabs(&self) -> Vec<TabInfo> {
        self.lock_tabs()
            .slots
            .iter()
            .map(|slot| {
                let tab = lock_tab(slot);
                TabInfo {
                    id: tab.id,
                    name: tab.name.clone(),
                }
            })
            .collect()
    }

    pub fn active_tab(&self) -> TabId {
        self.lock_tabs().active
    }

    pub fn scrollback(&self, id: TabId) -> Result<Vec<String>, ContainerError> {
        let slot = self.slot(id)?;
        let lines = lock_tab(&slot).scrollback.clone();
        Ok(lines)
    }

    pub fn clear(&self, id: TabId) -> Result<(), ContainerError> {
        let slot = self.slot(id)?;
        lock_tab(&slot).scrollback.clear();
        Ok(())
    }

    /// Run `text` in tab `id` and return its exit code.
    ///
    /// Commands on the same tab queue behind each other; other tabs are
    /// unaffected. The scrollback gets a `$ <text>` echo line followed by the
    /// command's output in emission order. The call returns once the process
    /// exits, even if a background child still holds its output open.
    pub async fn execute_command(&self, id: TabId, text: &str) -> Result<i32, ContainerError> {
        let slot = self.slot(id)?;
        let _running = slot.exec.lock().await;

        let words = split_command_line(text);
        {
            let mut tab = lock_tab(&slot);
            if !words.is_empty() {
                tab.history.push(text.to_string());
            }
            tab.history_cursor = tab.history.len();
            tab.scrollback.push(format!("$ {}", text));
        }
        let Some((program, args)) = words.split_first() else {
            return Ok(0);
        };

        let mut process = match self.runtime.spawn(program, args).await {
            Ok(process) => process,
            Err(e) => {
                lock_tab(&slot).scrollback.push(e.to_string());
                return Err(e);
            }
        };
        let exit_code = process
            .wait_with_output(|line| lock_tab(&slot).scrollback.push(line))
            .await
            .unwrap_or(-1);
        tracing::debug!(tab = id, exit_code, command = %text, "terminal command finished");
        Ok(exit_code)
    }

    /// Step back through history. Stays on the oldest entry; `None` when
    /// there is no history.
    pub fn history_up(&self, id: TabId) -> Result<Option<String>, ContainerError> {
        let slot = self.slot(id)?;
        let mut tab = lock_tab(&slot);
        if tab.history.is_empty() {
            return Ok(None);
        }
        tab.history_cursor = tab.history_cursor.saturating_sub(1);
        Ok(tab.history.get(tab.history_cursor).cloned())
    }

    /// Step forward through history. Returns `""` once past the newest.
    pub fn history_down(&self, id: TabId) -> Result<String, ContainerError> {
        let slot = self.slot(id)?;
        let mut tab = lock_tab(&slot);
        let len = tab.history.len();
        if tab.history_cursor < len {
            tab.history_cursor += 1;
        }
        Ok(tab.history.get(tab.history_cursor).cloned().unwrap_or_default())
    }

    fn slot(&self, id: TabId) -> Result<Arc<TabSlot>, ContainerError> {
        self.lock_tabs()
            .slots
            .iter()
            .find(|slot| slot.id == id)
            .cloned()
            .ok_or(ContainerError::UnknownTab { id })
    }

    fn lock_tabs(&self) -> std::sync::MutexGuard<'_, Tabs> {
        self.tabs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn new_slot(id: TabId) -> Arc<TabSlot> {
    Arc::new(TabSlot {
        id,
        tab: Mutex::new(TerminalTab::new(id)),
        exec: tokio::sync::Mutex::new(()),
    })
}

fn lock_tab(slot: &TabSlot) -> std::sync::MutexGuard<'_, TerminalTab> {
    slot.tab.lock().unwrap_or_else(|e| e.into_inner())
}

/// Split a command line into words. Single and double quotes group words
/// and a backslash escapes the next character outside single quotes.
pub fn split_command_line(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('\''), c) => current.push(c),
            (_, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
