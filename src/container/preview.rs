use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewportMode {
    Desktop,
    Tablet,
    Mobile,
}

impl ViewportMode {
    /// Simulated `(width, height)`; `None` means fluid.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            Self::Desktop => None,
            Self::Tablet => Some((768, 1024)),
            Self::Mobile => Some((375, 667)),
        }
    }
}

impl std::str::FromStr for ViewportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "desktop" => Ok(Self::Desktop),
            "tablet" => Ok(Self::Tablet),
            "mobile" => Ok(Self::Mobile),
            _ => Err(format!("Invalid viewport: {}", s)),
        }
    }
}

/// What the preview pane should currently render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSnapshot {
    pub url: Option<String>,
    pub viewport: ViewportMode,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub reload_key: u64,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
struct PreviewState {
    url: Option<String>,
    viewport: ViewportMode,
    reload_key: u64,
    loading: bool,
    error: Option<String>,
}

/// Viewport, reload and load-error state of the live preview.
#[derive(Debug)]
pub struct PreviewController {
    state: Mutex<PreviewState>,
}

impl Default for PreviewController {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PreviewState {
                url: None,
                viewport: ViewportMode::Desktop,
                reload_key: 0,
                loading: false,
                error: None,
            }),
        }
    }

    pub fn set_viewport(&self, mode: ViewportMode) {
        self.lock().viewport = mode;
    }

    /// Point the preview at a new URL and start loading it.
    pub fn set_url(&self, url: Option<String>) {
        let mut state = self.lock();
        state.loading = url.is_some();
        state.error = None;
        state.url = url;
    }

    pub fn reload(&self) {
        let mut state = self.lock();
        state.reload_key += 1;
        state.error = None;
        state.loading = true;
    }

    pub fn on_load(&self) {
        self.lock().loading = false;
    }

    pub fn on_error(&self, message: &str) {
        let mut state = self.lock();
        state.loading = false;
        state.error = Some(message.to_string());
    }

    pub fn snapshot(&self) -> PreviewSnapshot {
        let state = self.lock();
        let dimensions = state.viewport.dimensions();
        PreviewSnapshot {
            url: state.url.clone(),
            viewport: state.viewport,
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
            reload_key: state.reload_key,
            loading: state.loading,
            error: state.error.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PreviewState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
