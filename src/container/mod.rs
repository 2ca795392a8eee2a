//! Container orchestrator: the build-and-preview workflow without a server
//! round trip.
//!
//! Everything runs against a [`runtime::ContainerRuntime`], the boundary to
//! the execution environment. [`runtime::LocalRuntime`] backs it with a host
//! directory and child processes.
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `runtime`    | Runtime trait, `LocalRuntime`, server-ready detection   |
//! | `session`    | Singleton boot, sticky boot error, file sync            |
//! | `filetree`   | Flat file list ⇄ mount tree                             |
//! | `dep_cache`  | Manifest fingerprints, snapshot reuse, install protocol |
//! | `dev_server` | Dev server start/stop and the ready-vs-timeout race     |
//! | `terminal`   | Tabs, scrollback, history, per-tab serialized commands  |
//! | `preview`    | Viewport mode, reload and load-error state              |
//!
//! Typical flow: `ContainerSession::initialize` → `mount_files` →
//! `install_dependencies` → `DevServerManager::start` → preview URL.

pub mod dep_cache;
pub mod dev_server;
pub mod filetree;
pub mod preview;
pub mod runtime;
pub mod session;
pub mod terminal;
