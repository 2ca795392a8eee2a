//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `build`   | `Build`          |
//! | `config`  | `Config`         |
//! | `preview` | `Preview`        |

pub mod build;
pub mod config;
pub mod preview;
pub mod serve;

pub use build::cmd_build;
pub use config::cmd_config;
pub use preview::cmd_preview;
pub use serve::cmd_serve;
