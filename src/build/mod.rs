//! Server-side build orchestrator.
//!
//! ## Overview
//!
//! Turns a project name plus a JSON UI schema into a downloadable zip of a
//! built template project. Every submission gets its own job, its own
//! workspace under `workspace_root/<job id>`, and a status record that
//! clients poll over HTTP.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ (editor) │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘  polling │         │                                        │
//!                       │         │ JobOrchestrator::submit()              │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (stage sequencing, cleanup)    │
//!                       │         │                                        │
//!                       │         ├─ materializer.rs  template → workspace │
//!                       │         ├─ runner.rs        build command + logs │
//!                       │         └─ packager.rs      output → zip         │
//!                       │                                                  │
//!                       │  store.rs  (JobStore trait, DashMap impl)        │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                           |
//! |------------|----------------------------------------------------------|
//! | `models`   | `BuildJob`, `BuildStatus`, transition rules, API views   |
//! | `sanitize` | Project name → safe artifact filename stem               |
//!
//! ## Request Flow
//!
//! 1. `POST /api/build` → `JobOrchestrator::submit()` stores a `pending` job
//!    and spawns the pipeline; the handler answers 202 immediately.
//! 2. The pipeline moves the job through `creatingEnvironment`, `building`
//!    and `packaging`. Build output lines land in the job's `logs` and in
//!    `<log_dir>/<job id>.log` as they are produced.
//! 3. The job ends `completed` with an `artifactPath`, or `failed` with an
//!    `errorMessage`. The workspace is removed either way.
//! 4. `GET /api/build/download/{id}` streams the archive.

pub mod api;
pub mod materializer;
pub mod models;
pub mod orchestrator;
pub mod packager;
pub mod runner;
pub mod sanitize;
pub mod server;
pub mod store;
