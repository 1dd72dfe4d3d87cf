//! Job orchestration: dispatch, completion, reaping and restart recovery.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Orchestrator                         │
//! │                                                           │
//! │  dispatch loop (every POLL_INTERVAL)                      │
//! │    JobDispatcher::run_once()                              │
//! │      pending -> dispatching -> code -> sandbox -> worker  │
//! │      -> running | failed                                  │
//! │                                                           │
//! │  Callback API (default :8620)                             │
//! │    POST /callbacks/job-complete  -> CompletionHandler     │
//! │    GET  /health                                           │
//! │                                                           │
//! │  reaper loop      IdleReaper::sweep()                     │
//! │  metrics loop     MetricsReporter::report()               │
//! │  startup          Reconciler::run()                       │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod completion;
pub mod dispatcher;
pub mod notify;
pub mod reaper;
pub mod reconcile;
pub mod runtime;

pub use api::{CallbackApi, CallbackState};
pub use auth::CallbackAuth;
pub use completion::{CompletionHandler, CompletionOutcome};
pub use dispatcher::{
    DispatchFailure, DispatchOutcome, DispatchSettings, DispatchStage, DispatchSummary,
    JobDispatcher,
};
pub use notify::{CompletionNotice, CompletionNotifier};
pub use reaper::IdleReaper;
pub use reconcile::{ReconcileReport, Reconciler};
pub use runtime::{Components, Orchestrator};
