//! Job orchestrator for sandboxed browser automation.
//!
//! Each pending job gets a one-time code when its provider needs one, a
//! dedicated browser sandbox, and a worker to drive it. Workers report back
//! over an HTTP callback, which finishes the job and tears the sandbox down.

pub mod clock;
pub mod codes;
pub mod config;
pub mod error;
pub mod jobs;
pub mod observability;
pub mod orchestrator;
pub mod sandbox;
#[doc(hidden)]
pub mod testing;
pub mod worker;

pub use config::Config;
pub use error::{OrchestratorError, Result};
