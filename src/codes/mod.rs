//! One-time code generation and single-use reservation.

mod arbiter;
mod store;
mod totp;
mod valkey;

pub use arbiter::{CodeArbiter, CodeMetrics, RecentIssue};
pub use store::{InMemoryReservationStore, ReservationStore};
pub use totp::TotpGenerator;
pub use valkey::ValkeyReservationStore;
