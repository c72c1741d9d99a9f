//! Credential rotation
//!
//! - [`state`]: swap state machine
//! - [`retry`]: creation retry with quadratic backoff
//! - [`swap`]: the create → validate → commit → revoke protocol
//! - [`queue`]: min-heap of due rotations
//! - [`scheduler`]: background task driving the queue

pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod swap;

pub use queue::{RotationKey, RotationQueue};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use scheduler::{CommandReceiver, RotationScheduler, Rotator, SchedulerHandle};
pub use state::SwapState;
pub use swap::{RevocationPolicy, RotationId, SwapProtocol, SwapReport, SwapTarget};
