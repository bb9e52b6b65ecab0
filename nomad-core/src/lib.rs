//! Foundation types shared by every crate in the Nomad workspace provider:
//! the error taxonomy and the cancellable polling primitive.

pub mod error;
pub mod poll;

pub use error::{PhaseContext, Result, WorkspaceError};
pub use poll::{poll_until, PollOutcome, PollSchedule};
pub use tokio_util::sync::CancellationToken;
