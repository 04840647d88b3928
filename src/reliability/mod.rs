//! Delivery guarantees on top of unreliable datagrams.
//!
//! - [`CompletionToken`]: the caller's view of an in-flight operation
//! - [`PendingAckStore`]: FIFO ack tracking with resend and timeout
//! - [`SequenceAllocator`]: per-destination message sequences

mod completion;
mod pending;
mod sequence;

pub use completion::{completion, Completion, CompletionToken};
pub use pending::{AckOutcome, PendingAckStore, ResendPolicy};
pub use sequence::SequenceAllocator;
