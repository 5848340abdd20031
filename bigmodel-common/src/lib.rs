//! Bigmodel Common Types
//!
//! Shared types used by the inference core and its callers: batch tasks,
//! relay events and the upstream stream line format.

pub mod stream;
pub mod task;

pub use stream::{ReplyChunk, StreamEvent, STREAM_STATUS_DONE};
pub use task::{Task, TaskId, TaskOutcome, TaskStatus, UnknownTaskStatus};
