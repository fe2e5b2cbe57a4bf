pub mod backoff;
pub mod error;

pub use backoff::{Backoff, RetryPolicy};
pub use error::{FrameDecodeError, WatcherError, WatcherResult};
