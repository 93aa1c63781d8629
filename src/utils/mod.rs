//! Shared utilities: decimal arithmetic and injectable time.

pub mod clock;
pub mod decimal;

pub use clock::{BackoffPolicy, Clock, ManualClock, RecordingSleeper, Sleeper, SystemClock, TokioSleeper};
