pub mod clock;
pub mod error;

pub use clock::{Clock, ManualClock, SkewedClock, SystemClock};
pub use error::{CoordinationError, Result};
