pub mod time_source;

pub use self::time_source::{MockTimeSource, SystemClock, TimeSource};
