pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::KilnConfig;
pub use types::*;
