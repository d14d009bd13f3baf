mod constant;
mod oscillator;
mod scheduled;

pub use constant::*;
pub use oscillator::*;
pub use scheduled::{PlaybackState, SourceMessage};
