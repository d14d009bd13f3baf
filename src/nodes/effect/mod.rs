mod gain;
mod panner;

pub use gain::*;
pub use panner::*;
