pub(crate) mod destination;
mod meter;

pub use destination::DestinationNode;
pub use meter::*;
