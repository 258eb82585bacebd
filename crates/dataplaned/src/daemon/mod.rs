//! The dataplane event loop and its apply throttle.

mod dataplane;
mod throttle;

pub use dataplane::{
    DataplaneError, DataplaneHandles, IfaceAddrsUpdate, IfaceUpdate, InternalDataplane,
};
pub use throttle::Throttle;
