//! Kernel IP sets: the syncer and the manager that feeds it.

mod manager;
mod syncer;

pub use manager::IpSetsManager;
pub use syncer::IpSets;
