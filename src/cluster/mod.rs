//! Cluster topology and routing.

pub mod router;
pub mod topology;

pub use router::ClusterRouter;
pub use topology::{SlotTable, TopologyCache};
