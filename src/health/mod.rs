//! Health-driven membership: the per-member state machine, the background
//! monitor that feeds it, and listener routing over its snapshots.

pub mod machine;
pub mod monitor;
pub mod routing;

pub use machine::{HealthCheckConfig, MemberSnapshot, MemberState};
pub use monitor::{HealthProbe, MembershipMonitor, MonitorError};
