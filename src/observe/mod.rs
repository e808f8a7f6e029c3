pub mod inspector;
pub mod monitor;

pub use inspector::{Inspector, TraceEvent, TraceStage};
pub use monitor::{HealthLabel, HealthSample, ResourceMonitor};
