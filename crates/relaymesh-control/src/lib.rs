//! Control plane for relaymesh tunnel orchestration
//!
//! - [`PortAllocator`]: unique port assignment from the dynamic range
//! - [`TunnelManager`]: create/stop/list/status over registry rows and adapters
//! - [`Autopilot`]: periodic, observational health sampling
//! - [`TunnelStore`]: typed access to the persisted registry
pub mod autopilot;
pub mod error;
pub mod manager;
pub mod port_allocator;
pub mod probe;
pub mod score;
pub mod store;
pub mod tracking;

pub use autopilot::{Autopilot, AutopilotConfig, AutopilotState, CycleReport, TargetReport};
pub use error::{ControlError, ErrorReport};
pub use manager::{
    build_start_options, runtime_id, CreateTunnelRequest, CreateTunnelResponse, StartResult,
    StopResult, TunnelHealth, TunnelManager, TunnelView, NOTE_NO_ACTIVE_PROCESS,
};
pub use port_allocator::{Allocation, AllocatorConfig, PortAllocator};
pub use probe::{ProbeError, ProbeTarget, Prober, SimulatedProber};
pub use score::{compute_score, Measurement, QualityBucket};
pub use store::{NewNode, NewSample, NewTunnel, QualityUpdate, TunnelStore};
pub use tracking::{TrackedTunnel, TrackingMap};
