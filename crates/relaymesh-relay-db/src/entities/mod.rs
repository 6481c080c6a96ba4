//! Database entities

pub mod monitor_sample;
pub mod relay_node;
pub mod setting;
pub mod tunnel;

pub use monitor_sample::Entity as MonitorSample;
pub use relay_node::Entity as RelayNode;
pub use setting::Entity as Setting;
pub use tunnel::Entity as Tunnel;

pub mod prelude {
    pub use super::monitor_sample::Entity as MonitorSample;
    pub use super::relay_node::Entity as RelayNode;
    pub use super::setting::Entity as Setting;
    pub use super::tunnel::Entity as Tunnel;
}
