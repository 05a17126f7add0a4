//! Data models
//!
//! Device identity, VM instance and forwarding rule types shared by the
//! hypervisor drivers, the config sync engine and the lifecycle orchestrator.

mod forward;
mod identity;
mod instance;

pub use forward::{PortForwardRule, PortForwardSet, Protocol};
pub use identity::{DeviceIdentity, DEFAULT_DEVICE_MODEL};
pub use instance::{
    BackendKind, CanonicalStatus, InstanceStatus, NetworkSpec, ResourceSpec, VmInstance, VmSpec,
};
