//! Device identity

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default device model for virtual devices
pub const DEFAULT_DEVICE_MODEL: &str = "ZedVirtual-4G";

/// Identity of the edge device under test
///
/// Created once when certificates are bootstrapped and never mutated
/// afterwards within the same test context.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device id, used as the CN of the onboarding certificate
    pub device_id: Uuid,
    /// Onboarding id the controller enrolls the device under
    pub onboard_id: Uuid,
    /// Device model descriptor
    pub model: String,
}

impl DeviceIdentity {
    pub fn new(device_id: Uuid, onboard_id: Uuid, model: impl Into<String>) -> Self {
        Self {
            device_id,
            onboard_id,
            model: model.into(),
        }
    }

    /// Generate a fresh identity
    pub fn generate(model: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4(), Uuid::new_v4(), model)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (onboard {}, {})", self.device_id, self.onboard_id, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        let a = DeviceIdentity::generate(DEFAULT_DEVICE_MODEL);
        let b = DeviceIdentity::generate(DEFAULT_DEVICE_MODEL);
        assert_ne!(a.device_id, b.device_id);
        assert_ne!(a.device_id, a.onboard_id);
        assert_eq!(a.model, "ZedVirtual-4G");
    }
}
