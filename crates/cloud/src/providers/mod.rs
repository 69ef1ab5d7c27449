//! Cloud provider clients.
//!
//! Each provider exposes the vendor specific operations that cluster bootstrap needs. They share
//! [`VmSpec`] for hydrating node group sizes into cluster autoscaler annotations.

pub mod aws;
pub mod azure;
pub mod hetzner;

pub use aws::Aws;
pub use azure::Azure;
pub use hetzner::{HCloud, Robot};

/// Hardware of a VM / machine type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmSpec {
    pub cpu: u32,
    /// Memory in MiB.
    pub memory_mib: u32,
    /// Root disk size in GiB, when the machine type fixes it.
    pub root_volume_gib: Option<u32>,
}

impl VmSpec {
    /// Memory rounded down to whole GiB.
    #[must_use]
    pub fn memory_gib(&self) -> u32 {
        self.memory_mib / 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_gib_rounds_down() {
        let spec = VmSpec {
            cpu: 2,
            memory_mib: 3584,
            root_volume_gib: None,
        };
        assert_eq!(spec.memory_gib(), 3);
    }
}
