// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

/// Lifecycle state of a cluster node.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Unknown,
    Initializing,
    Active,
    Maintenance,
    Failed,
    Decommissioned,
}

/// Operational state of a disk, disk group, volume, or replica.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageState {
    #[default]
    Unknown,
    Initializing,
    Online,
    Offline,
    Degraded,
    Failed,
    Missing,
    Rebuilding,
    Maintenance,
}

/// Physical kind of a storage disk, inferred from block-device properties.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    #[default]
    Unknown,
    NvmeSsd,
    SataSsd,
    SasSsd,
    HddSata,
    HddSas,
    OtherSsd,
    OtherHdd,
}

impl DiskKind {
    /// Classifies a device from its advertised properties.
    pub fn infer(product_name: &str, is_rotational: bool) -> Self {
        let name = product_name.to_ascii_lowercase();
        if name.contains("nvme") {
            DiskKind::NvmeSsd
        } else if is_rotational {
            DiskKind::OtherHdd
        } else {
            DiskKind::OtherSsd
        }
    }
}

/// Layout kind of a disk group.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    #[default]
    Undefined,
    Passthrough,
    Jbod,
}
