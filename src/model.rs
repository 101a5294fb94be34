//! On-disk projections of VM and snapshot state.
//!
//! These are the authoritative representation of a VM's configuration and
//! status whenever no live [`crate::supervisor::Supervisor`] owns it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Per-VM record, persisted as `metadata/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub image: String,
    pub vcpu: u32,
    pub mem_mib: u32,
    pub rootfs_path: PathBuf,
    #[serde(default)]
    pub network_config: Option<NetworkConfig>,
    #[serde(default)]
    pub vsock_config: Option<VsockConfig>,
    pub status: VmStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    pub created_at: u64,
    #[serde(default)]
    pub agent_ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub host_ip: String,
    pub guest_ip: String,
    pub guest_mac: String,
    pub tap_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VsockConfig {
    pub enabled: bool,
    pub cid: u32,
    pub port: u16,
    pub uds_path: PathBuf,
    #[serde(default)]
    pub baked_uds_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Running,
    Paused,
    Stopped,
}

/// Snapshot catalog entry, persisted as `snapshots/<snapshot_name>/metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub snapshot_name: String,
    pub source_vm_id: String,
    pub vm_record: VmRecord,
    #[serde(default)]
    pub baked_uds_path: Option<PathBuf>,
}
