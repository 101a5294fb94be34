//! Wire DTOs for the subset of the Firecracker control-socket API this
//! crate drives: boot source, drives, machine config, network interfaces,
//! vsock, and snapshot create/load.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchDrive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfiguration {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchNetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VsockDevice {
    pub guest_cid: u32,
    pub uds_path: PathBuf,
    pub vsock_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceActionInfo {
    pub action_type: ActionType,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ActionType {
    InstanceStart,
    SendCtrlAltDel,
    FlushMetrics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum VmState {
    Paused,
    Resumed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchVmState {
    pub state: VmState,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSnapshot {
    pub snapshot_path: PathBuf,
    pub mem_file_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_type: Option<SnapshotType>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum SnapshotType {
    Full,
    Diff,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSnapshot {
    pub snapshot_path: PathBuf,
    pub mem_backend: MemoryBackend,
    pub enable_diff_snapshots: bool,
    pub resume_vm: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryBackend {
    pub backend_type: MemoryBackendType,
    pub backend_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum MemoryBackendType {
    File,
    Uffd,
}

/// The body of an error response returned by the VMM control API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiFault {
    pub fault_message: String,
}
