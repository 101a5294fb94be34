//! Typed operations against a VMM's control socket.

use std::{path::Path, time::Duration};

use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::Full;

use super::{
    models::{
        ActionType, BootSource, CreateSnapshot, Drive, InstanceActionInfo, LoadSnapshot, MachineConfiguration,
        MemoryBackend, MemoryBackendType, NetworkInterface, PatchDrive, PatchNetworkInterface, PatchVmState,
        VmState as ApiVmState, VsockDevice,
    },
    process::{HyperResponseExt, VmmProcess, VmmProcessError},
};

/// Facade over [`VmmProcess::send_api_request`] providing one typed method
/// per Firecracker control-socket route this crate drives.
pub struct VmmApiClient<'a> {
    process: &'a mut VmmProcess,
}

impl<'a> VmmApiClient<'a> {
    pub fn new(process: &'a mut VmmProcess) -> Self {
        Self { process }
    }

    pub async fn wait_for_socket(&self, deadline: Duration) -> Result<(), VmmProcessError> {
        self.process.wait_for_socket(deadline).await
    }

    pub async fn put_boot_source(
        &mut self,
        kernel_path: &Path,
        boot_args: Option<String>,
    ) -> Result<(), VmmProcessError> {
        self.put(
            "/boot-source",
            &BootSource {
                kernel_image_path: kernel_path.to_path_buf(),
                boot_args,
            },
        )
        .await
    }

    pub async fn put_drive(
        &mut self,
        drive_id: &str,
        host_path: &Path,
        is_root: bool,
        is_read_only: bool,
    ) -> Result<(), VmmProcessError> {
        self.put(
            &format!("/drives/{drive_id}"),
            &Drive {
                drive_id: drive_id.to_string(),
                path_on_host: host_path.to_path_buf(),
                is_root_device: is_root,
                is_read_only,
            },
        )
        .await
    }

    pub async fn patch_drive(&mut self, drive_id: &str, host_path: &Path) -> Result<(), VmmProcessError> {
        self.patch(
            &format!("/drives/{drive_id}"),
            &PatchDrive {
                drive_id: drive_id.to_string(),
                path_on_host: host_path.to_path_buf(),
            },
        )
        .await
    }

    pub async fn put_machine_config(&mut self, vcpu_count: u32, mem_size_mib: u32) -> Result<(), VmmProcessError> {
        self.put(
            "/machine-config",
            &MachineConfiguration {
                vcpu_count,
                mem_size_mib,
            },
        )
        .await
    }

    pub async fn put_network_interface(
        &mut self,
        iface_id: &str,
        host_dev_name: &str,
        guest_mac: Option<String>,
    ) -> Result<(), VmmProcessError> {
        self.put(
            &format!("/network-interfaces/{iface_id}"),
            &NetworkInterface {
                iface_id: iface_id.to_string(),
                host_dev_name: host_dev_name.to_string(),
                guest_mac,
            },
        )
        .await
    }

    pub async fn patch_network_interface(
        &mut self,
        iface_id: &str,
        host_dev_name: &str,
    ) -> Result<(), VmmProcessError> {
        self.patch(
            &format!("/network-interfaces/{iface_id}"),
            &PatchNetworkInterface {
                iface_id: iface_id.to_string(),
                host_dev_name: host_dev_name.to_string(),
            },
        )
        .await
    }

    pub async fn put_vsock(&mut self, guest_cid: u32, uds_path: &Path) -> Result<(), VmmProcessError> {
        self.put(
            "/vsock",
            &VsockDevice {
                guest_cid,
                uds_path: uds_path.to_path_buf(),
                vsock_id: "vsock0".to_string(),
            },
        )
        .await
    }

    pub async fn instance_start(&mut self) -> Result<(), VmmProcessError> {
        self.put(
            "/actions",
            &InstanceActionInfo {
                action_type: ActionType::InstanceStart,
            },
        )
        .await
    }

    pub async fn send_ctrl_alt_del(&mut self) -> Result<(), VmmProcessError> {
        self.put(
            "/actions",
            &InstanceActionInfo {
                action_type: ActionType::SendCtrlAltDel,
            },
        )
        .await
    }

    pub async fn pause(&mut self) -> Result<(), VmmProcessError> {
        self.patch("/vm", &PatchVmState { state: ApiVmState::Paused }).await
    }

    pub async fn resume(&mut self) -> Result<(), VmmProcessError> {
        self.patch("/vm", &PatchVmState { state: ApiVmState::Resumed }).await
    }

    pub async fn create_snapshot(&mut self, snapshot_path: &Path, mem_path: &Path) -> Result<(), VmmProcessError> {
        self.put(
            "/snapshot/create",
            &CreateSnapshot {
                snapshot_path: snapshot_path.to_path_buf(),
                mem_file_path: mem_path.to_path_buf(),
                snapshot_type: None,
            },
        )
        .await
    }

    /// Load a snapshot. `resume_vm` controls whether Firecracker resumes the
    /// VM as part of the same request; the supervisor always passes `false`
    /// and calls `resume` explicitly so restore-recovery can retry
    /// `load_snapshot` without double-resuming.
    pub async fn load_snapshot(&mut self, snapshot_path: &Path, mem_path: &Path) -> Result<(), VmmProcessError> {
        self.put(
            "/snapshot/load",
            &LoadSnapshot {
                snapshot_path: snapshot_path.to_path_buf(),
                mem_backend: MemoryBackend {
                    backend_type: MemoryBackendType::File,
                    backend_path: mem_path.to_path_buf(),
                },
                enable_diff_snapshots: false,
                resume_vm: false,
            },
        )
        .await
    }

    async fn put<B: serde::Serialize>(&mut self, route: &str, body: &B) -> Result<(), VmmProcessError> {
        self.send("PUT", route, body).await
    }

    async fn patch<B: serde::Serialize>(&mut self, route: &str, body: &B) -> Result<(), VmmProcessError> {
        self.send("PATCH", route, body).await
    }

    async fn send<B: serde::Serialize>(
        &mut self,
        method: &str,
        route: &str,
        body: &B,
    ) -> Result<(), VmmProcessError> {
        let json = serde_json::to_vec(body).expect("DTOs always serialize");
        tracing::debug!(method, route, "sending VMM API request");

        let request = Request::builder()
            .method(method)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .map_err(VmmProcessError::RequestNotBuilt)?;

        let mut response = self.process.send_api_request(route, request).await?;
        let status = response.status();
        tracing::debug!(method, route, %status, "VMM API response");

        if !status.is_success() {
            let fault_message = response
                .recv_to_string()
                .await
                .map_err(VmmProcessError::ResponseBodyFailed)
                .unwrap_or_default();
            return Err(VmmProcessError::ApiRespondedWithFault {
                status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                fault_message,
            });
        }

        Ok(())
    }
}
