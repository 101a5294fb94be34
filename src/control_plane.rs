//! Top-level VM registry (spec component C9): storage layout, the CID/port
//! allocators, and the create/list/get/delete/snapshot/restore operations
//! that sit above a single [`crate::supervisor::Supervisor`].
//!
//! Grounded on `bandsox/core.py`'s `BandSox` class: one root directory per
//! control plane, metadata files as the source of truth for VMs not
//! currently held live, and `create_vm`/`restore_vm`/`delete_vm` as the
//! primary surface.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::{
    allocator::{default_state_path, AllocatorError, CidAllocator, PortAllocator},
    model::{NetworkConfig, SnapshotRecord, VmRecord, VmStatus, VsockConfig},
    supervisor::{self, Supervisor, SupervisorError, SupervisorMode, SupervisorPaths, VmLifecycleState},
};

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("malformed metadata: `{0}`")]
    Malformed(#[from] serde_json::Error),
    #[error("no VM with id `{0}`")]
    VmNotFound(String),
    #[error("no snapshot named `{0}`")]
    SnapshotNotFound(String),
    #[error("a VM with id `{0}` already exists")]
    VmAlreadyExists(String),
}

/// Root-directory layout and allocator policy for one control plane
/// instance. See DESIGN.md Open Question 1 for the fixed-vs-pooled port
/// tradeoff `pooled_ports` selects between.
pub struct ControlPlaneConfig {
    pub root: PathBuf,
    pub vmm_binary_path: PathBuf,
    pub pooled_ports: bool,
}

impl ControlPlaneConfig {
    pub fn new(vmm_binary_path: impl Into<PathBuf>) -> Self {
        Self {
            root: PathBuf::from("/var/lib/bandsox"),
            vmm_binary_path: vmm_binary_path.into(),
            pooled_ports: false,
        }
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn pooled_ports(mut self, pooled: bool) -> Self {
        self.pooled_ports = pooled;
        self
    }
}

/// Description of a VM to create. `rootfs_source` is copied (not moved)
/// into the control plane's per-instance storage so the caller's source
/// image is never mutated.
pub struct CreateVmSpec {
    pub name: Option<String>,
    pub image: String,
    pub kernel_path: PathBuf,
    pub boot_args: Option<String>,
    pub rootfs_source: PathBuf,
    pub vcpu: u32,
    pub mem_mib: u32,
    pub network: Option<NetworkConfig>,
    pub enable_vsock: bool,
}

pub struct ControlPlane {
    config: ControlPlaneConfig,
    cid_allocator: CidAllocator,
    port_allocator: PortAllocator,
    supervisors: Mutex<HashMap<String, Arc<Supervisor>>>,
}

impl ControlPlane {
    pub async fn new(config: ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        for dir in ["images", "snapshots", "sockets", "metadata", "vsock"] {
            tokio::fs::create_dir_all(config.root.join(dir)).await?;
        }

        let cid_allocator = CidAllocator::load(default_state_path(&config.root, "cid_allocator.json")).await?;
        let port_allocator = if config.pooled_ports {
            PortAllocator::pooled(default_state_path(&config.root, "port_allocator.json")).await?
        } else {
            PortAllocator::fixed()
        };

        Ok(Self {
            config,
            cid_allocator,
            port_allocator,
            supervisors: Mutex::new(HashMap::new()),
        })
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.config.root.join("metadata").join(format!("{id}.json"))
    }

    fn paths_for(&self, id: &str, vsock_enabled: bool) -> SupervisorPaths {
        SupervisorPaths {
            control_socket_path: self.config.root.join("sockets").join(format!("{id}.sock")),
            console_socket_path: self.config.root.join("sockets").join(format!("{id}.console.sock")),
            vsock_uds_path: vsock_enabled.then(|| self.config.root.join("vsock").join(format!("vsock_{id}.sock"))),
        }
    }

    async fn save_record(&self, record: &VmRecord) -> Result<(), ControlPlaneError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let path = self.metadata_path(&record.id);
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn load_record(&self, id: &str) -> Result<VmRecord, ControlPlaneError> {
        let bytes = tokio::fs::read(self.metadata_path(id))
            .await
            .map_err(|_| ControlPlaneError::VmNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Create pipeline (spec.md §4.8, steps 1-6): allocate resources, spawn
    /// and configure the VMM, start the vsock listener, and persist the
    /// record.
    pub async fn create_vm(&self, id: String, spec: CreateVmSpec) -> Result<VmRecord, ControlPlaneError> {
        if tokio::fs::try_exists(self.metadata_path(&id)).await.unwrap_or(false) {
            return Err(ControlPlaneError::VmAlreadyExists(id));
        }

        let instance_dir = self.config.root.join("images").join(&id);
        tokio::fs::create_dir_all(&instance_dir).await?;
        let rootfs_path = instance_dir.join("rootfs.ext4");
        tokio::fs::copy(&spec.rootfs_source, &rootfs_path).await?;

        let cid = if spec.enable_vsock {
            Some(self.cid_allocator.allocate().await?)
        } else {
            None
        };
        let port = if spec.enable_vsock {
            match self.port_allocator.allocate().await {
                Ok(port) => Some(port),
                Err(err) => {
                    self.release_allocations(cid, None).await;
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let paths = self.paths_for(&id, spec.enable_vsock);
        let supervisor = match Supervisor::create(id.clone(), &self.config.vmm_binary_path, paths.clone(), cid).await {
            Ok(supervisor) => supervisor,
            Err(err) => {
                self.release_allocations(cid, port).await;
                return Err(err.into());
            }
        };

        let vsock_config = match (cid, port) {
            (Some(cid), Some(port)) => {
                let uds_path = paths.vsock_uds_path.clone().expect("vsock paths present when enable_vsock is set");
                let result = supervisor
                    .configure_and_start(
                        &spec.kernel_path,
                        spec.boot_args.clone(),
                        &rootfs_path,
                        spec.vcpu,
                        spec.mem_mib,
                        spec.network.as_ref().map(|net| {
                            (
                                net.tap_name.as_str(),
                                net.tap_name.as_str(),
                                Some(net.guest_mac.clone()),
                            )
                        }),
                        Some((cid, uds_path.as_path())),
                    )
                    .await;
                if let Err(err) = result {
                    self.abort_failed_create(supervisor, cid, port).await;
                    return Err(err.into());
                }
                Some(VsockConfig {
                    enabled: true,
                    cid,
                    port,
                    uds_path,
                    baked_uds_path: None,
                })
            }
            _ => {
                let result = supervisor
                    .configure_and_start(
                        &spec.kernel_path,
                        spec.boot_args.clone(),
                        &rootfs_path,
                        spec.vcpu,
                        spec.mem_mib,
                        spec.network.as_ref().map(|net| {
                            (
                                net.tap_name.as_str(),
                                net.tap_name.as_str(),
                                Some(net.guest_mac.clone()),
                            )
                        }),
                        None,
                    )
                    .await;
                if let Err(err) = result {
                    self.abort_failed_create(supervisor, cid, port).await;
                    return Err(err.into());
                }
                None
            }
        };

        let pid = supervisor.pid().await;
        let agent_ready = supervisor.router().is_agent_ready();
        let record = VmRecord {
            id: id.clone(),
            name: spec.name,
            image: spec.image,
            vcpu: spec.vcpu,
            mem_mib: spec.mem_mib,
            rootfs_path,
            network_config: spec.network,
            vsock_config,
            status: VmStatus::Running,
            pid,
            created_at: unix_timestamp(),
            agent_ready,
        };
        if let Err(err) = self.save_record(&record).await {
            self.abort_failed_create(supervisor, cid, port).await;
            return Err(err);
        }
        self.supervisors.lock().await.insert(id, Arc::new(supervisor));

        Ok(record)
    }

    /// Releases whatever of (cid, port) was actually allocated. Best-effort:
    /// a release failure is logged, not propagated, since the caller is
    /// already unwinding a different error.
    async fn release_allocations(&self, cid: Option<u32>, port: Option<u16>) {
        if let Some(cid) = cid {
            if let Err(err) = self.cid_allocator.release(cid).await {
                tracing::warn!(%err, cid, "failed to release cid while unwinding a failed create_vm");
            }
        }
        if let Some(port) = port {
            if let Err(err) = self.port_allocator.release(port).await {
                tracing::warn!(%err, port, "failed to release port while unwinding a failed create_vm");
            }
        }
    }

    /// Tears down a `Supervisor` whose VMM process was already spawned (and
    /// possibly started) when a later create_vm step failed, so it isn't
    /// left running with no persisted record to find it by.
    async fn abort_failed_create(&self, supervisor: Supervisor, cid: Option<u32>, port: Option<u16>) {
        if let Err(err) = supervisor.shutdown(Duration::from_secs(2)).await {
            tracing::warn!(%err, vm_id = %supervisor.vm_id, "failed to shut down supervisor while unwinding a failed create_vm");
        }
        self.release_allocations(cid, port).await;
    }

    /// Convenience wrapper that resolves `image` against `images/<image>`
    /// as the rootfs source instead of requiring a caller-provided path.
    pub async fn create_vm_from_image_spec(
        &self,
        id: String,
        image: &str,
        kernel_path: PathBuf,
        vcpu: u32,
        mem_mib: u32,
    ) -> Result<VmRecord, ControlPlaneError> {
        let rootfs_source = self.config.root.join("images").join(format!("{image}.ext4"));
        self.create_vm(
            id,
            CreateVmSpec {
                name: None,
                image: image.to_string(),
                kernel_path,
                boot_args: None,
                rootfs_source,
                vcpu,
                mem_mib,
                network: None,
                enable_vsock: true,
            },
        )
        .await
    }

    /// Lists every known VM, reconciling persisted status against whether a
    /// live supervisor is currently held for it.
    pub async fn list_vms(&self) -> Result<Vec<VmRecord>, ControlPlaneError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(self.config.root.join("metadata")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            records.push(serde_json::from_slice::<VmRecord>(&bytes)?);
        }
        Ok(records)
    }

    /// Returns a live supervisor for `id`, re-attaching to an already
    /// running VMM process if this control plane does not currently hold
    /// one (spec.md §4.9).
    pub async fn get_vm(&self, id: &str) -> Result<Arc<Supervisor>, ControlPlaneError> {
        if let Some(supervisor) = self.supervisors.lock().await.get(id) {
            return Ok(supervisor.clone());
        }

        let record = self.load_record(id).await?;
        let pid = record.pid.ok_or_else(|| ControlPlaneError::VmNotFound(id.to_string()))?;
        let paths = self.paths_for(id, record.vsock_config.is_some());
        let last_known_state = match record.status {
            VmStatus::Running => VmLifecycleState::Running,
            VmStatus::Paused => VmLifecycleState::Paused,
            VmStatus::Stopped => VmLifecycleState::Stopped,
        };

        let supervisor = Arc::new(Supervisor::attach(id.to_string(), pid, paths, last_known_state).await?);
        supervisor.wait_for_agent(Duration::from_secs(5)).await.ok();
        self.supervisors.lock().await.insert(id.to_string(), supervisor.clone());
        Ok(supervisor)
    }

    /// Shuts the VM down (if live), releases its allocated CID/port, and
    /// removes its on-disk state.
    pub async fn delete_vm(&self, id: &str) -> Result<(), ControlPlaneError> {
        let record = self.load_record(id).await?;

        if let Some(supervisor) = self.supervisors.lock().await.remove(id) {
            if supervisor.mode() == SupervisorMode::Owned {
                supervisor.shutdown(Duration::from_secs(5)).await?;
            }
        }

        if let Some(vsock_config) = &record.vsock_config {
            self.cid_allocator.release(vsock_config.cid).await?;
            self.port_allocator.release(vsock_config.port).await?;
        }

        let paths = self.paths_for(id, record.vsock_config.is_some());
        let _ = tokio::fs::remove_file(self.metadata_path(id)).await;
        let _ = tokio::fs::remove_dir_all(self.config.root.join("images").join(id)).await;
        let _ = tokio::fs::remove_file(&paths.control_socket_path).await;
        let _ = tokio::fs::remove_file(&paths.console_socket_path).await;
        if let Some(vsock_uds_path) = &paths.vsock_uds_path {
            let _ = tokio::fs::remove_file(vsock_uds_path).await;
            if let Some(vsock_config) = &record.vsock_config {
                let ported = PathBuf::from(format!("{}_{}", vsock_uds_path.display(), vsock_config.port));
                let _ = tokio::fs::remove_file(ported).await;
            }
        }
        Ok(())
    }

    pub async fn snapshot_vm(&self, id: &str, snapshot_name: &str) -> Result<SnapshotRecord, ControlPlaneError> {
        let supervisor = self.get_vm(id).await?;
        let record = self.load_record(id).await?;

        let snapshot_dir = self.config.root.join("snapshots").join(snapshot_name);
        tokio::fs::create_dir_all(&snapshot_dir).await?;
        let snapshot_path = snapshot_dir.join("snapshot.bin");
        let mem_path = snapshot_dir.join("mem.bin");

        supervisor.snapshot(&snapshot_path, &mem_path).await?;
        tokio::fs::copy(&record.rootfs_path, snapshot_dir.join("rootfs.ext4")).await?;

        let baked_uds_path = record.vsock_config.as_ref().map(|vsock| vsock.uds_path.clone());
        let snapshot_record = SnapshotRecord {
            snapshot_name: snapshot_name.to_string(),
            source_vm_id: id.to_string(),
            vm_record: record,
            baked_uds_path,
        };

        let bytes = serde_json::to_vec_pretty(&snapshot_record)?;
        tokio::fs::write(snapshot_dir.join("metadata.json"), bytes).await?;
        Ok(snapshot_record)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>, ControlPlaneError> {
        let mut snapshots = Vec::new();
        let mut entries = tokio::fs::read_dir(self.config.root.join("snapshots")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata_path = entry.path().join("metadata.json");
            if let Ok(bytes) = tokio::fs::read(&metadata_path).await {
                snapshots.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(snapshots)
    }

    pub async fn delete_snapshot(&self, snapshot_name: &str) -> Result<(), ControlPlaneError> {
        let snapshot_dir = self.config.root.join("snapshots").join(snapshot_name);
        if !tokio::fs::try_exists(&snapshot_dir).await.unwrap_or(false) {
            return Err(ControlPlaneError::SnapshotNotFound(snapshot_name.to_string()));
        }
        tokio::fs::remove_dir_all(&snapshot_dir).await?;
        Ok(())
    }

    /// Restore pipeline (spec.md §4.8): spawn a fresh VMM against a
    /// snapshot, recovering transparently from a missing backing-file fault
    /// via [`crate::supervisor::restore`].
    pub async fn restore_vm(&self, snapshot_name: &str, new_id: String) -> Result<VmRecord, ControlPlaneError> {
        let snapshot_dir = self.config.root.join("snapshots").join(snapshot_name);
        let metadata_bytes = tokio::fs::read(snapshot_dir.join("metadata.json"))
            .await
            .map_err(|_| ControlPlaneError::SnapshotNotFound(snapshot_name.to_string()))?;
        let snapshot_record: SnapshotRecord = serde_json::from_slice(&metadata_bytes)?;

        let instance_dir = self.config.root.join("images").join(&new_id);
        tokio::fs::create_dir_all(&instance_dir).await?;
        let rootfs_path = instance_dir.join("rootfs.ext4");
        tokio::fs::copy(snapshot_dir.join("rootfs.ext4"), &rootfs_path).await?;

        let vsock_enabled = snapshot_record.vm_record.vsock_config.is_some();
        let paths = self.paths_for(&new_id, vsock_enabled);

        let outcome = supervisor::restore(
            new_id.clone(),
            &self.config.vmm_binary_path,
            paths,
            &snapshot_dir.join("snapshot.bin"),
            &snapshot_dir.join("mem.bin"),
            &rootfs_path,
        )
        .await?;

        if outcome.recovered_missing_backing_file {
            tracing::warn!(vm_id = new_id, snapshot_name, "recovered restore from a missing snapshot backing file");
        }

        let mut record = snapshot_record.vm_record;
        record.id = new_id.clone();
        record.rootfs_path = rootfs_path;
        record.status = VmStatus::Running;
        record.pid = outcome.supervisor.pid().await;
        record.created_at = unix_timestamp();
        record.agent_ready = outcome.supervisor.router().is_agent_ready();
        self.save_record(&record).await?;

        self.supervisors
            .lock()
            .await
            .insert(new_id, Arc::new(outcome.supervisor));
        Ok(record)
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_creates_the_expected_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlPlaneConfig::new("/usr/bin/firecracker").root(dir.path());
        let _control_plane = ControlPlane::new(config).await.unwrap();

        for sub in ["images", "snapshots", "sockets", "metadata", "vsock"] {
            assert!(tokio::fs::try_exists(dir.path().join(sub)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn list_vms_is_empty_for_a_fresh_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlPlaneConfig::new("/usr/bin/firecracker").root(dir.path());
        let control_plane = ControlPlane::new(config).await.unwrap();
        assert!(control_plane.list_vms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_vm_on_unknown_id_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlPlaneConfig::new("/usr/bin/firecracker").root(dir.path());
        let control_plane = ControlPlane::new(config).await.unwrap();
        let err = control_plane.delete_vm("ghost").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::VmNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn paths_for_matches_the_documented_external_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControlPlaneConfig::new("/usr/bin/firecracker").root(dir.path());
        let control_plane = ControlPlane::new(config).await.unwrap();

        let paths = control_plane.paths_for("vm1", true);
        assert_eq!(paths.control_socket_path, dir.path().join("sockets").join("vm1.sock"));
        assert_eq!(
            paths.console_socket_path,
            dir.path().join("sockets").join("vm1.console.sock")
        );
        assert_eq!(
            paths.vsock_uds_path,
            Some(dir.path().join("vsock").join("vsock_vm1.sock"))
        );

        let paths_without_vsock = control_plane.paths_for("vm2", false);
        assert!(paths_without_vsock.vsock_uds_path.is_none());
    }
}
