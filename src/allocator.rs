//! Persistent free-list allocators for guest CIDs and vsock ports.
//!
//! Both allocators share the same shape: a monotonically increasing
//! counter plus a sorted free-list of released values, flushed to disk
//! before every mutating call returns so that a crash can leak an
//! allocation but never hand out the same value twice.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("an I/O error occurred persisting allocator state: `{0}`")]
    Io(#[from] std::io::Error),
    #[error("allocator state file was malformed: `{0}`")]
    Malformed(#[from] serde_json::Error),
    #[error("port range exhausted")]
    PortRangeExhausted,
}

#[derive(Debug, Serialize, Deserialize)]
struct FreeListState {
    next: u32,
    free: Vec<u32>,
}

/// A persisted free-list counter: the building block for both the CID and
/// port allocators.
#[derive(Debug)]
struct FreeListAllocator {
    path: PathBuf,
    state: FreeListState,
    max: Option<u32>,
}

impl FreeListAllocator {
    async fn load_or_new(path: PathBuf, base: u32, max: Option<u32>) -> Result<Self, AllocatorError> {
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => FreeListState {
                next: base,
                free: Vec::new(),
            },
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, state, max })
    }

    async fn flush(&self) -> Result<(), AllocatorError> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    async fn allocate(&mut self) -> Result<u32, AllocatorError> {
        let value = if !self.state.free.is_empty() {
            self.state.free.remove(0)
        } else {
            let value = self.state.next;
            if let Some(max) = self.max {
                if value > max {
                    return Err(AllocatorError::PortRangeExhausted);
                }
            }
            self.state.next += 1;
            value
        };
        self.flush().await?;
        Ok(value)
    }

    async fn release(&mut self, value: u32) -> Result<(), AllocatorError> {
        if !self.state.free.contains(&value) {
            self.state.free.push(value);
            self.state.free.sort_unstable();
        }
        self.flush().await
    }
}

/// Allocates guest CIDs starting at 3 (0-2 are reserved; 2 is the host).
#[derive(Debug)]
pub struct CidAllocator {
    inner: Mutex<FreeListAllocator>,
}

impl CidAllocator {
    pub const BASE_CID: u32 = 3;

    pub async fn load(state_path: impl Into<PathBuf>) -> Result<Self, AllocatorError> {
        let inner = FreeListAllocator::load_or_new(state_path.into(), Self::BASE_CID, None).await?;
        Ok(Self { inner: Mutex::new(inner) })
    }

    pub async fn allocate(&self) -> Result<u32, AllocatorError> {
        self.inner.lock().await.allocate().await
    }

    pub async fn release(&self, cid: u32) -> Result<(), AllocatorError> {
        self.inner.lock().await.release(cid).await
    }
}

/// Allocates vsock listener ports. The fixed-port mode always returns the
/// same port (see DESIGN.md Open Question 1); the pooled mode allocates
/// sequentially out of 9000-9999 with free-list reuse.
#[derive(Debug)]
pub enum PortAllocator {
    Fixed(u16),
    Pooled(Mutex<FreeListAllocator>),
}

impl PortAllocator {
    pub const DEFAULT_PORT: u16 = 9000;
    pub const POOL_MAX: u32 = 9999;

    pub fn fixed() -> Self {
        PortAllocator::Fixed(Self::DEFAULT_PORT)
    }

    pub async fn pooled(state_path: impl Into<PathBuf>) -> Result<Self, AllocatorError> {
        let inner = FreeListAllocator::load_or_new(
            state_path.into(),
            Self::DEFAULT_PORT as u32,
            Some(Self::POOL_MAX),
        )
        .await?;
        Ok(PortAllocator::Pooled(Mutex::new(inner)))
    }

    pub async fn allocate(&self) -> Result<u16, AllocatorError> {
        match self {
            PortAllocator::Fixed(port) => Ok(*port),
            PortAllocator::Pooled(inner) => Ok(inner.lock().await.allocate().await? as u16),
        }
    }

    pub async fn release(&self, port: u16) -> Result<(), AllocatorError> {
        match self {
            PortAllocator::Fixed(_) => Ok(()),
            PortAllocator::Pooled(inner) => inner.lock().await.release(port as u32).await,
        }
    }
}

pub fn default_state_path(root: impl AsRef<Path>, name: &str) -> PathBuf {
    root.as_ref().join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cid_allocator_reuses_released_values() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = CidAllocator::load(dir.path().join("cid_allocator.json")).await.unwrap();

        assert_eq!(allocator.allocate().await.unwrap(), 3);
        assert_eq!(allocator.allocate().await.unwrap(), 4);
        allocator.release(3).await.unwrap();
        assert_eq!(allocator.allocate().await.unwrap(), 3);
        assert_eq!(allocator.allocate().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn release_twice_does_not_duplicate_free_list() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = CidAllocator::load(dir.path().join("cid_allocator.json")).await.unwrap();
        allocator.allocate().await.unwrap();
        allocator.release(3).await.unwrap();
        allocator.release(3).await.unwrap();
        assert_eq!(allocator.allocate().await.unwrap(), 3);
        assert_eq!(allocator.allocate().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cid_allocator.json");
        {
            let allocator = CidAllocator::load(&path).await.unwrap();
            allocator.allocate().await.unwrap();
            allocator.allocate().await.unwrap();
        }
        let allocator = CidAllocator::load(&path).await.unwrap();
        assert_eq!(allocator.allocate().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn fixed_port_allocator_never_changes() {
        let allocator = PortAllocator::fixed();
        assert_eq!(allocator.allocate().await.unwrap(), 9000);
        allocator.release(9000).await.unwrap();
        assert_eq!(allocator.allocate().await.unwrap(), 9000);
    }

    #[tokio::test]
    async fn pooled_port_allocator_reuses_released_values() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = PortAllocator::pooled(dir.path().join("port_allocator.json")).await.unwrap();
        assert_eq!(allocator.allocate().await.unwrap(), 9000);
        assert_eq!(allocator.allocate().await.unwrap(), 9001);
        allocator.release(9000).await.unwrap();
        assert_eq!(allocator.allocate().await.unwrap(), 9000);
    }
}
