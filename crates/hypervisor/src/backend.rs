//! Pluggable VM boot/pause/resume/shutdown backends.
//!
//! [`SandboxManager`](crate::sandbox::SandboxManager) drives every
//! provider through this trait rather than hard-coding a boot
//! sequence, mirroring `firecracker-sdk`'s own separation between
//! `FirecrackerBuilder` (assembles a not-yet-started instance) and
//! `Firecracker` (the running lifecycle: `start`, `pause`, `resume`,
//! `shutdown`, cleanup on `Drop`). [`SimulatedBackend`] stands in for
//! every provider in tests; [`FirecrackerBackend`] is the concrete
//! microVM adapter, grounded directly on that crate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use firecracker_sdk::dto::{BootSource, Drive as FcDrive, MachineConfiguration};
use firecracker_sdk::{Firecracker, FirecrackerBuilder};
use hv_types::error::{HvError, HvResult};
use hv_types::vm::VMSpec;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

#[async_trait]
pub trait VmBackend: Send + Sync {
    async fn boot(&self, vm_id: Uuid, spec: &VMSpec) -> HvResult<()>;
    async fn pause(&self, vm_id: Uuid) -> HvResult<()>;
    async fn resume(&self, vm_id: Uuid) -> HvResult<()>;
    async fn shutdown(&self, vm_id: Uuid) -> HvResult<()>;
}

/// Sleeps for a short fixed delay instead of booting anything real;
/// the default for `Container`/`Emulator` providers and for tests.
pub struct SimulatedBackend {
    delay: Duration,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(5),
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmBackend for SimulatedBackend {
    async fn boot(&self, _vm_id: Uuid, _spec: &VMSpec) -> HvResult<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn pause(&self, _vm_id: Uuid) -> HvResult<()> {
        Ok(())
    }

    async fn resume(&self, _vm_id: Uuid) -> HvResult<()> {
        Ok(())
    }

    async fn shutdown(&self, _vm_id: Uuid) -> HvResult<()> {
        Ok(())
    }
}

/// Boots real Firecracker microVMs for `Provider::Microvm` specs.
///
/// Each `vm_id` gets its own api socket under `run_dir`, following
/// `FirecrackerBuilder::with_api_socket_path`'s contract. `spec.kernel_image`
/// becomes the boot source, `spec.resources` the machine configuration, and
/// `spec.drives` the block devices; `pause`/`resume`/`shutdown` delegate
/// straight to the `Firecracker` handle kept per VM.
pub struct FirecrackerBackend {
    firecracker_binary: PathBuf,
    run_dir: PathBuf,
    instances: AsyncMutex<HashMap<Uuid, Arc<AsyncMutex<Firecracker>>>>,
}

impl FirecrackerBackend {
    pub fn new(firecracker_binary: PathBuf, run_dir: PathBuf) -> Self {
        Self {
            firecracker_binary,
            run_dir,
            instances: AsyncMutex::new(HashMap::new()),
        }
    }

    fn api_socket_path(&self, vm_id: Uuid) -> PathBuf {
        self.run_dir.join(format!("{vm_id}.sock"))
    }

    async fn get(&self, vm_id: Uuid) -> HvResult<Arc<AsyncMutex<Firecracker>>> {
        self.instances
            .lock()
            .await
            .get(&vm_id)
            .cloned()
            .ok_or_else(|| HvError::not_found(format!("no firecracker instance for {vm_id}")))
    }
}

#[async_trait]
impl VmBackend for FirecrackerBackend {
    async fn boot(&self, vm_id: Uuid, spec: &VMSpec) -> HvResult<()> {
        let api_socket = self.api_socket_path(vm_id);
        let mut builder = FirecrackerBuilder::new(self.firecracker_binary.clone());
        builder.with_api_socket_path(api_socket.clone());

        let mut firecracker = builder
            .build()
            .map_err(|e| HvError::Transport(format!("firecracker build failed: {e}")))?;

        if let Some(kernel_image) = &spec.kernel_image {
            firecracker
                .set_boot_source(BootSource {
                    kernel_image_path: kernel_image.clone(),
                    boot_args: None,
                    initrd_path: None,
                })
                .map_err(|e| HvError::Transport(e.to_string()))?;
        }

        firecracker
            .set_machine_config(MachineConfiguration {
                cpu_template: None,
                vcpu_count: (spec.resources.cpu_millicores / 1000).max(1) as isize,
                mem_size_mib: spec.resources.memory_mb as isize,
                smt: Some(false),
                track_dirty_pages: Some(false),
                huge_pages: None,
            })
            .map_err(|e| HvError::Transport(e.to_string()))?;

        for drive in &spec.drives {
            firecracker
                .add_drive(FcDrive {
                    drive_id: drive.id.clone(),
                    partuuid: None,
                    is_root_device: drive.root,
                    cache_type: None,
                    is_read_only: Some(drive.read_only),
                    path_on_host: Some(drive.host_path.clone()),
                    rate_limiter: None,
                    io_engine: None,
                    socket: None,
                })
                .map_err(|e| HvError::Transport(e.to_string()))?;
        }

        firecracker
            .start(api_socket)
            .await
            .map_err(|e| HvError::Transport(format!("firecracker start failed: {e}")))?;

        self.instances
            .lock()
            .await
            .insert(vm_id, Arc::new(AsyncMutex::new(firecracker)));
        Ok(())
    }

    async fn pause(&self, vm_id: Uuid) -> HvResult<()> {
        let firecracker = self.get(vm_id).await?;
        firecracker
            .lock()
            .await
            .pause()
            .await
            .map_err(|e| HvError::Transport(format!("firecracker pause failed: {e}")))
    }

    async fn resume(&self, vm_id: Uuid) -> HvResult<()> {
        let firecracker = self.get(vm_id).await?;
        firecracker
            .lock()
            .await
            .resume()
            .await
            .map_err(|e| HvError::Transport(format!("firecracker resume failed: {e}")))
    }

    async fn shutdown(&self, vm_id: Uuid) -> HvResult<()> {
        let firecracker = self.instances.lock().await.remove(&vm_id);
        if let Some(firecracker) = firecracker {
            firecracker
                .lock()
                .await
                .shutdown()
                .await
                .map_err(|e| HvError::Transport(format!("firecracker shutdown failed: {e}")))?;
        }
        Ok(())
    }
}
