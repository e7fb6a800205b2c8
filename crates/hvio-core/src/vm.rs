//! Per-VM emulation state: configuration, handler registries, pass-through bitmap, and the
//! device-model request channel.
//!
//! Everything except the channel is configured through `&mut Vm` before [`Vm::launch`]. After
//! launch the VM is typically shared as `Arc<Vm>` across vCPU threads and only read.

use crate::bitmap::IoBitmap;
use crate::channel::{DeviceModelNotifier, RequestChannel};
use crate::error::{IoEmulError, Result};
use crate::mmio::{MmioHandler, MmioRegistry, PrivateData};
use crate::pio::{PioIndex, PioRange, PioReadFn, PioRegistry, PioWriteFn};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_COMPLETION_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOrder {
    /// Started by the hypervisor before the Service VM. Has no device model.
    PreLaunched,
    /// Hosts the device model; owns every port not claimed elsewhere.
    ServiceVm,
    /// Started by the Service VM; unhandled accesses go to the device model.
    #[default]
    PostLaunched,
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct GuestFlags: u64 {
        /// Spin on the request slot instead of sleeping while the device model works.
        const IO_COMPLETION_POLLING = 1 << 0;
        const LAPIC_PASSTHROUGH = 1 << 1;
        const RT = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub vm_id: u16,
    pub name: String,
    pub load_order: LoadOrder,
    pub vcpu_num: u16,
    pub guest_flags: GuestFlags,
    /// Upper bound on a completion wait. `0` waits forever.
    pub completion_timeout_ms: u64,
    /// Guest RAM in bytes.
    pub mem_size: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            vm_id: 0,
            name: String::new(),
            load_order: LoadOrder::default(),
            vcpu_num: 1,
            guest_flags: GuestFlags::empty(),
            completion_timeout_ms: DEFAULT_COMPLETION_TIMEOUT_MS,
            mem_size: 0,
        }
    }
}

impl VmConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        tracing::debug!(vm_id = config.vm_id, name = %config.name, "loaded VM config");
        Ok(config)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        (self.completion_timeout_ms != 0).then(|| Duration::from_millis(self.completion_timeout_ms))
    }

    pub fn has_device_model(&self) -> bool {
        self.load_order != LoadOrder::PreLaunched
    }
}

pub struct Vm {
    config: VmConfig,
    pio: PioRegistry,
    mmio: MmioRegistry,
    passthrough: IoBitmap,
    channel: RequestChannel,
    notifier: Option<Arc<dyn DeviceModelNotifier>>,
    launched: bool,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let passthrough = match config.load_order {
            LoadOrder::ServiceVm => IoBitmap::passthrough_all(),
            LoadOrder::PreLaunched | LoadOrder::PostLaunched => IoBitmap::intercept_all(),
        };
        let channel = RequestChannel::new(config.vm_id, config.vcpu_num);
        Self {
            config,
            pio: PioRegistry::new(),
            mmio: MmioRegistry::new(),
            passthrough,
            channel,
            notifier: None,
            launched: false,
        }
    }

    pub fn id(&self) -> u16 {
        self.config.vm_id
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn is_launched(&self) -> bool {
        self.launched
    }

    /// Freezes the registries. Later registration attempts fail with `InvalidArgument`.
    pub fn launch(&mut self) {
        self.launched = true;
        tracing::info!(
            vm_id = self.id(),
            pio = ?self.pio,
            mmio = ?self.mmio,
            "VM launched"
        );
    }

    pub fn set_device_model_notifier(&mut self, notifier: Arc<dyn DeviceModelNotifier>) {
        self.notifier = Some(notifier);
    }

    pub(crate) fn notifier(&self) -> Option<&dyn DeviceModelNotifier> {
        self.notifier.as_deref()
    }

    pub fn channel(&self) -> &RequestChannel {
        &self.channel
    }

    pub fn pio_registry(&self) -> &PioRegistry {
        &self.pio
    }

    pub fn mmio_registry(&self) -> &MmioRegistry {
        &self.mmio
    }

    fn ensure_configurable(&self) -> Result<()> {
        if self.launched {
            tracing::warn!(vm_id = self.id(), "registration after launch rejected");
            return Err(IoEmulError::InvalidArgument("VM already launched"));
        }
        Ok(())
    }

    /// Binds a read/write pair to a well-known device index and stops passing its ports
    /// through. Re-registering an index replaces the previous binding, and the ports it no
    /// longer covers go back to the load order's default.
    pub fn register_pio_emulation_handler(
        &mut self,
        index: PioIndex,
        range: PioRange,
        read: PioReadFn,
        write: PioWriteFn,
    ) -> Result<()> {
        self.ensure_configurable()?;
        let previous = self.pio.range(index);
        self.pio.register(index, range, read, write)?;
        if let Some(old) = previous {
            if self.config.load_order == LoadOrder::ServiceVm {
                self.passthrough.allow(old.base, u32::from(old.len));
            }
        }
        self.passthrough.deny(range.base, u32::from(range.len));
        tracing::debug!(vm_id = self.id(), ?index, ?range, "PIO handler registered");
        Ok(())
    }

    /// Claims `[start, end)` for `handler`.
    pub fn register_mmio_emulation_handler(
        &mut self,
        handler: Option<Arc<dyn MmioHandler>>,
        start: u64,
        end: u64,
        private: Option<PrivateData>,
    ) -> Result<()> {
        self.ensure_configurable()?;
        let handler = handler.ok_or_else(|| {
            tracing::warn!(vm_id = self.id(), start, end, "MMIO registration without handler");
            IoEmulError::InvalidArgument("missing MMIO handler")
        })?;
        self.mmio.insert(handler, start, end, private)?;
        tracing::debug!(vm_id = self.id(), start, end, "MMIO handler registered");
        Ok(())
    }

    pub fn allow_guest_pio_access(&mut self, port: u16, nbytes: u32) {
        self.passthrough.allow(port, nbytes);
    }

    pub fn deny_guest_pio_access(&mut self, port: u16, nbytes: u32) {
        self.passthrough.deny(port, nbytes);
    }

    /// True when every byte of the access reaches hardware directly.
    pub fn is_pio_passthrough(&self, port: u16, size: u8) -> bool {
        self.passthrough.covers(port, size)
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("config", &self.config)
            .field("launched", &self.launched)
            .field("pio", &self.pio)
            .field("mmio", &self.mmio)
            .field("passthrough", &self.passthrough)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
