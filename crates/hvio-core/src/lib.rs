//! I/O-emulation dispatch for a bare-metal hypervisor.
//!
//! A guest's port and MMIO accesses trap into the hypervisor, which routes each one to either an
//! in-hypervisor handler or the user-space device model. This crate provides:
//!
//! - [`Vm`]: per-VM handler registries ([`PioRegistry`], [`MmioRegistry`]) and the port
//!   pass-through bitmap ([`IoBitmap`])
//! - [`emulate_io`]: synchronous dispatch, resolving to [`IoResolution::Completed`] or
//!   [`IoResolution::Deferred`]
//! - [`RequestChannel`]: the per-vCPU request slots shared with the device model, encoded with
//!   [`protocol`]
//! - post-processing ([`emulate_io_post`] and friends) that copies results back into the vCPU
//! - [`pio_instr_vmexit_handler`]: the `IN`/`OUT` exit entry point
//!
//! Board-level descriptor tables live in `hvio_board`.

#![forbid(unsafe_code)]

mod bitmap;
mod channel;
mod dispatch;
mod error;
mod exit;
mod mmio;
mod pio;
mod post;
pub mod protocol;
mod request;
mod vcpu;
mod vm;

pub use bitmap::IoBitmap;
pub use channel::{CompletionToken, DeviceModelNotifier, RequestChannel, RequestSlot};
pub use dispatch::{emulate_io, IoResolution};
pub use error::{
    HandlerError, IoEmulError, Result, EBUSY, EINVAL, EIO, ENODEV, ETIMEDOUT, IOREQ_PENDING,
};
pub use exit::{pio_instr_vmexit_handler, IoExitInfo, VmExitAction};
pub use mmio::{MmioHandler, MmioRegistry, PrivateData};
pub use pio::{
    PioIndex, PioRange, PioReadFn, PioRegistry, PioWriteFn, EMUL_PIO_IDX_MAX,
    PCI_CONFIG_ADDR_PORT, PCI_CONFIG_DATA_PORT, PIC_ELC_PORT, PIC_MASTER_PORT, PIC_SLAVE_PORT,
    RTC_PORT, UART_COM1_PORT,
};
pub use post::{
    dm_emulate_mmio_post, dm_emulate_pio_post, emulate_io_post, emulate_mmio_post,
    emulate_pio_post, wait_for_io_completion, PostOutcome,
};
pub use request::{
    size_mask, Direction, IoAccess, IoRequest, MmioRequest, PciCfgRequest, PioRequest,
    RequestState, RequestType,
};
pub use vcpu::{Extend, GuestRegisters, Gpr, MmioDecode, Vcpu, VcpuState};
pub use vm::{GuestFlags, LoadOrder, Vm, VmConfig, DEFAULT_COMPLETION_TIMEOUT_MS};
