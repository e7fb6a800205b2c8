#![forbid(unsafe_code)]

//! Board-specific platform descriptor tables.
//!
//! These tables describe the physical machine the hypervisor runs on: DMA remapping units
//! ([`DmarInfo`]), cache-QoS classes of service ([`PlatformClosInfo`]), the CPU power-state table
//! ([`CpuStateTable`]) and the ACPI sleep-state register block ([`AcpiSstateInfo`]). They are
//! produced by board configuration (either a built-in board such as [`nuc6cayh`] or a JSON file
//! via [`BoardInfo::from_json`]) and are read-only once the hypervisor has booted.

pub mod acpi;
pub mod clos;
pub mod cpu_state;
pub mod dmar;
pub mod e820;
pub mod nuc6cayh;

pub use acpi::{AcpiGenericAddress, AcpiSstateInfo, SxData};
pub use clos::{PlatformClosInfo, MAX_PLATFORM_CLOS_NUM};
pub use cpu_state::{CpuCxData, CpuPxData, CpuStateTable};
pub use dmar::{DmarDevScope, DmarDrhd, DmarInfo, DrhdFlags};
pub use e820::{create_prelaunched_vm_e820, E820Entry, E820Type};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BoardError>;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("malformed board description: {0}")]
    Json(#[from] serde_json::Error),

    #[error("too many CLOS entries: {count} (max {max})")]
    TooManyClos { count: usize, max: usize },

    #[error("CLOS {index} has a non-contiguous capacity mask {mask:#x}")]
    NonContiguousClosMask { index: usize, mask: u32 },

    #[error("too many {kind}-states in table for {model}: {count} (max {max})")]
    TooManyCpuStates {
        kind: char,
        model: String,
        count: usize,
        max: usize,
    },

    #[error("invalid DMAR table: {0}")]
    InvalidDmar(&'static str),

    #[error("guest memory size {0:#x} is too small for a pre-launched VM")]
    GuestMemoryTooSmall(u64),
}

/// Everything the hypervisor core consumes from board configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardInfo {
    pub name: String,
    pub dmar: DmarInfo,
    pub clos: Vec<PlatformClosInfo>,
    pub cpu_state: CpuStateTable,
    pub sstate: AcpiSstateInfo,
}

impl BoardInfo {
    /// Parses and validates a board description.
    pub fn from_json(json: &str) -> Result<Self> {
        let info: BoardInfo = serde_json::from_str(json)?;
        info.validate()?;
        tracing::debug!(
            board = %info.name,
            drhd = info.dmar.drhd_units.len(),
            clos = info.clos.len(),
            px = info.cpu_state.px_data.len(),
            cx = info.cpu_state.cx_data.len(),
            "loaded board description"
        );
        Ok(info)
    }

    pub fn validate(&self) -> Result<()> {
        clos::validate(&self.clos)?;
        self.cpu_state.validate()?;
        self.dmar.validate()?;
        Ok(())
    }
}
