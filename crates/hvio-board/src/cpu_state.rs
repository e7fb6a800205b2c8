//! CPU performance (P-state) and idle (C-state) tables, as reported by ACPI `_PSS`/`_CST`.

use crate::acpi::AcpiGenericAddress;
use crate::{BoardError, Result};
use serde::{Deserialize, Serialize};

pub const MAX_PSTATE: usize = 20;
pub const MAX_CSTATE: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuPxData {
    /// MHz.
    pub core_frequency: u64,
    /// mW.
    pub power: u64,
    /// us.
    pub transition_latency: u64,
    /// us.
    pub bus_master_latency: u64,
    pub control: u64,
    pub status: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuCxData {
    pub cx_reg: AcpiGenericAddress,
    #[serde(rename = "type")]
    pub cx_type: u8,
    /// us.
    pub latency: u32,
    /// mW.
    pub power: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStateTable {
    pub model_name: String,
    pub px_data: Vec<CpuPxData>,
    pub cx_data: Vec<CpuCxData>,
}

impl CpuStateTable {
    pub fn is_empty(&self) -> bool {
        self.px_data.is_empty() && self.cx_data.is_empty()
    }

    /// Whether this table describes the CPU identified by `brand` (the CPUID brand string).
    pub fn matches_model(&self, brand: &str) -> bool {
        !self.model_name.is_empty() && brand.trim() == self.model_name.trim()
    }

    /// C-state entries whose entry register is a system-I/O port (`_CST` "I/O port" method).
    pub fn io_cx_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.cx_data
            .iter()
            .filter(|cx| cx.cx_reg.is_system_io() && cx.cx_reg.is_present())
            .filter_map(|cx| u16::try_from(cx.cx_reg.address).ok())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.px_data.len() > MAX_PSTATE {
            return Err(BoardError::TooManyCpuStates {
                kind: 'P',
                model: self.model_name.clone(),
                count: self.px_data.len(),
                max: MAX_PSTATE,
            });
        }
        if self.cx_data.len() > MAX_CSTATE {
            return Err(BoardError::TooManyCpuStates {
                kind: 'C',
                model: self.model_name.clone(),
                count: self.cx_data.len(),
                max: MAX_CSTATE,
            });
        }
        Ok(())
    }
}
