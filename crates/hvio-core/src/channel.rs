//! Per-vCPU request slots shared between the hypervisor and the device model.
//!
//! Every vCPU owns exactly one slot. The slot's state word moves through
//! `Free -> Pending -> Processing -> Complete -> Free`; each arrow has exactly one writer:
//!
//! - the vCPU submits (`Free -> Pending`) and releases (`Complete -> Free`),
//! - the device model claims (`Pending -> Processing`) and completes (`Processing -> Complete`).
//!
//! Transitions are compare-exchanges on the state word, so a side that loses a race observes the
//! state it lost to instead of corrupting the record. The record itself is only written by the
//! side that currently owns the slot.

use crate::error::{IoEmulError, Result};
use crate::protocol::{decode_request, encode_request, SLOT_RECORD_BYTES};
use crate::request::{Direction, IoAccess, RequestState};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Out-of-band notification to the device model that a slot became pending.
///
/// Called on the submitting vCPU's thread, after the slot is visible as `Pending`.
pub trait DeviceModelNotifier: Send + Sync {
    fn request_pending(&self, vm_id: u16, vcpu_id: u16);
}

/// Identifies one deferred request. `seq` increases with every submission on the slot, so a
/// token from an earlier request never matches a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionToken {
    pub vm_id: u16,
    pub vcpu_id: u16,
    pub seq: u64,
}

pub struct RequestSlot {
    state: AtomicU32,
    seq: AtomicU64,
    record: Mutex<[u8; SLOT_RECORD_BYTES]>,
}

impl RequestSlot {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(RequestState::Free as u32),
            seq: AtomicU64::new(0),
            record: Mutex::new([0; SLOT_RECORD_BYTES]),
        }
    }

    pub fn state(&self) -> RequestState {
        // Only this module stores into the word, always from a `RequestState`.
        RequestState::from_raw(self.state.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Sequence number of the most recent submission.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    fn transition(&self, vcpu_id: u16, from: RequestState, to: RequestState) -> Result<()> {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|raw| IoEmulError::UnexpectedState {
                vcpu_id,
                expected: from,
                found: RequestState::from_raw(raw).unwrap_or_default(),
            })
    }

    fn record(&self) -> MutexGuard<'_, [u8; SLOT_RECORD_BYTES]> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> Result<IoAccess> {
        Ok(decode_request(&self.record()[..])?)
    }

    fn write(&self, access: &IoAccess) {
        *self.record() = encode_request(access);
    }
}

/// The request slots of one VM plus the wakeup plumbing for both sides.
pub struct RequestChannel {
    vm_id: u16,
    slots: Box<[RequestSlot]>,
    /// Bumped on every state change; both condvars wait on it.
    events: Mutex<u64>,
    completed: Condvar,
    pending: Condvar,
}

impl RequestChannel {
    pub fn new(vm_id: u16, vcpu_num: u16) -> Self {
        Self {
            vm_id,
            slots: (0..vcpu_num).map(|_| RequestSlot::new()).collect(),
            events: Mutex::new(0),
            completed: Condvar::new(),
            pending: Condvar::new(),
        }
    }

    pub fn vm_id(&self) -> u16 {
        self.vm_id
    }

    pub fn vcpu_num(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn slot(&self, vcpu_id: u16) -> Result<&RequestSlot> {
        self.slots
            .get(usize::from(vcpu_id))
            .ok_or(IoEmulError::NoSuchVcpu {
                vm_id: self.vm_id,
                vcpu_id,
            })
    }

    pub fn state(&self, vcpu_id: u16) -> Result<RequestState> {
        Ok(self.slot(vcpu_id)?.state())
    }

    fn events(&self) -> MutexGuard<'_, u64> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self, cv: &Condvar) {
        let mut guard = self.events();
        *guard = guard.wrapping_add(1);
        cv.notify_all();
    }

    // ---------------------------------------------------------------------
    // vCPU side
    // ---------------------------------------------------------------------

    /// Publishes `access` in the vCPU's slot and marks it `Pending`.
    pub(crate) fn submit(
        &self,
        vcpu_id: u16,
        access: &IoAccess,
        notifier: Option<&dyn DeviceModelNotifier>,
    ) -> Result<CompletionToken> {
        let slot = self.slot(vcpu_id)?;
        let state = slot.state();
        if state != RequestState::Free {
            return Err(IoEmulError::RequestInFlight { vcpu_id, state });
        }

        slot.write(access);
        let seq = slot.seq.fetch_add(1, Ordering::AcqRel) + 1;
        slot.transition(vcpu_id, RequestState::Free, RequestState::Pending)?;
        self.bump(&self.pending);

        if let Some(notifier) = notifier {
            notifier.request_pending(self.vm_id, vcpu_id);
        }
        Ok(CompletionToken {
            vm_id: self.vm_id,
            vcpu_id,
            seq,
        })
    }

    /// Returns the completed request without releasing the slot.
    pub(crate) fn completed(&self, vcpu_id: u16) -> Result<IoAccess> {
        let slot = self.slot(vcpu_id)?;
        let found = slot.state();
        if found != RequestState::Complete {
            return Err(IoEmulError::UnexpectedState {
                vcpu_id,
                expected: RequestState::Complete,
                found,
            });
        }
        slot.read()
    }

    /// `Complete -> Free`.
    pub(crate) fn release(&self, vcpu_id: u16) -> Result<()> {
        self.slot(vcpu_id)?
            .transition(vcpu_id, RequestState::Complete, RequestState::Free)?;
        self.bump(&self.pending);
        Ok(())
    }

    /// Blocks until the vCPU's slot is `Complete`.
    ///
    /// `timeout: None` waits forever. With `polling` the caller spins on the state word instead
    /// of sleeping on the condition variable.
    pub fn wait_for_completion(
        &self,
        vcpu_id: u16,
        timeout: Option<Duration>,
        polling: bool,
    ) -> Result<()> {
        let slot = self.slot(vcpu_id)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let timed_out = || {
            tracing::error!(vm_id = self.vm_id, vcpu_id, ?timeout, "I/O completion timed out");
            IoEmulError::CompletionTimeout {
                vcpu_id,
                timeout: timeout.unwrap_or_default(),
            }
        };

        if polling {
            while slot.state() != RequestState::Complete {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(timed_out());
                }
                std::hint::spin_loop();
                std::thread::yield_now();
            }
            return Ok(());
        }

        let mut guard = self.events();
        while slot.state() != RequestState::Complete {
            guard = match deadline {
                None => self
                    .completed
                    .wait(guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(timed_out());
                    }
                    self.completed
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Device-model side
    // ---------------------------------------------------------------------

    /// vCPUs whose slot is `Pending`, in vCPU order.
    pub fn pending_vcpus(&self) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state() == RequestState::Pending)
            .map(|(id, _)| id as u16)
            .collect()
    }

    /// Claims a pending request: `Pending -> Processing`.
    pub fn take(&self, vcpu_id: u16) -> Result<IoAccess> {
        let slot = self.slot(vcpu_id)?;
        slot.transition(vcpu_id, RequestState::Pending, RequestState::Processing)?;
        slot.read()
    }

    /// Finishes a claimed request: `Processing -> Complete`, then wakes the vCPU.
    ///
    /// `value` is stored (truncated to the access size) for reads and ignored for writes.
    pub fn complete(&self, vcpu_id: u16, value: u64) -> Result<()> {
        let slot = self.slot(vcpu_id)?;
        let found = slot.state();
        if found != RequestState::Processing {
            return Err(IoEmulError::UnexpectedState {
                vcpu_id,
                expected: RequestState::Processing,
                found,
            });
        }

        let mut access = slot.read()?;
        if access.direction() == Direction::Read {
            access.set_value(value);
            slot.write(&access);
        }
        slot.transition(vcpu_id, RequestState::Processing, RequestState::Complete)?;
        self.bump(&self.completed);
        Ok(())
    }

    /// Blocks until at least one slot is `Pending` and returns the pending vCPUs. Returns an
    /// empty list on timeout.
    pub fn wait_for_pending(&self, timeout: Option<Duration>) -> Vec<u16> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.events();
        loop {
            let pending = self.pending_vcpus();
            if !pending.is_empty() {
                return pending;
            }
            guard = match deadline {
                None => self
                    .pending
                    .wait(guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return pending;
                    }
                    self.pending
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }
}

impl std::fmt::Debug for RequestChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestChannel")
            .field("vm_id", &self.vm_id)
            .field(
                "states",
                &self.slots.iter().map(RequestSlot::state).collect::<Vec<_>>(),
            )
            .finish()
    }
}
