//! Interval registry of in-hypervisor MMIO handlers.

use crate::error::{HandlerError, IoEmulError, Result};
use crate::pio::Lookup;
use crate::request::MmioRequest;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Handler-specific context handed back to the handler on every access.
pub type PrivateData = Arc<dyn Any + Send + Sync>;

/// An in-hypervisor MMIO emulation handler.
///
/// Handlers run concurrently on every vCPU of a launched VM, so they take `&self` and keep any
/// mutable state behind their own synchronization. For reads the handler stores the result in
/// `req.value`; the address passed in is the absolute guest physical address.
pub trait MmioHandler: Send + Sync {
    fn access(
        &self,
        req: &mut MmioRequest,
        private: Option<&PrivateData>,
    ) -> std::result::Result<(), HandlerError>;
}

struct MmioRange {
    start: u64,
    end: u64,
    handler: Arc<dyn MmioHandler>,
    private: Option<PrivateData>,
}

/// MMIO ranges sorted by start address. Ranges never overlap, so end addresses are sorted too.
#[derive(Default)]
pub struct MmioRegistry {
    ranges: Vec<MmioRange>,
}

impl MmioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Registered `[start, end)` intervals in address order.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|r| (r.start, r.end))
    }

    pub(crate) fn insert(
        &mut self,
        handler: Arc<dyn MmioHandler>,
        start: u64,
        end: u64,
        private: Option<PrivateData>,
    ) -> Result<()> {
        if end <= start {
            return Err(IoEmulError::InvalidArgument("MMIO range end must exceed start"));
        }

        let idx = self.ranges.partition_point(|r| r.start < start);
        if let Some(prev) = idx.checked_sub(1).and_then(|i| self.ranges.get(i)) {
            if prev.end > start {
                tracing::warn!(
                    new_start = start,
                    new_end = end,
                    prev_start = prev.start,
                    prev_end = prev.end,
                    "overlapping MMIO range rejected"
                );
                return Err(IoEmulError::InvalidArgument("MMIO range overlaps a registered range"));
            }
        }
        if let Some(next) = self.ranges.get(idx) {
            if end > next.start {
                tracing::warn!(
                    new_start = start,
                    new_end = end,
                    next_start = next.start,
                    next_end = next.end,
                    "overlapping MMIO range rejected"
                );
                return Err(IoEmulError::InvalidArgument("MMIO range overlaps a registered range"));
            }
        }

        self.ranges.insert(
            idx,
            MmioRange {
                start,
                end,
                handler,
                private,
            },
        );
        Ok(())
    }

    /// Classifies the access `[address, address + size)`. The caller guarantees the end does not
    /// overflow.
    pub(crate) fn lookup(&self, address: u64, size: u8) -> Lookup<usize> {
        let end = address + u64::from(size);
        let idx = self.ranges.partition_point(|r| r.end <= address);
        let Some(r) = self.ranges.get(idx) else {
            return Lookup::Miss;
        };
        if r.start >= end {
            return Lookup::Miss;
        }
        if r.start <= address && end <= r.end {
            Lookup::Hit(idx)
        } else {
            Lookup::Spans
        }
    }

    pub(crate) fn dispatch(
        &self,
        idx: usize,
        req: &mut MmioRequest,
    ) -> std::result::Result<(), HandlerError> {
        let r = &self.ranges[idx];
        r.handler.access(req, r.private.as_ref())
    }
}

impl fmt::Debug for MmioRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ranges.iter().map(|r| r.start..r.end))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl MmioHandler for Nop {
        fn access(
            &self,
            _req: &mut MmioRequest,
            _private: Option<&PrivateData>,
        ) -> std::result::Result<(), HandlerError> {
            Ok(())
        }
    }

    fn registry(ranges: &[(u64, u64)]) -> MmioRegistry {
        let mut reg = MmioRegistry::new();
        for &(start, end) in ranges {
            reg.insert(Arc::new(Nop), start, end, None).unwrap();
        }
        reg
    }

    #[test]
    fn inserts_keep_address_order() {
        let reg = registry(&[(0x3000, 0x4000), (0x1000, 0x2000), (0x2000, 0x3000)]);
        assert_eq!(
            reg.ranges().collect::<Vec<_>>(),
            vec![(0x1000, 0x2000), (0x2000, 0x3000), (0x3000, 0x4000)]
        );
    }

    #[test]
    fn rejects_overlap_on_either_side() {
        let mut reg = registry(&[(0x1000, 0x2000), (0x4000, 0x5000)]);
        assert!(reg.insert(Arc::new(Nop), 0x1FFF, 0x3000, None).is_err());
        assert!(reg.insert(Arc::new(Nop), 0x3000, 0x4001, None).is_err());
        assert!(reg.insert(Arc::new(Nop), 0x0800, 0x6000, None).is_err());
        assert!(reg.insert(Arc::new(Nop), 0x1000, 0x2000, None).is_err());
        assert!(reg.insert(Arc::new(Nop), 0x2000, 0x4000, None).is_ok());
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn rejects_degenerate_range() {
        let mut reg = MmioRegistry::new();
        assert!(reg.insert(Arc::new(Nop), 0x1000, 0x1000, None).is_err());
        assert!(reg.insert(Arc::new(Nop), 0x2000, 0x1000, None).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn lookup_boundaries() {
        let reg = registry(&[(0x1000, 0x2000), (0x2000, 0x3000), (0x5000, 0x6000)]);
        assert_eq!(reg.lookup(0x1000, 4), Lookup::Hit(0));
        assert_eq!(reg.lookup(0x1FFC, 4), Lookup::Hit(0));
        assert_eq!(reg.lookup(0x1FFE, 4), Lookup::Spans);
        assert_eq!(reg.lookup(0x2000, 8), Lookup::Hit(1));
        assert_eq!(reg.lookup(0x4FFC, 4), Lookup::Miss);
        assert_eq!(reg.lookup(0x4FFE, 4), Lookup::Spans);
        assert_eq!(reg.lookup(0x3000, 1), Lookup::Miss);
        assert_eq!(reg.lookup(0x0, 8), Lookup::Miss);
        assert_eq!(reg.lookup(0x6000, 1), Lookup::Miss);
    }
}
