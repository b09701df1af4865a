use std::sync::atomic::{AtomicUsize, Ordering};

/// Reserved memory shared by every pool of one pipeline.
///
/// Managers draw page-aligned plane bytes from it while mapping and give them
/// back on `deinit`. A limit of `None` never refuses.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit: Some(limit_bytes),
            used: AtomicUsize::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limit: None,
            used: AtomicUsize::new(0),
        }
    }

    /// Reserve `bytes`, returning false when the budget cannot cover them
    pub fn try_reserve(&self, bytes: usize) -> bool {
        let Some(limit) = self.limit else {
            self.used.fetch_add(bytes, Ordering::AcqRel);
            return true;
        };
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= limit)
            })
            .is_ok()
    }

    pub fn release(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn remaining(&self) -> Option<usize> {
        self.limit.map(|limit| limit.saturating_sub(self.used()))
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}
