//! Fixed-size buffer pools
//!
//! One manager owns the buffers for one purpose (Bayer output, ISP
//! intermediates, preview output, ...). Buffers are mapped once, handed out by
//! index and must come back exactly once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::utils::{Backoff, CachePadded};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::buffer::budget::MemoryBudget;
use crate::buffer::buffer::{Buffer, PixelFormat, Plane, MAX_BUFFERS};
use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};
use crate::utils::{lock, page_align};

/// How `allocate` maps memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMode {
    /// Map every buffer up front
    #[default]
    AtOnce,
    /// Map `min_count` up front and grow inside `get_buffer` up to `max_count`
    OnDemand,
}

/// Declarative pool description used by topologies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferManagerConfig {
    pub name: String,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub min_count: usize,
    pub max_count: usize,
    #[serde(default)]
    pub mode: AllocationMode,
}

impl BufferManagerConfig {
    pub fn new(
        name: impl Into<String>,
        format: PixelFormat,
        width: u32,
        height: u32,
        count: usize,
    ) -> Self {
        Self {
            name: name.into(),
            format,
            width,
            height,
            min_count: count,
            max_count: count,
            mode: AllocationMode::AtOnce,
        }
    }

    pub fn on_demand(mut self, min_count: usize) -> Self {
        self.mode = AllocationMode::OnDemand;
        self.min_count = min_count;
        self
    }

    pub fn plane_sizes(&self) -> Vec<usize> {
        self.format.plane_sizes(self.width, self.height)
    }

    /// Create the manager and allocate it from `budget`
    pub fn build(&self, budget: Arc<MemoryBudget>) -> Result<BufferManager> {
        let manager = BufferManager::new(&self.name, self.mode, budget);
        let sizes = self.plane_sizes();
        manager.allocate(sizes.len(), &sizes, self.min_count, self.max_count)?;
        Ok(manager)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    InFlight,
}

struct Slot {
    planes: Arc<[Plane]>,
    state: SlotState,
    filled: bool,
    bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Geometry {
    plane_sizes: Vec<usize>,
    min_count: usize,
    max_count: usize,
}

#[derive(Default)]
struct Inner {
    geometry: Option<Geometry>,
    slots: Vec<Slot>,
    free: VecDeque<usize>,
}

impl Inner {
    fn available(&self) -> usize {
        match &self.geometry {
            Some(geometry) => self.free.len() + (geometry.max_count - self.slots.len()),
            None => 0,
        }
    }

    fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::InFlight)
            .count()
    }

    fn reserved_bytes(&self) -> usize {
        self.slots.iter().map(|slot| slot.bytes).sum()
    }
}

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    cancels: AtomicU64,
    exhausted: AtomicU64,
    double_releases: AtomicU64,
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferManagerStats {
    pub name: String,
    pub capacity: usize,
    pub allocated: usize,
    pub available: usize,
    pub in_flight: usize,
    pub gets: u64,
    pub puts: u64,
    pub cancels: u64,
    pub exhausted: u64,
    pub double_releases: u64,
}

pub struct BufferManager {
    name: Arc<str>,
    mode: AllocationMode,
    budget: Arc<MemoryBudget>,
    inner: Mutex<Inner>,
    /// Mirror of `Inner::available` for lock-free back-pressure checks
    available: CachePadded<AtomicUsize>,
    counters: CachePadded<Counters>,
}

impl BufferManager {
    pub fn new(name: &str, mode: AllocationMode, budget: Arc<MemoryBudget>) -> Self {
        Self {
            name: Arc::from(name),
            mode,
            budget,
            inner: Mutex::new(Inner::default()),
            available: CachePadded::new(AtomicUsize::new(0)),
            counters: CachePadded::new(Counters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> AllocationMode {
        self.mode
    }

    /// Reserve and map `max_count` buffers (`min_count` when on demand).
    ///
    /// Calling again with the same geometry is a no-op; a different geometry
    /// is an allocation error until `deinit`.
    #[instrument(skip(self, plane_sizes), fields(manager = %self.name))]
    pub fn allocate(
        &self,
        plane_count: usize,
        plane_sizes: &[usize],
        min_count: usize,
        max_count: usize,
    ) -> Result<()> {
        self.validate_geometry(plane_count, plane_sizes, min_count, max_count)?;
        let geometry = Geometry {
            plane_sizes: plane_sizes.to_vec(),
            min_count,
            max_count,
        };

        let mut inner = lock(&self.inner);
        if let Some(existing) = &inner.geometry {
            if existing.plane_sizes == geometry.plane_sizes
                && existing.max_count == geometry.max_count
            {
                debug!("{} already allocated, skipping", self.name);
                return Ok(());
            }
            return Err(PipelineError::allocation(
                self.name.as_ref(),
                format!(
                    "already allocated as {:?} x{}, requested {:?} x{}",
                    existing.plane_sizes, existing.max_count, plane_sizes, max_count
                ),
            ));
        }

        let initial = match self.mode {
            AllocationMode::AtOnce => max_count,
            AllocationMode::OnDemand => min_count,
        };

        let mut slots = Vec::with_capacity(max_count);
        for _ in 0..initial {
            match self.map_slot(plane_sizes) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    let mapped: usize = slots.iter().map(|slot: &Slot| slot.bytes).sum();
                    self.budget.release(mapped);
                    return Err(e);
                }
            }
        }

        inner.free = (0..slots.len()).collect();
        inner.slots = slots;
        inner.geometry = Some(geometry);
        self.sync_available(&inner);

        info!(
            "Allocated {} buffers ({:?} bytes per plane, capacity {}) for {}",
            inner.slots.len(),
            plane_sizes,
            max_count,
            self.name
        );
        Ok(())
    }

    fn validate_geometry(
        &self,
        plane_count: usize,
        plane_sizes: &[usize],
        min_count: usize,
        max_count: usize,
    ) -> Result<()> {
        let reason = if plane_count == 0 || plane_count != plane_sizes.len() {
            Some(format!(
                "plane count {} does not match {} plane sizes",
                plane_count,
                plane_sizes.len()
            ))
        } else if plane_sizes.iter().any(|size| *size == 0) {
            Some("plane sizes must be non-zero".to_string())
        } else if max_count == 0 || max_count > MAX_BUFFERS {
            Some(format!("max count {} outside 1..={}", max_count, MAX_BUFFERS))
        } else if min_count > max_count {
            Some(format!("min count {} above max count {}", min_count, max_count))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(PipelineError::allocation(self.name.as_ref(), reason)),
            None => Ok(()),
        }
    }

    fn map_slot(&self, plane_sizes: &[usize]) -> Result<Slot> {
        let bytes: usize = plane_sizes.iter().map(|size| page_align(*size)).sum();
        if !self.budget.try_reserve(bytes) {
            return Err(PipelineError::allocation(
                self.name.as_ref(),
                format!(
                    "reserved memory exhausted: need {} bytes, {:?} remaining",
                    bytes,
                    self.budget.remaining()
                ),
            ));
        }

        let planes: std::io::Result<Vec<Plane>> =
            plane_sizes.iter().map(|size| Plane::map(*size)).collect();
        match planes {
            Ok(planes) => Ok(Slot {
                planes: Arc::from(planes),
                state: SlotState::Free,
                filled: false,
                bytes,
            }),
            Err(e) => {
                self.budget.release(bytes);
                Err(PipelineError::allocation(
                    self.name.as_ref(),
                    format!("mapping failed: {}", e),
                ))
            }
        }
    }

    /// Check out the oldest free buffer.
    ///
    /// Exhaustion is reported, never waited on; callers own the retry policy.
    pub fn get_buffer(&self) -> Result<Buffer> {
        let mut inner = lock(&self.inner);
        let Some(geometry) = inner.geometry.clone() else {
            return Err(PipelineError::NotAllocated {
                manager: self.name.to_string(),
            });
        };

        let index = match inner.free.pop_front() {
            Some(index) => index,
            None if inner.slots.len() < geometry.max_count => {
                match self.map_slot(&geometry.plane_sizes) {
                    Ok(slot) => {
                        inner.slots.push(slot);
                        debug!(
                            "{} grew to {} buffers",
                            self.name,
                            inner.slots.len()
                        );
                        inner.slots.len() - 1
                    }
                    Err(e) => {
                        warn!("{} could not grow: {}", self.name, e);
                        return Err(self.exhausted());
                    }
                }
            }
            None => return Err(self.exhausted()),
        };

        let slot = &mut inner.slots[index];
        slot.state = SlotState::InFlight;
        slot.filled = false;
        let buffer = Buffer::new(index, self.name.clone(), slot.planes.clone());
        self.sync_available(&inner);
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        trace!("{} get B{}", self.name, index);
        Ok(buffer)
    }

    fn exhausted(&self) -> PipelineError {
        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("campipe_buffer_exhausted_total", "manager" => self.name.to_string())
            .increment(1);
        PipelineError::NoBufferAvailable {
            manager: self.name.to_string(),
        }
    }

    /// `get_buffer` retried with a bounded backoff.
    ///
    /// Gives up after `attempts` tries or as soon as `cancel` fires.
    pub fn get_buffer_with_backoff(&self, attempts: u32, cancel: &CancelToken) -> Result<Buffer> {
        let backoff = Backoff::new();
        let mut attempt = 0;
        loop {
            match self.get_buffer() {
                Err(PipelineError::NoBufferAvailable { .. }) if attempt + 1 < attempts => {
                    attempt += 1;
                    if backoff.is_completed() {
                        if !cancel.sleep(Duration::from_millis(1)) {
                            return Err(PipelineError::Cancelled);
                        }
                    } else {
                        backoff.snooze();
                    }
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                }
                other => return other,
            }
        }
    }

    /// Return a buffer to the free set
    pub fn put_buffer(&self, index: usize) -> Result<()> {
        self.release(index, false)
    }

    /// Return a buffer and drop whatever was partially written into it
    pub fn cancel_buffer(&self, index: usize) -> Result<()> {
        self.release(index, true)
    }

    fn release(&self, index: usize, cancel: bool) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.geometry.is_none() {
            return Err(PipelineError::NotAllocated {
                manager: self.name.to_string(),
            });
        }
        let Some(slot) = inner.slots.get_mut(index) else {
            return Err(PipelineError::InvalidBufferIndex {
                manager: self.name.to_string(),
                index,
            });
        };

        if slot.state == SlotState::Free {
            drop(inner);
            self.counters.double_releases.fetch_add(1, Ordering::Relaxed);
            error!("{} B{} released while already free", self.name, index);
            return Err(PipelineError::DoubleRelease {
                manager: self.name.to_string(),
                index,
            });
        }

        slot.state = SlotState::Free;
        if cancel {
            slot.filled = false;
            self.counters.cancels.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.puts.fetch_add(1, Ordering::Relaxed);
        }
        inner.free.push_back(index);
        self.sync_available(&inner);
        trace!("{} put B{}", self.name, index);
        Ok(())
    }

    /// Record that a device finished writing an in-flight buffer
    pub fn mark_filled(&self, index: usize) -> Result<()> {
        let mut inner = lock(&self.inner);
        match inner.slots.get_mut(index) {
            Some(slot) if slot.state == SlotState::InFlight => {
                slot.filled = true;
                Ok(())
            }
            Some(_) => Err(PipelineError::InvalidState(format!(
                "{} B{} is not in flight",
                self.name, index
            ))),
            None => Err(PipelineError::InvalidBufferIndex {
                manager: self.name.to_string(),
                index,
            }),
        }
    }

    pub fn is_filled(&self, index: usize) -> bool {
        lock(&self.inner)
            .slots
            .get(index)
            .is_some_and(|slot| slot.filled)
    }

    /// Mark every buffer free without unmapping. Returns how many were
    /// reclaimed from flight.
    pub fn reset_buffers(&self) -> Result<usize> {
        let mut inner = lock(&self.inner);
        if inner.geometry.is_none() {
            return Err(PipelineError::NotAllocated {
                manager: self.name.to_string(),
            });
        }

        let reclaimed = inner.in_flight();
        for slot in inner.slots.iter_mut() {
            slot.state = SlotState::Free;
            slot.filled = false;
        }
        inner.free = (0..inner.slots.len()).collect();
        self.sync_available(&inner);

        if reclaimed > 0 {
            warn!("{} reset reclaimed {} in-flight buffers", self.name, reclaimed);
        }
        Ok(reclaimed)
    }

    /// Unmap everything. Refused while any buffer is in flight.
    #[instrument(skip(self), fields(manager = %self.name))]
    pub fn deinit(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.geometry.is_none() {
            return Ok(());
        }

        let in_flight = inner.in_flight();
        if in_flight > 0 {
            return Err(PipelineError::BuffersInFlight {
                manager: self.name.to_string(),
                count: in_flight,
            });
        }

        let bytes = inner.reserved_bytes();
        *inner = Inner::default();
        self.sync_available(&inner);
        drop(inner);

        self.budget.release(bytes);
        info!("{} released {} bytes", self.name, bytes);
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        lock(&self.inner).geometry.is_some()
    }

    /// Buffers that `get_buffer` could hand out right now
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner).in_flight()
    }

    pub fn capacity(&self) -> usize {
        lock(&self.inner)
            .geometry
            .as_ref()
            .map_or(0, |geometry| geometry.max_count)
    }

    pub fn allocated_count(&self) -> usize {
        lock(&self.inner).slots.len()
    }

    pub fn plane_sizes(&self) -> Vec<usize> {
        lock(&self.inner)
            .geometry
            .as_ref()
            .map(|geometry| geometry.plane_sizes.clone())
            .unwrap_or_default()
    }

    pub fn is_available(&self, index: usize) -> bool {
        lock(&self.inner)
            .slots
            .get(index)
            .is_some_and(|slot| slot.state == SlotState::Free)
    }

    /// View of any mapped slot, free or not
    pub fn buffer(&self, index: usize) -> Result<Buffer> {
        let inner = lock(&self.inner);
        inner
            .slots
            .get(index)
            .map(|slot| Buffer::new(index, self.name.clone(), slot.planes.clone()))
            .ok_or_else(|| PipelineError::InvalidBufferIndex {
                manager: self.name.to_string(),
                index,
            })
    }

    pub fn stats(&self) -> BufferManagerStats {
        let inner = lock(&self.inner);
        BufferManagerStats {
            name: self.name.to_string(),
            capacity: inner.geometry.as_ref().map_or(0, |g| g.max_count),
            allocated: inner.slots.len(),
            available: inner.available(),
            in_flight: inner.in_flight(),
            gets: self.counters.gets.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            cancels: self.counters.cancels.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            double_releases: self.counters.double_releases.load(Ordering::Relaxed),
        }
    }

    fn sync_available(&self, inner: &Inner) {
        let available = inner.available();
        self.available.store(available, Ordering::Release);
        metrics::gauge!("campipe_buffers_available", "manager" => self.name.to_string())
            .set(available as f64);
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        let inner = lock(&self.inner);
        let in_flight = inner.in_flight();
        if in_flight > 0 {
            warn!("{} dropped with {} buffers in flight", self.name, in_flight);
        }
        self.budget.release(inner.reserved_bytes());
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(count: usize) -> BufferManager {
        let manager = BufferManager::new("test", AllocationMode::AtOnce, Arc::default());
        manager.allocate(1, &[64], count, count).unwrap();
        manager
    }

    #[test]
    fn exhaustion_then_reuse_of_released_index() {
        let manager = pool(4);
        let held: Vec<Buffer> = (0..4).map(|_| manager.get_buffer().unwrap()).collect();
        assert!(matches!(
            manager.get_buffer(),
            Err(PipelineError::NoBufferAvailable { .. })
        ));

        manager.put_buffer(held[2].index()).unwrap();
        let again = manager.get_buffer().unwrap();
        assert_eq!(again.index(), held[2].index());
        assert!(again.shares_memory_with(&held[2]));
    }

    #[test]
    fn double_release_is_reported() {
        let manager = pool(2);
        let buffer = manager.get_buffer().unwrap();
        manager.put_buffer(buffer.index()).unwrap();
        assert!(matches!(
            manager.put_buffer(buffer.index()),
            Err(PipelineError::DoubleRelease { index, .. }) if index == buffer.index()
        ));
        assert!(matches!(
            manager.cancel_buffer(1),
            Err(PipelineError::DoubleRelease { .. })
        ));
        assert!(matches!(
            manager.put_buffer(9),
            Err(PipelineError::InvalidBufferIndex { .. })
        ));
        assert_eq!(manager.available(), 2);
        assert_eq!(manager.stats().double_releases, 2);
    }

    #[test]
    fn cancel_clears_filled_flag() {
        let manager = pool(1);
        let buffer = manager.get_buffer().unwrap();
        manager.mark_filled(buffer.index()).unwrap();
        assert!(manager.is_filled(buffer.index()));
        manager.cancel_buffer(buffer.index()).unwrap();
        assert!(!manager.is_filled(buffer.index()));
        assert!(manager.mark_filled(buffer.index()).is_err());
    }

    #[test]
    fn allocate_is_idempotent_for_same_geometry() {
        let manager = pool(3);
        manager.allocate(1, &[64], 3, 3).unwrap();
        assert!(matches!(
            manager.allocate(1, &[128], 3, 3),
            Err(PipelineError::Allocation { .. })
        ));
        assert_eq!(manager.allocated_count(), 3);
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let manager = BufferManager::new("bad", AllocationMode::AtOnce, Arc::default());
        assert!(manager.allocate(2, &[64], 1, 1).is_err());
        assert!(manager.allocate(1, &[0], 1, 1).is_err());
        assert!(manager.allocate(1, &[64], 4, 2).is_err());
        assert!(manager.allocate(1, &[64], 1, MAX_BUFFERS + 1).is_err());
        assert!(!manager.is_allocated());
    }

    #[test]
    fn budget_failure_is_allocation_error_and_leaks_nothing() {
        let page = page_size::get();
        let budget = Arc::new(MemoryBudget::new(page * 2));
        let manager = BufferManager::new("tight", AllocationMode::AtOnce, budget.clone());
        let result = manager.allocate(1, &[page], 3, 3);
        assert!(matches!(result, Err(PipelineError::Allocation { .. })));
        assert_eq!(budget.used(), 0);
        assert!(!manager.is_allocated());
    }

    #[test]
    fn on_demand_grows_to_capacity() {
        let manager = BufferManager::new("grow", AllocationMode::OnDemand, Arc::default());
        manager.allocate(1, &[32], 1, 3).unwrap();
        assert_eq!(manager.allocated_count(), 1);
        assert_eq!(manager.available(), 3);

        let buffers: Vec<Buffer> = (0..3).map(|_| manager.get_buffer().unwrap()).collect();
        assert_eq!(manager.allocated_count(), 3);
        assert!(manager.get_buffer().is_err());
        let indices: HashSet<usize> = buffers.iter().map(Buffer::index).collect();
        assert_eq!(indices.len(), 3);
    }

    #[test]
    fn reset_and_deinit() {
        let budget = Arc::new(MemoryBudget::unlimited());
        let manager = BufferManager::new("life", AllocationMode::AtOnce, budget.clone());
        manager.allocate(2, &[16, 8], 2, 2).unwrap();
        let used = budget.used();
        assert!(used > 0);

        let _a = manager.get_buffer().unwrap();
        assert!(matches!(
            manager.deinit(),
            Err(PipelineError::BuffersInFlight { count: 1, .. })
        ));
        assert_eq!(manager.reset_buffers().unwrap(), 1);
        assert_eq!(manager.available(), 2);

        manager.deinit().unwrap();
        manager.deinit().unwrap();
        assert_eq!(budget.used(), 0);
        assert!(matches!(
            manager.get_buffer(),
            Err(PipelineError::NotAllocated { .. })
        ));
    }

    #[test]
    fn backoff_gives_up_and_respects_cancel() {
        let manager = pool(1);
        let _held = manager.get_buffer().unwrap();
        let token = CancelToken::new();
        assert!(matches!(
            manager.get_buffer_with_backoff(5, &token),
            Err(PipelineError::NoBufferAvailable { .. })
        ));
        token.cancel();
        assert!(matches!(
            manager.get_buffer_with_backoff(100, &token),
            Err(PipelineError::Cancelled)
        ));
    }
}
