//! Concurrent tri-color mark-sweep garbage collector
//!
//! Objects live in arenas as `[header][payload]`. A cycle runs in three steps:
//!
//! 1. Root marking, under a short stop-the-world pause: every root turns gray.
//! 2. Concurrent marking: a pool of mark workers turns gray objects black and
//!    shades their white children gray, while mutators keep allocating.
//! 3. Rescan and sweep, under a second pause: leftover gray objects are
//!    scanned, white objects go to the free list, survivors turn white again.
//!
//! Objects allocated while marking is in progress start out black. There are
//! no write barriers: a pointer stored during concurrent marking into an
//! already-scanned object is only seen if its target is rooted.
//!
//! After each cycle the next trigger is `heap_used * growth_ratio`. A
//! background monitor checks the heap against the trigger periodically and
//! whenever an allocation pushes usage past it.

pub mod header;
mod marker;
mod optimizer;

pub use header::{Color, GcPtr, ObjectHeader, TypeInfo, HEADER_SIZE, WORD_SIZE};
pub use optimizer::{GCOptimizer, OptimizerStats};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::{self, Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::runtime::memory::{align_up, AllocError, Arena, ARENA_ALIGN};
use header::HeaderPtr;
use marker::GrayQueue;

/// Number of pause samples kept in the history.
pub const PAUSE_HISTORY_LEN: usize = 256;

/// GC configuration
#[derive(Debug, Clone)]
pub struct GCConfig {
    /// Capacity of each arena the heap grows by
    pub arena_size: usize,
    /// Trigger used before the first cycle, and the floor for later triggers
    pub initial_trigger: usize,
    /// Next trigger = live bytes after a cycle times this ratio
    pub growth_ratio: f64,
    /// Hard limit on reserved arena bytes
    pub max_heap_size: usize,
    /// Pauses longer than this are counted and logged
    pub max_pause: Duration,
    /// Number of concurrent mark workers
    pub mark_workers: usize,
    /// Poll interval of the background monitor
    pub monitor_interval: Duration,
    /// Run the background monitor; without it cycles only happen via `collect`
    pub background: bool,
}

impl Default for GCConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            arena_size: 64 * 1024,
            initial_trigger: 4 * 1024 * 1024,
            growth_ratio: 2.0,
            max_heap_size: 1024 * 1024 * 1024,
            max_pause: Duration::from_millis(10),
            mark_workers: num_cpus,
            monitor_interval: Duration::from_millis(100),
            background: true,
        }
    }
}

/// GC state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GCState {
    Idle,
    Marking,
    Sweeping,
}

impl GCState {
    #[inline]
    fn from_u8(val: u8) -> Self {
        match val {
            1 => GCState::Marking,
            2 => GCState::Sweeping,
            _ => GCState::Idle,
        }
    }
}

/// Snapshot of collector statistics.
#[derive(Debug, Clone, Serialize)]
pub struct GCStats {
    /// Completed cycles
    pub collections: u64,
    /// Bytes reserved in arenas
    pub heap_size: usize,
    /// Bytes occupied by live objects, headers included
    pub heap_used: usize,
    /// Current trigger
    pub next_gc: usize,
    /// Number of live objects
    pub objects: usize,
    /// Blocks waiting on the free list
    pub free_blocks: usize,
    /// Bytes ever allocated, headers included
    pub total_allocated: u64,
    /// Bytes ever reclaimed, headers included
    pub total_freed: u64,
    /// Stop-the-world time of the last cycle
    pub last_pause: Duration,
    /// Accumulated stop-the-world time
    pub total_pause: Duration,
    /// Pauses that exceeded the configured maximum
    pub long_pauses: u64,
    /// Wall-clock time the last cycle finished
    pub last_gc: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct PauseLog {
    last: Duration,
    total: Duration,
    history: VecDeque<Duration>,
    last_gc: Option<SystemTime>,
}

#[derive(Debug)]
struct Monitor {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// Result of one sweep.
#[derive(Debug, Default, Clone, Copy)]
struct SweepResult {
    freed_bytes: usize,
    freed_objects: usize,
    survivors: usize,
}

/// Concurrent mark-sweep garbage collector.
pub struct GarbageCollector {
    config: GCConfig,
    /// Mutators hold it shared; the two pauses hold it exclusively.
    world: RwLock<()>,
    arenas: Mutex<Vec<Arena>>,
    /// Live objects keyed by payload address.
    objects: RwLock<HashMap<usize, HeaderPtr>>,
    roots: Mutex<HashSet<usize>>,
    free_list: Mutex<Option<HeaderPtr>>,
    free_blocks: AtomicUsize,
    /// Every type seen by `alloc`, kept alive for the headers' sake.
    types: Mutex<HashMap<usize, Arc<TypeInfo>>>,
    gray: GrayQueue,
    state: AtomicU8,
    collecting: AtomicBool,
    enabled: AtomicBool,
    heap_size: AtomicUsize,
    heap_used: AtomicUsize,
    trigger: AtomicUsize,
    growth_ratio: AtomicU64,
    collections: AtomicU64,
    total_allocated: AtomicU64,
    total_freed: AtomicU64,
    long_pauses: AtomicU64,
    pauses: Mutex<PauseLog>,
    kick: Sender<()>,
    monitor: Mutex<Option<Monitor>>,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("state", &self.state())
            .field("heap_size", &self.heap_size.load(Ordering::Relaxed))
            .field("heap_used", &self.heap_used.load(Ordering::Relaxed))
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl GarbageCollector {
    /// Create a collector; starts the background monitor when configured.
    pub fn new(config: GCConfig) -> Arc<Self> {
        let (kick, kick_rx) = channel::bounded(1);
        let gc = Arc::new(Self {
            world: RwLock::new(()),
            arenas: Mutex::new(Vec::new()),
            objects: RwLock::new(HashMap::new()),
            roots: Mutex::new(HashSet::new()),
            free_list: Mutex::new(None),
            free_blocks: AtomicUsize::new(0),
            types: Mutex::new(HashMap::new()),
            gray: GrayQueue::new(),
            state: AtomicU8::new(GCState::Idle as u8),
            collecting: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            heap_size: AtomicUsize::new(0),
            heap_used: AtomicUsize::new(0),
            trigger: AtomicUsize::new(config.initial_trigger),
            growth_ratio: AtomicU64::new(config.growth_ratio.to_bits()),
            collections: AtomicU64::new(0),
            total_allocated: AtomicU64::new(0),
            total_freed: AtomicU64::new(0),
            long_pauses: AtomicU64::new(0),
            pauses: Mutex::new(PauseLog::default()),
            kick,
            monitor: Mutex::new(None),
            config,
        });
        if gc.config.background {
            gc.start_monitor(kick_rx);
        }
        gc
    }

    fn start_monitor(
        self: &Arc<Self>,
        kick: Receiver<()>,
    ) {
        let (stop, stop_rx) = channel::bounded::<()>(0);
        let weak = Arc::downgrade(self);
        let interval = self.config.monitor_interval;
        let spawned = thread::Builder::new()
            .name("gc-monitor".to_string())
            .spawn(move || monitor_loop(weak, kick, stop_rx, interval));
        match spawned {
            Ok(handle) => *self.monitor.lock() = Some(Monitor { stop, handle }),
            Err(err) => warn!(error = %err, "failed to spawn GC monitor, collecting on demand only"),
        }
    }

    /// Allocate `size` payload bytes for an object of type `type_info`.
    ///
    /// # Panics
    /// Panics when the heap cannot grow to satisfy the request. Use
    /// [`try_alloc`](Self::try_alloc) to handle exhaustion instead.
    pub fn alloc(
        &self,
        size: usize,
        type_info: &Arc<TypeInfo>,
    ) -> GcPtr {
        match self.try_alloc(size, type_info) {
            Ok(ptr) => ptr,
            Err(err) => panic!("garbage collector: {}", err),
        }
    }

    /// Allocate `size` payload bytes, reporting heap exhaustion as an error.
    ///
    /// The payload is zeroed. Reuses a free-list block first (first fit),
    /// then bump-allocates from existing arenas, then grows the heap.
    pub fn try_alloc(
        &self,
        size: usize,
        type_info: &Arc<TypeInfo>,
    ) -> Result<GcPtr, AllocError> {
        self.alloc_inner(size, type_info, false)
    }

    /// Allocate and register the object as a root in one step, so no cycle
    /// can observe it unrooted.
    pub fn alloc_rooted(
        &self,
        size: usize,
        type_info: &Arc<TypeInfo>,
    ) -> Result<GcPtr, AllocError> {
        self.alloc_inner(size, type_info, true)
    }

    fn alloc_inner(
        &self,
        size: usize,
        type_info: &Arc<TypeInfo>,
        rooted: bool,
    ) -> Result<GcPtr, AllocError> {
        let overflow = AllocError::OutOfMemory { requested: size };
        let size = align_up(size.max(1), ARENA_ALIGN).ok_or(overflow)?;
        let total = size.checked_add(HEADER_SIZE).ok_or(overflow)?;
        let ty = self.register_type(type_info);

        let (header, used) = {
            let _world = self.world.read();
            let color = if self.state() == GCState::Marking {
                Color::Black
            } else {
                Color::White
            };

            let header = match self.take_free(size) {
                Some(header) => {
                    // SAFETY: the block was unlinked from the free list under its lock.
                    unsafe { header.recycle(ty, color) };
                    header
                }
                None => {
                    let block = self.bump(total)?;
                    // SAFETY: `bump` returned HEADER_SIZE + size bytes at ARENA_ALIGN.
                    unsafe { HeaderPtr::init(block, size, ty, color) }
                }
            };

            let addr = header.payload().as_ptr() as usize;
            self.objects.write().insert(addr, header);
            if rooted {
                self.roots.lock().insert(addr);
            }
            let footprint = header.get().footprint();
            self.total_allocated
                .fetch_add(footprint as u64, Ordering::Relaxed);
            let used = self.heap_used.fetch_add(footprint, Ordering::SeqCst) + footprint;
            (header, used)
        };

        if used > self.trigger.load(Ordering::Relaxed) {
            self.request_collection();
        }
        Ok(GcPtr::from_header(header))
    }

    fn register_type(
        &self,
        type_info: &Arc<TypeInfo>,
    ) -> *const TypeInfo {
        let ptr = Arc::as_ptr(type_info);
        self.types
            .lock()
            .entry(ptr as usize)
            .or_insert_with(|| type_info.clone());
        ptr
    }

    /// First-fit search of the free list; blocks are never split.
    fn take_free(
        &self,
        size: usize,
    ) -> Option<HeaderPtr> {
        let mut head = self.free_list.lock();
        let mut prev: Option<HeaderPtr> = None;
        let mut cur = *head;
        while let Some(block) = cur {
            // SAFETY: free-list lock is held.
            let next = unsafe { block.next_free() };
            if block.get().size() >= size {
                match prev {
                    // SAFETY: free-list lock is held.
                    Some(prev) => unsafe { prev.set_next_free(next) },
                    None => *head = next,
                }
                self.free_blocks.fetch_sub(1, Ordering::Relaxed);
                return Some(block);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Bump-allocate from the first arena with room, growing the heap if none has.
    fn bump(
        &self,
        total: usize,
    ) -> Result<std::ptr::NonNull<u8>, AllocError> {
        let mut arenas = self.arenas.lock();
        for arena in arenas.iter_mut() {
            if let Some(block) = arena.alloc(total) {
                return Ok(block);
            }
        }

        let capacity = self.config.arena_size.max(total);
        let heap_size = self.heap_size.load(Ordering::SeqCst);
        let within_limit = heap_size
            .checked_add(capacity)
            .is_some_and(|grown| grown <= self.config.max_heap_size);
        if !within_limit {
            return Err(AllocError::HeapLimit {
                requested: total,
                limit: self.config.max_heap_size,
            });
        }
        let mut arena = Arena::new(capacity)?;
        let block = arena
            .alloc(total)
            .ok_or(AllocError::OutOfMemory { requested: total })?;
        self.heap_size
            .fetch_add(arena.capacity(), Ordering::SeqCst);
        arenas.push(arena);
        debug!(
            arenas = arenas.len(),
            heap_size = self.heap_size.load(Ordering::Relaxed),
            "heap grown"
        );
        Ok(block)
    }

    /// Ask the background monitor for a cycle without waiting for it.
    fn request_collection(&self) {
        if self.is_enabled() && !self.collecting.load(Ordering::Relaxed) {
            // A pending kick is as good as a new one.
            let _ = self.kick.try_send(());
        }
    }

    /// Add `ptr` to the root set.
    ///
    /// During marking the object is shaded gray immediately.
    pub fn add_root(
        &self,
        ptr: GcPtr,
    ) {
        self.roots.lock().insert(ptr.addr());
        if self.state() == GCState::Marking {
            if let Some(&header) = self.objects.read().get(&ptr.addr()) {
                if header.get().transition(Color::White, Color::Gray) {
                    self.gray.push(header);
                }
            }
        }
    }

    /// Remove `ptr` from the root set.
    pub fn remove_root(
        &self,
        ptr: GcPtr,
    ) {
        self.roots.lock().remove(&ptr.addr());
    }

    /// Number of registered roots.
    pub fn root_count(&self) -> usize {
        self.roots.lock().len()
    }

    /// Whether `ptr` refers to an object that has not been reclaimed.
    pub fn is_live(
        &self,
        ptr: GcPtr,
    ) -> bool {
        self.objects.read().contains_key(&ptr.addr())
    }

    fn live_header(
        &self,
        ptr: GcPtr,
    ) -> HeaderPtr {
        match self.objects.read().get(&ptr.addr()) {
            Some(&header) => header,
            None => panic!("stale or foreign object handle {:#x}", ptr.addr()),
        }
    }

    /// Store a reference (or null) into pointer field `field` of `obj`.
    ///
    /// # Panics
    /// Panics if `obj` is not live or `field` is out of bounds.
    pub fn write_pointer(
        &self,
        obj: GcPtr,
        field: usize,
        target: Option<GcPtr>,
    ) {
        let header = self.live_header(obj);
        debug_assert!(header.get().type_info().is_pointer(field));
        self.store_word(header, field, target.map_or(0, |t| t.addr()));
    }

    /// Load pointer field `field` of `obj`.
    pub fn read_pointer(
        &self,
        obj: GcPtr,
        field: usize,
    ) -> Option<GcPtr> {
        let header = self.live_header(obj);
        let addr = self.load_word(header, field);
        if addr == 0 {
            return None;
        }
        self.objects.read().get(&addr).map(|&h| GcPtr::from_header(h))
    }

    /// Store a plain word into `obj`.
    pub fn write_word(
        &self,
        obj: GcPtr,
        index: usize,
        value: usize,
    ) {
        let header = self.live_header(obj);
        self.store_word(header, index, value);
    }

    /// Load a plain word from `obj`.
    pub fn read_word(
        &self,
        obj: GcPtr,
        index: usize,
    ) -> usize {
        let header = self.live_header(obj);
        self.load_word(header, index)
    }

    fn store_word(
        &self,
        header: HeaderPtr,
        index: usize,
        value: usize,
    ) {
        let words = header.get().size() / WORD_SIZE;
        assert!(index < words, "word {} out of bounds ({} words)", index, words);
        // SAFETY: bounds checked above.
        unsafe { header.word(index) }.store(value, Ordering::Release);
    }

    fn load_word(
        &self,
        header: HeaderPtr,
        index: usize,
    ) -> usize {
        let words = header.get().size() / WORD_SIZE;
        assert!(index < words, "word {} out of bounds ({} words)", index, words);
        // SAFETY: bounds checked above.
        unsafe { header.word(index) }.load(Ordering::Acquire)
    }

    /// Run one full collection cycle.
    ///
    /// Returns `false` without doing anything when the collector is disabled
    /// or another cycle is already in progress.
    pub fn collect(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if self
            .collecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let cycle_start = Instant::now();
        let used_before = self.heap_used.load(Ordering::SeqCst);
        debug!(heap_used = used_before, "GC cycle started");

        let root_pause = {
            let _world = self.world.write();
            let started = Instant::now();
            self.set_state(GCState::Marking);
            self.mark_roots();
            started.elapsed()
        };

        let marked = self
            .gray
            .drain_parallel(self.config.mark_workers, |header| self.scan(header));

        let (final_pause, sweep) = {
            let _world = self.world.write();
            let started = Instant::now();
            let rescanned = self.gray.drain_local(|header| self.scan(header));
            self.set_state(GCState::Sweeping);
            let sweep = self.sweep();
            self.set_state(GCState::Idle);
            trace!(marked, rescanned, "mark finished");
            (started.elapsed(), sweep)
        };

        let used_after = self.heap_used.load(Ordering::SeqCst);
        let next_gc = self.pace(used_after, self.growth_ratio());
        self.trigger.store(next_gc, Ordering::SeqCst);

        self.record_pause("root marking", root_pause);
        self.record_pause("rescan and sweep", final_pause);
        let pause = root_pause + final_pause;
        {
            let mut log = self.pauses.lock();
            log.last = pause;
            log.total += pause;
            if log.history.len() == PAUSE_HISTORY_LEN {
                log.history.pop_front();
            }
            log.history.push_back(pause);
            log.last_gc = Some(SystemTime::now());
        }
        let collections = self.collections.fetch_add(1, Ordering::SeqCst) + 1;
        self.collecting.store(false, Ordering::Release);

        info!(
            collection = collections,
            freed_bytes = sweep.freed_bytes,
            freed_objects = sweep.freed_objects,
            survivors = sweep.survivors,
            heap_used = used_after,
            next_gc,
            pause_us = pause.as_micros() as u64,
            cycle_us = cycle_start.elapsed().as_micros() as u64,
            "GC cycle finished"
        );
        true
    }

    fn mark_roots(&self) {
        let roots = self.roots.lock();
        let objects = self.objects.read();
        for addr in roots.iter() {
            if let Some(&header) = objects.get(addr) {
                if header.get().transition(Color::White, Color::Gray) {
                    self.gray.push(header);
                }
            }
        }
    }

    /// Blacken `header` and shade its white children.
    fn scan(
        &self,
        header: HeaderPtr,
    ) {
        let object = header.get();
        if !object.transition(Color::Gray, Color::Black) {
            return;
        }
        let ty = object.type_info();
        if !ty.has_pointers() {
            return;
        }
        let words = object.size() / WORD_SIZE;
        let objects = self.objects.read();
        for word in ty.pointer_words().take_while(|&w| w < words) {
            // SAFETY: word < words.
            let addr = unsafe { header.word(word) }.load(Ordering::Acquire);
            if addr == 0 {
                continue;
            }
            if let Some(&child) = objects.get(&addr) {
                if child.get().transition(Color::White, Color::Gray) {
                    self.gray.push(child);
                }
            }
        }
    }

    /// Reclaim white objects and reset survivors. Runs inside the final pause.
    fn sweep(&self) -> SweepResult {
        let mut result = SweepResult::default();
        let mut objects = self.objects.write();
        let mut free = self.free_list.lock();
        objects.retain(|_, header| {
            let object = header.get();
            if object.color() == Color::White {
                // SAFETY: free-list lock is held.
                unsafe { header.set_next_free(*free) };
                *free = Some(*header);
                result.freed_bytes += object.footprint();
                result.freed_objects += 1;
                false
            } else {
                object.set_color(Color::White);
                result.survivors += 1;
                true
            }
        });
        self.free_blocks
            .fetch_add(result.freed_objects, Ordering::Relaxed);
        self.heap_used
            .fetch_sub(result.freed_bytes, Ordering::SeqCst);
        self.total_freed
            .fetch_add(result.freed_bytes as u64, Ordering::Relaxed);
        result
    }

    fn record_pause(
        &self,
        phase: &'static str,
        pause: Duration,
    ) {
        if pause > self.config.max_pause {
            self.long_pauses.fetch_add(1, Ordering::Relaxed);
            warn!(
                phase,
                pause_us = pause.as_micros() as u64,
                max_pause_us = self.config.max_pause.as_micros() as u64,
                "GC pause exceeded target"
            );
        }
    }

    fn pace(
        &self,
        heap_used: usize,
        ratio: f64,
    ) -> usize {
        ((heap_used as f64 * ratio) as usize).max(self.config.initial_trigger)
    }

    #[inline]
    fn growth_ratio(&self) -> f64 {
        f64::from_bits(self.growth_ratio.load(Ordering::Relaxed))
    }

    /// Whether usage has crossed the trigger and a cycle would run.
    pub fn should_collect(&self) -> bool {
        self.is_enabled()
            && self.heap_used.load(Ordering::SeqCst) > self.trigger.load(Ordering::SeqCst)
    }

    /// Override the current trigger until the next cycle re-paces it.
    pub fn set_trigger_size(
        &self,
        bytes: usize,
    ) {
        self.trigger.store(bytes, Ordering::SeqCst);
    }

    /// Current trigger in bytes.
    pub fn trigger_size(&self) -> usize {
        self.trigger.load(Ordering::SeqCst)
    }

    /// Set the growth ratio as a percentage and re-derive the trigger from
    /// current usage. Zero is ignored.
    pub fn set_gc_percent(
        &self,
        percent: u32,
    ) {
        if percent == 0 {
            return;
        }
        let ratio = percent as f64 / 100.0;
        self.growth_ratio.store(ratio.to_bits(), Ordering::Relaxed);
        let used = self.heap_used.load(Ordering::SeqCst);
        self.trigger.store(self.pace(used, ratio), Ordering::SeqCst);
    }

    /// Allow cycles again.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Suspend new cycles; a cycle already running completes.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn state(&self) -> GCState {
        GCState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    fn set_state(
        &self,
        state: GCState,
    ) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    #[inline]
    pub fn config(&self) -> &GCConfig {
        &self.config
    }

    /// Snapshot of the collector's counters.
    pub fn stats(&self) -> GCStats {
        let log = self.pauses.lock();
        GCStats {
            collections: self.collections.load(Ordering::SeqCst),
            heap_size: self.heap_size.load(Ordering::SeqCst),
            heap_used: self.heap_used.load(Ordering::SeqCst),
            next_gc: self.trigger.load(Ordering::SeqCst),
            objects: self.objects.read().len(),
            free_blocks: self.free_blocks.load(Ordering::Relaxed),
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            last_pause: log.last,
            total_pause: log.total,
            long_pauses: self.long_pauses.load(Ordering::Relaxed),
            last_gc: log.last_gc,
        }
    }

    /// Pause times of the most recent cycles, oldest first.
    pub fn pause_history(&self) -> Vec<Duration> {
        self.pauses.lock().history.iter().copied().collect()
    }

    /// Shut down the background monitor and wait for it to exit.
    pub fn stop(&self) {
        let Some(monitor) = self.monitor.lock().take() else {
            return;
        };
        drop(monitor.stop);
        if monitor.handle.thread().id() != thread::current().id() && monitor.handle.join().is_err()
        {
            warn!("GC monitor panicked");
        }
        info!("GC monitor stopped");
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        // The monitor may be the thread dropping the last reference, so
        // only signal it here.
        if let Some(monitor) = self.monitor.get_mut().take() {
            drop(monitor.stop);
        }
    }
}

fn monitor_loop(
    gc: Weak<GarbageCollector>,
    kick: Receiver<()>,
    stop: Receiver<()>,
    interval: Duration,
) {
    let ticker = channel::tick(interval);
    loop {
        crossbeam::select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {}
            recv(kick) -> msg => {
                if msg.is_err() {
                    break;
                }
            }
        }
        let Some(gc) = gc.upgrade() else {
            break;
        };
        if gc.should_collect() {
            gc.collect();
        }
    }
    trace!("GC monitor exiting");
}

#[cfg(test)]
mod tests;
