//! The trace context: owns the stores, the bind pipeline, and the
//! samplers for one recording or reading session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bind::{self, BindFailure, WorkerPool};
use crate::config::{SessionId, StoreId, StoreSet, TraceConfig, TraceMode};
use crate::error::{TraceResult, TraceStoreError};
use crate::sampler::Sampler;
use crate::store::{RecordHandle, StoreSettings, TraceStore};
use crate::sync::{BindWork, Event};

/// Channels bound per store after metadata-info.
const REMAINING_CHANNELS: usize = crate::meta::MetadataKind::REMAINING.len();

/// Size of one sampler record: timestamp plus two counters.
const SAMPLE_RECORD_LEN: u64 = 24;

/// Completion tracking for the four bind phases.
pub(crate) struct PhaseWorks {
    pub(crate) metadata_info: BindWork,
    pub(crate) remaining_metadata: BindWork,
    pub(crate) store_bind: BindWork,
    pub(crate) readonly_complete: BindWork,
}

/// Progress counters for one bind phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseProgress {
    pub total: usize,
    pub active: usize,
    pub failed: usize,
}

/// Snapshot of the whole pipeline's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineProgress {
    pub metadata_info: PhaseProgress,
    pub remaining_metadata: PhaseProgress,
    pub store_bind: PhaseProgress,
    pub readonly_complete: PhaseProgress,
    /// Stores that have not reached a terminal state yet.
    pub stores_pending: usize,
}

pub(crate) struct ContextInner {
    pub(crate) config: TraceConfig,
    pub(crate) session: Option<SessionId>,
    pub(crate) stores: Vec<Arc<TraceStore>>,
    index_by_id: HashMap<StoreId, usize>,

    pub(crate) works: PhaseWorks,
    pub(crate) remaining_channels: Vec<AtomicUsize>,
    pub(crate) failures: Mutex<Vec<BindFailure>>,
    pub(crate) failed_count: AtomicUsize,
    pub(crate) binds_in_progress: AtomicUsize,
    pub(crate) loading_complete: Event,

    pool: Mutex<Option<WorkerPool>>,
    pub(crate) cancelled: AtomicBool,
    pub(crate) reloc_threads: Mutex<Vec<JoinHandle<()>>>,
    samplers: Mutex<Vec<Sampler>>,
    closed: AtomicBool,
}

impl ContextInner {
    pub(crate) fn store_by_id(&self, id: StoreId) -> Option<&Arc<TraceStore>> {
        self.index_by_id.get(&id).map(|index| &self.stores[*index])
    }

    pub(crate) fn submit_job(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        if let Some(pool) = &*self.pool.lock() {
            pool.submit(job);
        }
    }
}

/// Handle for one recording or reading session.
///
/// Construction validates the configuration, creates every store and its
/// metadata channels' bookkeeping, then hands the bind pipeline to the
/// worker pool and returns.  Allocation against any store is legal
/// immediately; callers block until that store's bind resolves.
pub struct TraceContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceContext").finish_non_exhaustive()
    }
}

impl TraceContext {
    /// Builds a context over `store_set` under `config`.
    ///
    /// Read-write mode requires a session id and a writable store set;
    /// readonly mode requires a readonly store set and resolves the
    /// ignore-preferred-addresses bitmap against it.  All validation
    /// happens before any file or thread is created.
    pub fn initialize(
        config: TraceConfig,
        session: Option<SessionId>,
        store_set: StoreSet,
    ) -> TraceResult<Self> {
        let config = config.normalized();
        validate(&config, session, &store_set)?;

        match config.mode {
            TraceMode::ReadWrite => std::fs::create_dir_all(&config.root_dir)?,
            TraceMode::Readonly => {
                if !config.root_dir.is_dir() {
                    return Err(TraceStoreError::invalid_config(format!(
                        "session directory {} does not exist",
                        config.root_dir.display()
                    )));
                }
            }
        }

        let readonly = config.mode == TraceMode::Readonly;
        let mut stores = Vec::with_capacity(store_set.descriptors.len());
        let mut index_by_id = HashMap::with_capacity(store_set.descriptors.len());
        for (index, descriptor) in store_set.descriptors.iter().enumerate() {
            let ignore_bit = config.flags.ignore_preferred_addresses
                & (1u64 << (descriptor.id.get() as u32))
                != 0;
            let settings = StoreSettings {
                root_dir: config.root_dir.clone(),
                readonly,
                page_size: config.page_size,
                extension_granularity: config.extension_granularity,
                spin_count: config.spin_count,
                ignore_preferred_address: ignore_bit,
            };
            stores.push(Arc::new(TraceStore::new(descriptor, settings)));
            index_by_id.insert(descriptor.id, index);
        }

        let count = stores.len();
        let pool = WorkerPool::new("trace-bind", config.worker_threads)?;
        let synchronous = config.flags.synchronous_initialization;

        let inner = Arc::new(ContextInner {
            config,
            session,
            stores,
            index_by_id,
            works: PhaseWorks {
                metadata_info: BindWork::new(count),
                remaining_metadata: BindWork::new(count * REMAINING_CHANNELS),
                store_bind: BindWork::new(count),
                readonly_complete: BindWork::new(count),
            },
            remaining_channels: (0..count)
                .map(|_| AtomicUsize::new(REMAINING_CHANNELS))
                .collect(),
            failures: Mutex::new(Vec::new()),
            failed_count: AtomicUsize::new(0),
            binds_in_progress: AtomicUsize::new(count),
            loading_complete: Event::new(),
            pool: Mutex::new(Some(pool)),
            cancelled: AtomicBool::new(false),
            reloc_threads: Mutex::new(Vec::new()),
            samplers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        // Samplers hook their designated store's bind completion, so they
        // must be wired before any bind work is queued.
        if !readonly {
            start_samplers(&inner);
        }
        bind::submit_metadata_info(&inner);
        info!(
            stores = count,
            mode = ?inner.config.mode,
            "trace context initialized"
        );

        let context = Self { inner };
        if synchronous {
            context.wait_for_loading();
            let failed = context.failed_count();
            if failed > 0 {
                return Err(TraceStoreError::BindFailed { failed });
            }
        }
        Ok(context)
    }

    pub fn config(&self) -> &TraceConfig {
        &self.inner.config
    }

    pub fn session(&self) -> Option<SessionId> {
        self.inner.session
    }

    pub fn is_loading_complete(&self) -> bool {
        self.inner.loading_complete.is_signaled()
    }

    /// Blocks until every store has reached a terminal state.
    pub fn wait_for_loading(&self) {
        self.inner.loading_complete.wait();
    }

    pub fn wait_for_loading_timeout(&self, timeout: Duration) -> TraceResult<()> {
        if self.inner.loading_complete.wait_timeout(timeout) {
            Ok(())
        } else {
            Err(TraceStoreError::wait_failed(format!(
                "loading did not complete within {timeout:?}"
            )))
        }
    }

    /// Stores that failed their bind so far.
    pub fn failed_count(&self) -> usize {
        self.inner.failed_count.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> Vec<BindFailure> {
        self.inner.failures.lock().clone()
    }

    pub fn store(&self, id: StoreId) -> Option<Arc<TraceStore>> {
        self.inner.store_by_id(id).cloned()
    }

    pub fn stores(&self) -> &[Arc<TraceStore>] {
        &self.inner.stores
    }

    /// Allocates records in `store`, blocking while its bind is in flight.
    pub fn allocate_records(
        &self,
        store: StoreId,
        record_size: u64,
        record_count: u64,
    ) -> Option<RecordHandle> {
        self.inner
            .store_by_id(store)?
            .allocate_records(record_size, record_count)
    }

    /// Timestamped variant of [`allocate_records`](Self::allocate_records).
    pub fn allocate_records_with_timestamp(
        &self,
        store: StoreId,
        record_size: u64,
        record_count: u64,
        timestamp_micros: u64,
    ) -> Option<RecordHandle> {
        self.inner.store_by_id(store)?.allocate_records_with_timestamp(
            record_size,
            record_count,
            timestamp_micros,
        )
    }

    pub fn progress(&self) -> PipelineProgress {
        let snapshot = |work: &BindWork| PhaseProgress {
            total: work.total(),
            active: work.active(),
            failed: work.failed(),
        };
        PipelineProgress {
            metadata_info: snapshot(&self.inner.works.metadata_info),
            remaining_metadata: snapshot(&self.inner.works.remaining_metadata),
            store_bind: snapshot(&self.inner.works.store_bind),
            readonly_complete: snapshot(&self.inner.works.readonly_complete),
            stores_pending: self.inner.binds_in_progress.load(Ordering::Acquire),
        }
    }

    /// Asks the pipeline to stop.  Phases not yet started are abandoned
    /// and their stores published failed; phases already running finish.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            debug!("bind pipeline cancelled");
        }
    }

    /// Shuts the session down: waits out the pipeline, stops the
    /// samplers, seals every ready read-write store, and tears down the
    /// worker pool.  Idempotent; also run on drop.
    pub fn close(&self) -> TraceResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.loading_complete.wait();

        for sampler in self.inner.samplers.lock().drain(..) {
            sampler.stop();
        }
        for handle in self.inner.reloc_threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("relocation thread panicked");
            }
        }
        for store in &self.inner.stores {
            store.set_bind_complete_hook(None);
        }

        let mut first_error = None;
        if self.inner.config.mode == TraceMode::ReadWrite {
            for store in &self.inner.stores {
                if let Err(err) = store.seal() {
                    warn!(store = %store.id(), error = %err, "store seal failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        // All bind work has settled; the pool is idle and joins cleanly.
        let pool = self.inner.pool.lock().take();
        drop(pool);
        info!(failed = self.failed_count(), "trace context closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for TraceContext {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "error while closing trace context");
        }
    }
}

fn validate(
    config: &TraceConfig,
    session: Option<SessionId>,
    store_set: &StoreSet,
) -> TraceResult<()> {
    if config.worker_threads == 0 {
        return Err(TraceStoreError::invalid_config(
            "worker_threads must be at least 1",
        ));
    }
    if store_set.descriptors.is_empty() {
        return Err(TraceStoreError::invalid_config("store set is empty"));
    }

    let mut seen = std::collections::HashSet::with_capacity(store_set.descriptors.len());
    for descriptor in &store_set.descriptors {
        if !descriptor.id.is_valid() {
            return Err(TraceStoreError::invalid_config(format!(
                "store id {} is out of range",
                descriptor.id
            )));
        }
        if !seen.insert(descriptor.id) {
            return Err(TraceStoreError::invalid_config(format!(
                "duplicate store id {}",
                descriptor.id
            )));
        }
        if descriptor.name.is_empty() {
            return Err(TraceStoreError::invalid_config(format!(
                "store {} has an empty name",
                descriptor.id
            )));
        }
        if descriptor.reserved_bytes == 0 {
            return Err(TraceStoreError::invalid_config(format!(
                "store {} reserves zero bytes",
                descriptor.id
            )));
        }
    }
    for descriptor in &store_set.descriptors {
        for dep in &descriptor.relocation_dependencies {
            if *dep == descriptor.id {
                return Err(TraceStoreError::invalid_config(format!(
                    "store {} depends on itself",
                    descriptor.id
                )));
            }
            if !seen.contains(dep) {
                return Err(TraceStoreError::invalid_config(format!(
                    "store {} depends on unknown store {dep}",
                    descriptor.id
                )));
            }
        }
    }

    match config.mode {
        TraceMode::ReadWrite => {
            if session.is_none() {
                return Err(TraceStoreError::invalid_config(
                    "read-write mode requires a session id",
                ));
            }
            if store_set.readonly {
                return Err(TraceStoreError::invalid_config(
                    "read-write mode cannot use a readonly store set",
                ));
            }
            if config.flags.ignore_preferred_addresses != 0 {
                return Err(TraceStoreError::invalid_config(
                    "ignore-preferred-addresses bitmap is readonly-only",
                ));
            }
            validate_sampler(
                &seen,
                "working-set",
                config.flags.enable_working_set_sampler,
                config.flags.working_set_store,
            )?;
            validate_sampler(
                &seen,
                "performance",
                config.flags.enable_performance_sampler,
                config.flags.performance_store,
            )?;
        }
        TraceMode::Readonly => {
            if !store_set.readonly {
                return Err(TraceStoreError::invalid_config(
                    "readonly mode requires a readonly store set",
                ));
            }
            let bitmap = config.flags.ignore_preferred_addresses;
            if bitmap != 0 {
                let mut remaining = bitmap;
                while remaining != 0 {
                    let bit = remaining.trailing_zeros() as u16;
                    remaining &= remaining - 1;
                    if !seen.contains(&StoreId::new(bit)) {
                        return Err(TraceStoreError::invalid_config(format!(
                            "ignore-preferred-addresses bit {bit} matches no store"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_sampler(
    known: &std::collections::HashSet<StoreId>,
    name: &str,
    enabled: bool,
    target: Option<StoreId>,
) -> TraceResult<()> {
    if !enabled {
        return Ok(());
    }
    match target {
        None => Err(TraceStoreError::invalid_config(format!(
            "{name} sampler enabled without a designated store"
        ))),
        Some(id) if !known.contains(&id) => Err(TraceStoreError::invalid_config(format!(
            "{name} sampler store {id} is not part of the store set"
        ))),
        Some(_) => Ok(()),
    }
}

/// Wires the optional samplers: each one waits on its designated store's
/// bind-complete hook, then appends one sample record per interval until
/// the context closes or the store runs out of space.
fn start_samplers(inner: &Arc<ContextInner>) {
    let flags = inner.config.flags;
    let interval = Duration::from_millis(inner.config.sampler_interval_ms);
    let mut samplers = Vec::new();

    if flags.enable_working_set_sampler {
        if let Some(store_id) = flags.working_set_store {
            let weak = Arc::downgrade(inner);
            if let Some(sampler) = wire_sampler(inner, store_id, "trace-ws-sampler", interval, {
                move |store| {
                    let ctx = weak.upgrade()?;
                    let mut committed = 0u64;
                    let mut reserved = 0u64;
                    for other in &ctx.stores {
                        committed += other.committed_bytes();
                        reserved += other.reserved_capacity();
                    }
                    write_sample(store, committed, reserved)
                }
            }) {
                samplers.push(sampler);
            }
        }
    }
    if flags.enable_performance_sampler {
        if let Some(store_id) = flags.performance_store {
            let weak = Arc::downgrade(inner);
            if let Some(sampler) = wire_sampler(inner, store_id, "trace-perf-sampler", interval, {
                move |store| {
                    let ctx = weak.upgrade()?;
                    let mut allocations = 0u64;
                    let mut dropped = 0u64;
                    for other in &ctx.stores {
                        allocations += other.total_allocations();
                        dropped += other.dropped_allocations();
                    }
                    write_sample(store, allocations, dropped)
                }
            }) {
                samplers.push(sampler);
            }
        }
    }

    if !samplers.is_empty() {
        *inner.samplers.lock() = samplers;
    }
}

fn wire_sampler<F>(
    inner: &Arc<ContextInner>,
    store_id: StoreId,
    name: &str,
    interval: Duration,
    mut tick: F,
) -> Option<Sampler>
where
    F: FnMut(&TraceStore) -> Option<()> + Send + 'static,
{
    let store = inner.store_by_id(store_id)?.clone();
    let start = Arc::new(Event::new());
    {
        let start = start.clone();
        store.set_bind_complete_hook(Some(Box::new(move || start.signal())));
    }
    match Sampler::spawn(name, interval, start, {
        let store = store.clone();
        Box::new(move || tick(&store).is_some())
    }) {
        Ok(sampler) => Some(sampler),
        Err(err) => {
            warn!(store = %store_id, error = %err, "sampler thread failed to start");
            None
        }
    }
}

/// Appends one `[micros, a, b]` sample to the designated store.  Returns
/// `None` once the store stops accepting samples.
fn write_sample(store: &TraceStore, a: u64, b: u64) -> Option<()> {
    let handle = store.try_allocate_records(SAMPLE_RECORD_LEN, 1)?;
    let slice = store.record_slice_mut(&handle).ok()?;
    let micros = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    LittleEndian::write_u64(&mut slice[0..8], micros);
    LittleEndian::write_u64(&mut slice[8..16], a);
    LittleEndian::write_u64(&mut slice[16..24], b);
    Some(())
}
