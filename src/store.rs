//! A single trace store: one mapped region plus its nine metadata channels.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::alloc::{AllocatorGate, AllocatorStrategy};
use crate::config::{StoreDescriptor, StoreId, StoreTraits};
use crate::error::{TraceResult, TraceStoreError};
use crate::meta::{
    AddressRangeRecord, AddressRecord, AllocationRecord, AllocationTimestampDeltaRecord,
    AllocationTimestampRecord, InfoRecord, MetadataChannel, MetadataInfoRecord, MetadataKind,
    SynchronizationRecord,
};
use crate::region::{MappedRegion, RegionOffset};

/// Progress of one store through the bind pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BindState {
    Unbound = 0,
    MetadataInfoBound = 1,
    MetadataBound = 2,
    /// Region mapped readonly; pointer fixup has not run yet.
    RelocationPending = 3,
    Ready = 4,
    Failed = 5,
}

impl BindState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BindState::Unbound,
            1 => BindState::MetadataInfoBound,
            2 => BindState::MetadataBound,
            3 => BindState::RelocationPending,
            4 => BindState::Ready,
            _ => BindState::Failed,
        }
    }
}

/// A completed allocation: `len` bytes at `offset` within one store's
/// region.  Offsets stay valid for the life of the session; resolve them
/// through the store on each access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHandle {
    pub store: StoreId,
    pub offset: RegionOffset,
    pub len: u64,
}

/// Per-store settings lifted out of the context configuration.
#[derive(Debug, Clone)]
pub(crate) struct StoreSettings {
    pub root_dir: PathBuf,
    pub readonly: bool,
    pub page_size: u64,
    pub extension_granularity: u64,
    pub spin_count: u32,
    /// Preferred mapping address from the recorded metadata is advisory
    /// only when this store's bit is set.
    pub ignore_preferred_address: bool,
}

/// Closure invoked once a store's bind publishes successfully.
pub type BindCompleteHook = Box<dyn Fn() + Send + Sync>;

pub struct TraceStore {
    id: StoreId,
    name: String,
    traits: StoreTraits,
    reserved_bytes: u64,
    relocation_dependencies: Vec<StoreId>,
    settings: StoreSettings,
    strategy: AllocatorStrategy,

    region: OnceLock<MappedRegion>,
    channels: [OnceLock<MetadataChannel>; MetadataKind::ALL.len()],

    bind_state: AtomicU8,
    gate: AllocatorGate,
    cursor: AtomicU64,
    /// Serializes region extension.  The cursor itself is lock-free.
    growth: Mutex<()>,

    bind_complete: crate::sync::CompletionSignal,
    relocation_complete: crate::sync::CompletionSignal,
    bind_complete_hook: Mutex<Option<BindCompleteHook>>,

    total_allocations: AtomicU64,
    total_bytes: AtomicU64,
    dropped_allocations: AtomicU64,

    /// Base the region was mapped at when the session was recorded.
    recorded_base: AtomicU64,
    /// Recorded preferred base for future sessions.
    preferred_base: AtomicU64,
    /// Signed difference between the current and recorded base, published
    /// once relocation resolves it.
    relocation_delta: AtomicI64,

    last_timestamp_micros: AtomicU64,
    epoch: Instant,
}

impl TraceStore {
    pub(crate) fn new(descriptor: &StoreDescriptor, settings: StoreSettings) -> Self {
        Self {
            id: descriptor.id,
            name: descriptor.name.clone(),
            traits: descriptor.traits,
            reserved_bytes: descriptor.reserved_bytes,
            relocation_dependencies: descriptor.relocation_dependencies.clone(),
            strategy: AllocatorStrategy::select(descriptor.traits),
            settings,
            region: OnceLock::new(),
            channels: std::array::from_fn(|_| OnceLock::new()),
            bind_state: AtomicU8::new(BindState::Unbound as u8),
            gate: AllocatorGate::new(),
            cursor: AtomicU64::new(0),
            growth: Mutex::new(()),
            bind_complete: crate::sync::CompletionSignal::new(),
            relocation_complete: crate::sync::CompletionSignal::new(),
            bind_complete_hook: Mutex::new(None),
            total_allocations: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            dropped_allocations: AtomicU64::new(0),
            recorded_base: AtomicU64::new(0),
            preferred_base: AtomicU64::new(0),
            relocation_delta: AtomicI64::new(0),
            last_timestamp_micros: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    #[inline]
    pub fn id(&self) -> StoreId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn traits(&self) -> StoreTraits {
        self.traits
    }

    #[inline]
    pub fn strategy(&self) -> AllocatorStrategy {
        self.strategy
    }

    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.settings.readonly
    }

    pub fn bind_state(&self) -> BindState {
        BindState::from_u8(self.bind_state.load(Ordering::Acquire))
    }

    fn set_bind_state(&self, state: BindState) {
        self.bind_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn relocation_dependencies(&self) -> &[StoreId] {
        &self.relocation_dependencies
    }

    pub(crate) fn bind_complete_signal(&self) -> &crate::sync::CompletionSignal {
        &self.bind_complete
    }

    pub(crate) fn relocation_complete_signal(&self) -> &crate::sync::CompletionSignal {
        &self.relocation_complete
    }

    /// Installs a closure invoked after the store's bind completes
    /// successfully, replacing any earlier hook.  If the store is already
    /// ready the hook fires immediately on the caller's thread.  The ready
    /// transition and the install both hold the hook lock, so a hook
    /// installed while the bind is publishing still fires exactly once.
    pub fn set_bind_complete_hook(&self, hook: Option<BindCompleteHook>) {
        let mut slot = self.bind_complete_hook.lock();
        let fire_now = self.bind_state() == BindState::Ready;
        *slot = hook;
        if fire_now {
            if let Some(hook) = &*slot {
                hook();
            }
        }
    }

    pub fn total_allocations(&self) -> u64 {
        self.total_allocations.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// Allocations refused because the store never became ready or ran out
    /// of reserved space.
    pub fn dropped_allocations(&self) -> u64 {
        self.dropped_allocations.load(Ordering::Acquire)
    }

    /// Bytes of the reservation currently committed.
    pub fn committed_bytes(&self) -> u64 {
        self.region.get().map(MappedRegion::committed).unwrap_or(0)
    }

    /// Total reserved address space declared for the store.
    pub fn reserved_capacity(&self) -> u64 {
        self.reserved_bytes
    }

    /// Base address of the store's mapping in this process.
    pub fn base_addr(&self) -> u64 {
        self.region.get().map(MappedRegion::base_addr).unwrap_or(0)
    }

    /// Signed base-address displacement resolved by the relocation pass.
    pub fn relocation_delta(&self) -> i64 {
        self.relocation_delta.load(Ordering::Acquire)
    }

    pub(crate) fn set_relocation_delta(&self, delta: i64) {
        self.relocation_delta.store(delta, Ordering::Release);
    }

    pub(crate) fn recorded_base(&self) -> u64 {
        self.recorded_base.load(Ordering::Acquire)
    }

    fn region(&self) -> TraceResult<&MappedRegion> {
        self.region.get().ok_or(TraceStoreError::NotBound(self.id))
    }

    pub fn channel(&self, kind: MetadataKind) -> TraceResult<&MetadataChannel> {
        self.channels[kind.as_index()]
            .get()
            .ok_or(TraceStoreError::NotBound(self.id))
    }

    fn micros_since_epoch(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    // ----- bind pipeline steps, run on pool workers -----

    /// First bind phase: the metadata-info channel, which describes the
    /// record layout of every sibling channel.
    pub(crate) fn bind_metadata_info(&self) -> TraceResult<()> {
        let channel = if self.settings.readonly {
            MetadataChannel::open_readonly(
                &self.settings.root_dir,
                &self.name,
                MetadataKind::MetadataInfo,
            )?
        } else {
            let channel = MetadataChannel::create(
                &self.settings.root_dir,
                &self.name,
                MetadataKind::MetadataInfo,
            )?;
            for kind in MetadataKind::REMAINING {
                channel.append(&MetadataInfoRecord {
                    kind,
                    record_size: kind.record_size(),
                })?;
            }
            channel
        };
        self.channels[MetadataKind::MetadataInfo.as_index()]
            .set(channel)
            .map_err(|_| TraceStoreError::invalid_state("metadata-info channel already bound"))?;
        self.set_bind_state(BindState::MetadataInfoBound);
        debug!(store = %self.id, "metadata-info channel bound");
        Ok(())
    }

    /// Binds one of the eight remaining channels.  Readonly sessions
    /// cross-check the recorded layout before trusting the channel.
    pub(crate) fn bind_channel(&self, kind: MetadataKind) -> TraceResult<()> {
        debug_assert_ne!(kind, MetadataKind::MetadataInfo);
        let channel = if self.settings.readonly {
            let channel =
                MetadataChannel::open_readonly(&self.settings.root_dir, &self.name, kind)?;
            self.verify_recorded_layout(kind)?;
            channel
        } else {
            MetadataChannel::create(&self.settings.root_dir, &self.name, kind)?
        };
        self.channels[kind.as_index()]
            .set(channel)
            .map_err(|_| {
                TraceStoreError::invalid_state(format!("{kind} channel already bound"))
            })?;
        Ok(())
    }

    fn verify_recorded_layout(&self, kind: MetadataKind) -> TraceResult<()> {
        let info = self.channel(MetadataKind::MetadataInfo)?;
        let records = info.read_records::<MetadataInfoRecord>()?;
        let recorded = records
            .iter()
            .find(|record| record.kind == kind)
            .ok_or_else(|| {
                TraceStoreError::corruption(format!(
                    "store {} has no recorded layout for {kind} channel",
                    self.id
                ))
            })?;
        if recorded.record_size != kind.record_size() {
            return Err(TraceStoreError::corruption(format!(
                "store {} {kind} channel records are {} bytes, expected {}",
                self.id,
                recorded.record_size,
                kind.record_size()
            )));
        }
        Ok(())
    }

    /// Marks the remaining-metadata phase complete for this store.
    pub(crate) fn finish_metadata_bind(&self) {
        self.set_bind_state(BindState::MetadataBound);
    }

    /// Third phase: map the store's primary region.
    ///
    /// Read-write sessions create the backing file and record the mapping
    /// address and synchronization parameters.  Readonly sessions map
    /// copy-on-write and restore cursor and committed size from the
    /// recorded metadata.
    pub(crate) fn bind_region(&self) -> TraceResult<()> {
        if self.settings.readonly {
            self.bind_region_readonly()
        } else {
            self.bind_region_read_write()
        }
    }

    fn bind_region_read_write(&self) -> TraceResult<()> {
        let path = self.settings.root_dir.join(format!("{}.store", self.name));
        let initial = self
            .settings
            .extension_granularity
            .min(self.reserved_bytes);
        let region = MappedRegion::create(&path, self.reserved_bytes, initial)?;
        let base = region.base_addr();

        self.channel(MetadataKind::Address)?.append(&AddressRecord {
            preferred_base: base,
            mapped_base: base,
            mapped_at_micros: self.micros_since_epoch(),
        })?;
        self.channel(MetadataKind::AddressRange)?
            .append(&AddressRangeRecord {
                offset: 0,
                len: initial,
                base,
            })?;
        self.channel(MetadataKind::Synchronization)?
            .append(&SynchronizationRecord {
                spin_count: self.settings.spin_count,
                concurrent_allocations: self.traits.concurrent_allocations,
            })?;

        self.region
            .set(region)
            .map_err(|_| TraceStoreError::invalid_state("region already bound"))?;
        debug!(store = %self.id, base, committed = initial, "store region created");
        Ok(())
    }

    fn bind_region_readonly(&self) -> TraceResult<()> {
        let path = self.settings.root_dir.join(format!("{}.store", self.name));
        let region = MappedRegion::open_cow(&path)?;

        let ranges = self
            .channel(MetadataKind::AddressRange)?
            .read_records::<AddressRangeRecord>()?;
        let committed = ranges
            .iter()
            .map(|range| range.offset + range.len)
            .max()
            .unwrap_or(0);
        if committed == 0 {
            return Err(TraceStoreError::corruption(format!(
                "store {} has no recorded address ranges",
                self.id
            )));
        }
        region.set_committed(committed);

        let addresses = self
            .channel(MetadataKind::Address)?
            .read_records::<AddressRecord>()?;
        let recorded = addresses.first().ok_or_else(|| {
            TraceStoreError::corruption(format!("store {} has no recorded address", self.id))
        })?;
        self.recorded_base
            .store(recorded.mapped_base, Ordering::Release);
        if !self.settings.ignore_preferred_address {
            self.preferred_base
                .store(recorded.preferred_base, Ordering::Release);
        }

        let infos = self
            .channel(MetadataKind::Info)?
            .read_records::<InfoRecord>()?;
        if let Some(info) = infos.last() {
            self.cursor.store(info.end_of_data, Ordering::Release);
            self.total_allocations
                .store(info.total_allocations, Ordering::Release);
            self.total_bytes.store(info.total_bytes, Ordering::Release);
        }

        let base = region.base_addr();
        self.region
            .set(region)
            .map_err(|_| TraceStoreError::invalid_state("region already bound"))?;
        debug!(
            store = %self.id,
            base,
            recorded_base = recorded.mapped_base,
            committed,
            "store region mapped readonly"
        );
        Ok(())
    }

    /// True when the store still needs the pointer-fixup pass after its
    /// region bind.  Streaming stores are consumed incrementally and are
    /// never relocated.
    pub(crate) fn needs_relocation(&self) -> bool {
        self.settings.readonly && !self.traits.streaming
    }

    pub(crate) fn mark_relocation_pending(&self) {
        self.set_bind_state(BindState::RelocationPending);
    }

    /// Publishes the bound store: allocator resumed, completion signaled,
    /// hook fired.  State is stored before any signal so woken waiters see
    /// the final state.
    pub(crate) fn publish_ready(&self) {
        // The ready transition happens under the hook lock; see
        // set_bind_complete_hook.
        let hook = self.bind_complete_hook.lock();
        self.set_bind_state(BindState::Ready);
        self.gate.publish_ready();
        self.bind_complete.complete_ok();
        // No-op for stores the relocation pass already completed.
        self.relocation_complete.complete_ok();
        if let Some(hook) = &*hook {
            hook();
        }
        debug!(store = %self.id, "store ready");
    }

    /// Publishes a failed store.  Both completion signals fire with the
    /// failed marker so dependents and suspended allocators wake instead
    /// of hanging.  Returns true for the first failure; later calls for
    /// the same store are no-ops.
    pub(crate) fn publish_failed(&self, reason: &str) -> bool {
        let previous = self.bind_state.swap(BindState::Failed as u8, Ordering::AcqRel);
        if previous == BindState::Failed as u8 {
            return false;
        }
        self.gate.publish_failed();
        self.bind_complete.complete_failed(reason);
        self.relocation_complete.complete_failed(reason);
        warn!(store = %self.id, reason, "store bind failed");
        true
    }

    // ----- allocation -----

    /// Allocates `record_count` records of `record_size` bytes.
    ///
    /// Blocks while the store's bind is still in flight; returns `None`
    /// when the bind failed, the sizes are degenerate, or the reserved
    /// address space is exhausted.
    pub fn allocate_records(&self, record_size: u64, record_count: u64) -> Option<RecordHandle> {
        if !self.gate.wait_ready() {
            self.dropped_allocations.fetch_add(1, Ordering::AcqRel);
            return None;
        }
        self.allocate_ready(record_size, record_count, None)
    }

    /// Like [`allocate_records`](Self::allocate_records), also appending
    /// the caller's timestamp and its delta from the previous timestamped
    /// allocation to the timestamp channels.
    pub fn allocate_records_with_timestamp(
        &self,
        record_size: u64,
        record_count: u64,
        timestamp_micros: u64,
    ) -> Option<RecordHandle> {
        if !self.gate.wait_ready() {
            self.dropped_allocations.fetch_add(1, Ordering::AcqRel);
            return None;
        }
        self.allocate_ready(record_size, record_count, Some(timestamp_micros))
    }

    /// Non-blocking allocation for concurrent stores: returns `None`
    /// immediately while the bind is still in flight.
    pub fn try_allocate_records(
        &self,
        record_size: u64,
        record_count: u64,
    ) -> Option<RecordHandle> {
        if !self.gate.is_ready() {
            self.dropped_allocations.fetch_add(1, Ordering::AcqRel);
            return None;
        }
        self.allocate_ready(record_size, record_count, None)
    }

    fn allocate_ready(
        &self,
        record_size: u64,
        record_count: u64,
        timestamp_micros: Option<u64>,
    ) -> Option<RecordHandle> {
        if self.settings.readonly {
            self.dropped_allocations.fetch_add(1, Ordering::AcqRel);
            return None;
        }
        let requested = record_size.checked_mul(record_count)?;
        if requested == 0 {
            return None;
        }
        let len = self
            .strategy
            .aligned_len(requested, self.settings.page_size);

        let offset = loop {
            let region = self.region.get()?;
            let limit = region.committed();
            if let Some(offset) = self.strategy.advance(&self.cursor, len, limit) {
                break offset;
            }
            if !self.grow_for(len) {
                self.dropped_allocations.fetch_add(1, Ordering::AcqRel);
                return None;
            }
        };

        self.total_allocations.fetch_add(1, Ordering::AcqRel);
        self.total_bytes.fetch_add(len, Ordering::AcqRel);
        self.record_allocation_metadata(record_size, record_count, timestamp_micros);

        Some(RecordHandle {
            store: self.id,
            offset: RegionOffset(offset),
            len,
        })
    }

    /// Commits more of the reservation so the cursor can advance by `len`.
    /// Returns false when the reservation is exhausted.
    fn grow_for(&self, len: u64) -> bool {
        let _guard = self.growth.lock();
        let region = match self.region() {
            Ok(region) => region,
            Err(_) => return false,
        };
        let needed = match self.cursor.load(Ordering::Acquire).checked_add(len) {
            Some(needed) => needed,
            None => return false,
        };
        // Another thread may have grown the region while we waited.
        if needed <= region.committed() {
            return true;
        }
        match region.extend_to(needed, self.settings.extension_granularity) {
            Ok(range) if range.is_empty() => true,
            Ok(range) => {
                let record = AddressRangeRecord {
                    offset: range.start,
                    len: range.end - range.start,
                    base: region.base_addr(),
                };
                if let Err(err) = self
                    .channel(MetadataKind::AddressRange)
                    .and_then(|channel| channel.append(&record))
                {
                    warn!(store = %self.id, error = %err, "address-range metadata append failed");
                }
                debug!(store = %self.id, committed = range.end, "store region extended");
                true
            }
            Err(err) => {
                debug!(store = %self.id, error = %err, "store region exhausted");
                false
            }
        }
    }

    fn record_allocation_metadata(
        &self,
        record_size: u64,
        record_count: u64,
        timestamp_micros: Option<u64>,
    ) {
        let record = AllocationRecord {
            record_size,
            record_count,
        };
        if let Err(err) = self
            .channel(MetadataKind::Allocation)
            .and_then(|channel| channel.append(&record))
        {
            warn!(store = %self.id, error = %err, "allocation metadata append failed");
        }
        let Some(micros) = timestamp_micros else {
            return;
        };
        let previous = self.last_timestamp_micros.swap(micros, Ordering::AcqRel);
        let delta = micros.saturating_sub(previous).min(u32::MAX as u64) as u32;
        let appended = self
            .channel(MetadataKind::AllocationTimestamp)
            .and_then(|channel| channel.append(&AllocationTimestampRecord { micros }))
            .and_then(|_| {
                self.channel(MetadataKind::AllocationTimestampDelta)?
                    .append(&AllocationTimestampDeltaRecord { delta_micros: delta })
            });
        if let Err(err) = appended {
            warn!(store = %self.id, error = %err, "timestamp metadata append failed");
        }
    }

    // ----- record access -----

    pub fn record_slice(&self, handle: &RecordHandle) -> TraceResult<&[u8]> {
        self.check_handle(handle)?;
        let start = handle.offset.get() as usize;
        self.region()?.read_slice(start..start + handle.len as usize)
    }

    pub fn record_slice_mut(&self, handle: &RecordHandle) -> TraceResult<&mut [u8]> {
        self.check_handle(handle)?;
        let start = handle.offset.get() as usize;
        self.region()?.slice_mut(start..start + handle.len as usize)
    }

    fn check_handle(&self, handle: &RecordHandle) -> TraceResult<()> {
        if handle.store != self.id {
            return Err(TraceStoreError::invalid_state(format!(
                "handle for store {} resolved against store {}",
                handle.store, self.id
            )));
        }
        let end = handle
            .offset
            .get()
            .checked_add(handle.len)
            .ok_or_else(|| TraceStoreError::invalid_state("record handle overflows"))?;
        let region = self.region()?;
        if end > region.committed() {
            return Err(TraceStoreError::invalid_state(format!(
                "record {}..{} beyond committed {} bytes",
                handle.offset.get(),
                end,
                region.committed()
            )));
        }
        Ok(())
    }

    /// Reads `len` bytes at a raw region offset.  Used by readers walking
    /// a reopened session.
    pub fn read_at(&self, offset: RegionOffset, len: u64) -> TraceResult<&[u8]> {
        let start = offset.get() as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or_else(|| TraceStoreError::invalid_state("read range overflows"))?;
        self.region()?.read_slice(start..end)
    }

    /// Mutable view of one pointer-sized field, bounds-checked against the
    /// committed size.  Used by the relocation pass.
    pub(crate) fn field_slice_mut(&self, offset: u64) -> TraceResult<&mut [u8]> {
        let end = offset
            .checked_add(8)
            .ok_or_else(|| TraceStoreError::corruption("relocation field offset overflows"))?;
        let region = self.region()?;
        if end > region.committed() {
            return Err(TraceStoreError::corruption(format!(
                "relocation field at {offset} beyond committed {} bytes",
                region.committed()
            )));
        }
        region.slice_mut(offset as usize..end as usize)
    }

    /// Marks a pointer-sized field at `field_offset` as pointing into
    /// `target`'s region, so a readonly session can fix it up after
    /// remapping.
    pub fn record_relocation(&self, field_offset: u64, target: StoreId) -> TraceResult<()> {
        self.channel(MetadataKind::Relocation)?
            .append(&crate::meta::RelocationRecord {
                field_offset,
                target_store: target,
            })
    }

    /// Writes the closing info record and persists every channel.  Only
    /// meaningful for a ready read-write store.
    pub(crate) fn seal(&self) -> TraceResult<()> {
        if self.settings.readonly || self.bind_state() != BindState::Ready {
            return Ok(());
        }
        self.channel(MetadataKind::Info)?.append(&InfoRecord {
            total_allocations: self.total_allocations(),
            total_bytes: self.total_bytes(),
            end_of_data: self.cursor.load(Ordering::Acquire),
        })?;
        for kind in MetadataKind::ALL {
            if let Some(channel) = self.channels[kind.as_index()].get() {
                channel.seal()?;
            }
        }
        self.region()?.flush()?;
        debug!(store = %self.id, allocations = self.total_allocations(), "store sealed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreDescriptor;
    use tempfile::TempDir;

    fn settings(tmp: &TempDir, readonly: bool) -> StoreSettings {
        StoreSettings {
            root_dir: tmp.path().to_path_buf(),
            readonly,
            page_size: 4096,
            extension_granularity: 64 * 1024,
            spin_count: 4000,
            ignore_preferred_address: false,
        }
    }

    fn bind_all(store: &TraceStore) {
        store.bind_metadata_info().expect("metadata info");
        for kind in MetadataKind::REMAINING {
            store.bind_channel(kind).expect("channel");
        }
        store.finish_metadata_bind();
        store.bind_region().expect("region");
        store.publish_ready();
    }

    #[test]
    fn allocation_after_bind() {
        let tmp = TempDir::new().expect("tempdir");
        let descriptor = StoreDescriptor::new(StoreId::new(1), "events")
            .with_reserved_bytes(1024 * 1024);
        let store = TraceStore::new(&descriptor, settings(&tmp, false));
        bind_all(&store);

        let handle = store.allocate_records(32, 4).expect("allocate");
        assert_eq!(handle.len, 128);
        store.record_slice_mut(&handle).expect("slice")[..4].copy_from_slice(b"data");
        assert_eq!(&store.record_slice(&handle).expect("read")[..4], b"data");
        assert_eq!(store.total_allocations(), 1);
        assert_eq!(
            store
                .channel(MetadataKind::Allocation)
                .expect("channel")
                .record_count(),
            1
        );
    }

    #[test]
    fn allocation_blocked_until_published() {
        let tmp = TempDir::new().expect("tempdir");
        let descriptor = StoreDescriptor::new(StoreId::new(1), "events");
        let store = TraceStore::new(&descriptor, settings(&tmp, false));
        assert!(store.try_allocate_records(8, 1).is_none());
        assert_eq!(store.dropped_allocations(), 1);
    }

    #[test]
    fn failed_store_refuses_allocations() {
        let tmp = TempDir::new().expect("tempdir");
        let descriptor = StoreDescriptor::new(StoreId::new(1), "events");
        let store = TraceStore::new(&descriptor, settings(&tmp, false));
        store.publish_failed("mapping failed");
        assert!(store.allocate_records(8, 1).is_none());
        assert_eq!(store.bind_state(), BindState::Failed);
        assert_eq!(store.bind_complete_signal().outcome(), Some(false));
        assert_eq!(store.relocation_complete_signal().outcome(), Some(false));
    }

    #[test]
    fn growth_preserves_earlier_handles() {
        let tmp = TempDir::new().expect("tempdir");
        let descriptor = StoreDescriptor::new(StoreId::new(1), "events")
            .with_reserved_bytes(1024 * 1024);
        let store = TraceStore::new(&descriptor, settings(&tmp, false));
        bind_all(&store);

        let first = store.allocate_records(8, 1).expect("allocate");
        store.record_slice_mut(&first).expect("slice").copy_from_slice(b"keepsake");

        // Force multiple extensions past the initial commit.
        for _ in 0..40 {
            store.allocate_records(4096, 1).expect("allocate");
        }
        assert_eq!(store.record_slice(&first).expect("read"), b"keepsake");
        let ranges = store
            .channel(MetadataKind::AddressRange)
            .expect("channel")
            .read_records::<AddressRangeRecord>()
            .expect("read");
        assert!(ranges.len() > 1);
    }

    #[test]
    fn exhausted_reservation_drops_allocation() {
        let tmp = TempDir::new().expect("tempdir");
        let descriptor =
            StoreDescriptor::new(StoreId::new(1), "tiny").with_reserved_bytes(64 * 1024);
        let store = TraceStore::new(&descriptor, settings(&tmp, false));
        bind_all(&store);
        assert!(store.allocate_records(32 * 1024, 1).is_some());
        assert!(store.allocate_records(64 * 1024, 1).is_none());
        assert_eq!(store.dropped_allocations(), 1);
    }

    #[test]
    fn sealed_store_reopens_readonly() {
        let tmp = TempDir::new().expect("tempdir");
        let descriptor = StoreDescriptor::new(StoreId::new(1), "events")
            .with_reserved_bytes(1024 * 1024);
        {
            let store = TraceStore::new(&descriptor, settings(&tmp, false));
            bind_all(&store);
            let handle = store
                .allocate_records_with_timestamp(16, 2, 1_000)
                .expect("allocate");
            store.record_slice_mut(&handle).expect("slice")[..5].copy_from_slice(b"hello");
            store.seal().expect("seal");
        }

        let store = TraceStore::new(&descriptor, settings(&tmp, true));
        store.bind_metadata_info().expect("metadata info");
        for kind in MetadataKind::REMAINING {
            store.bind_channel(kind).expect("channel");
        }
        store.finish_metadata_bind();
        store.bind_region().expect("region");
        assert_eq!(store.total_allocations(), 1);
        assert_eq!(store.total_bytes(), 32);
        let bytes = store.read_at(RegionOffset(0), 5).expect("read");
        assert_eq!(bytes, b"hello");
        assert!(store.recorded_base() != 0);
        assert!(store.needs_relocation());
    }

    #[test]
    fn readonly_store_rejects_allocations() {
        let tmp = TempDir::new().expect("tempdir");
        let descriptor = StoreDescriptor::new(StoreId::new(1), "events");
        {
            let store = TraceStore::new(&descriptor, settings(&tmp, false));
            bind_all(&store);
            store.allocate_records(8, 1).expect("allocate");
            store.seal().expect("seal");
        }
        let store = TraceStore::new(&descriptor, settings(&tmp, true));
        store.bind_metadata_info().expect("metadata info");
        for kind in MetadataKind::REMAINING {
            store.bind_channel(kind).expect("channel");
        }
        store.finish_metadata_bind();
        store.bind_region().expect("region");
        store.publish_ready();
        assert!(store.allocate_records(8, 1).is_none());
        assert_eq!(store.dropped_allocations(), 1);
    }

    #[test]
    fn hook_fires_on_publish() {
        let tmp = TempDir::new().expect("tempdir");
        let descriptor = StoreDescriptor::new(StoreId::new(1), "events");
        let store = TraceStore::new(&descriptor, settings(&tmp, false));
        let fired = std::sync::Arc::new(AtomicU64::new(0));
        {
            let fired = fired.clone();
            store.set_bind_complete_hook(Some(Box::new(move || {
                fired.fetch_add(1, Ordering::AcqRel);
            })));
        }
        bind_all(&store);
        assert_eq!(fired.load(Ordering::Acquire), 1);
    }

    #[test]
    fn hook_installed_during_publish_fires_exactly_once() {
        let tmp = TempDir::new().expect("tempdir");
        let descriptor = StoreDescriptor::new(StoreId::new(1), "events");
        let store = std::sync::Arc::new(TraceStore::new(&descriptor, settings(&tmp, false)));
        store.bind_metadata_info().expect("metadata info");
        for kind in MetadataKind::REMAINING {
            store.bind_channel(kind).expect("channel");
        }
        store.finish_metadata_bind();
        store.bind_region().expect("region");

        // Whichever of publish and install wins the lock, the hook fires
        // once: at publish if installed first, at install if publish won.
        let publisher = {
            let store = store.clone();
            std::thread::spawn(move || store.publish_ready())
        };
        let fired = std::sync::Arc::new(AtomicU64::new(0));
        {
            let fired = fired.clone();
            store.set_bind_complete_hook(Some(Box::new(move || {
                fired.fetch_add(1, Ordering::AcqRel);
            })));
        }
        publisher.join().expect("join");
        assert_eq!(fired.load(Ordering::Acquire), 1);
    }
}
