//! The nine metadata side-stores shadowing every primary store.
//!
//! Each channel is a miniature append-only store in its own right: a small
//! mapped region holding fixed-size little-endian records of a single kind.
//! Channels are created with their owning store and bound before it; they
//! never outlive it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};

use super::config::StoreId;
use super::error::{TraceResult, TraceStoreError};
use super::region::MappedRegion;

const CHANNEL_MAGIC: u32 = 0x4D45_5443; // "CTEM"
const CHANNEL_VERSION: u16 = 1;
pub(crate) const CHANNEL_HEADER_SIZE: u64 = 16;

/// The fixed family of metadata channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum MetadataKind {
    MetadataInfo = 1,
    Allocation = 2,
    Relocation = 3,
    Address = 4,
    AddressRange = 5,
    AllocationTimestamp = 6,
    AllocationTimestampDelta = 7,
    Synchronization = 8,
    Info = 9,
}

impl MetadataKind {
    /// Every channel kind, MetadataInfo first: it is bound before the rest.
    pub const ALL: [MetadataKind; 9] = [
        MetadataKind::MetadataInfo,
        MetadataKind::Allocation,
        MetadataKind::Relocation,
        MetadataKind::Address,
        MetadataKind::AddressRange,
        MetadataKind::AllocationTimestamp,
        MetadataKind::AllocationTimestampDelta,
        MetadataKind::Synchronization,
        MetadataKind::Info,
    ];

    /// The channels bound in the remaining-metadata phase.
    pub const REMAINING: [MetadataKind; 8] = [
        MetadataKind::Allocation,
        MetadataKind::Relocation,
        MetadataKind::Address,
        MetadataKind::AddressRange,
        MetadataKind::AllocationTimestamp,
        MetadataKind::AllocationTimestampDelta,
        MetadataKind::Synchronization,
        MetadataKind::Info,
    ];

    pub const fn as_index(self) -> usize {
        self as u16 as usize - 1
    }

    pub const fn file_suffix(self) -> &'static str {
        match self {
            MetadataKind::MetadataInfo => "metadatainfo",
            MetadataKind::Allocation => "allocation",
            MetadataKind::Relocation => "relocation",
            MetadataKind::Address => "address",
            MetadataKind::AddressRange => "addressrange",
            MetadataKind::AllocationTimestamp => "timestamp",
            MetadataKind::AllocationTimestampDelta => "timestampdelta",
            MetadataKind::Synchronization => "synchronization",
            MetadataKind::Info => "info",
        }
    }

    pub const fn record_size(self) -> u64 {
        match self {
            MetadataKind::MetadataInfo => MetadataInfoRecord::ENCODED_LEN as u64,
            MetadataKind::Allocation => AllocationRecord::ENCODED_LEN as u64,
            MetadataKind::Relocation => RelocationRecord::ENCODED_LEN as u64,
            MetadataKind::Address => AddressRecord::ENCODED_LEN as u64,
            MetadataKind::AddressRange => AddressRangeRecord::ENCODED_LEN as u64,
            MetadataKind::AllocationTimestamp => AllocationTimestampRecord::ENCODED_LEN as u64,
            MetadataKind::AllocationTimestampDelta => {
                AllocationTimestampDeltaRecord::ENCODED_LEN as u64
            }
            MetadataKind::Synchronization => SynchronizationRecord::ENCODED_LEN as u64,
            MetadataKind::Info => InfoRecord::ENCODED_LEN as u64,
        }
    }

    /// Reserved bytes for the channel's backing region.  Allocation-paced
    /// channels get the larger windows.
    pub(crate) const fn reserved_bytes(self) -> u64 {
        match self {
            MetadataKind::Allocation
            | MetadataKind::AllocationTimestamp
            | MetadataKind::AllocationTimestampDelta => 1024 * 1024,
            _ => 64 * 1024,
        }
    }
}

impl TryFrom<u16> for MetadataKind {
    type Error = TraceStoreError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MetadataKind::MetadataInfo,
            2 => MetadataKind::Allocation,
            3 => MetadataKind::Relocation,
            4 => MetadataKind::Address,
            5 => MetadataKind::AddressRange,
            6 => MetadataKind::AllocationTimestamp,
            7 => MetadataKind::AllocationTimestampDelta,
            8 => MetadataKind::Synchronization,
            9 => MetadataKind::Info,
            _ => {
                return Err(TraceStoreError::corruption(format!(
                    "unknown metadata channel kind: {value}"
                )));
            }
        })
    }
}

impl std::fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_suffix())
    }
}

/// A fixed-size record persisted in one metadata channel.
pub trait MetadataRecord: Sized {
    const KIND: MetadataKind;
    const ENCODED_LEN: usize;

    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> TraceResult<Self>;
}

/// Describes one sibling channel's record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataInfoRecord {
    pub kind: MetadataKind,
    pub record_size: u64,
}

impl MetadataRecord for MetadataInfoRecord {
    const KIND: MetadataKind = MetadataKind::MetadataInfo;
    const ENCODED_LEN: usize = 16;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.kind as u16);
        buf[2..8].fill(0);
        LittleEndian::write_u64(&mut buf[8..16], self.record_size);
    }

    fn decode(buf: &[u8]) -> TraceResult<Self> {
        let kind = MetadataKind::try_from(LittleEndian::read_u16(&buf[0..2]))?;
        Ok(Self {
            kind,
            record_size: LittleEndian::read_u64(&buf[8..16]),
        })
    }
}

/// One record per record-allocation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub record_size: u64,
    pub record_count: u64,
}

impl MetadataRecord for AllocationRecord {
    const KIND: MetadataKind = MetadataKind::Allocation;
    const ENCODED_LEN: usize = 16;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.record_size);
        LittleEndian::write_u64(&mut buf[8..16], self.record_count);
    }

    fn decode(buf: &[u8]) -> TraceResult<Self> {
        Ok(Self {
            record_size: LittleEndian::read_u64(&buf[0..8]),
            record_count: LittleEndian::read_u64(&buf[8..16]),
        })
    }
}

/// Marks a pointer-sized field that must be fixed up when the session is
/// remapped at a different base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationRecord {
    /// Offset of the field within the owning store's region.
    pub field_offset: u64,
    /// Store whose address space the field points into.
    pub target_store: StoreId,
}

impl MetadataRecord for RelocationRecord {
    const KIND: MetadataKind = MetadataKind::Relocation;
    const ENCODED_LEN: usize = 16;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.field_offset);
        LittleEndian::write_u16(&mut buf[8..10], self.target_store.get());
        buf[10..16].fill(0);
    }

    fn decode(buf: &[u8]) -> TraceResult<Self> {
        Ok(Self {
            field_offset: LittleEndian::read_u64(&buf[0..8]),
            target_store: StoreId::new(LittleEndian::read_u16(&buf[8..10])),
        })
    }
}

/// Base address the store's region was mapped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRecord {
    /// Base address preferred for future mappings.
    pub preferred_base: u64,
    /// Base address actually obtained.
    pub mapped_base: u64,
    pub mapped_at_micros: u64,
}

impl MetadataRecord for AddressRecord {
    const KIND: MetadataKind = MetadataKind::Address;
    const ENCODED_LEN: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.preferred_base);
        LittleEndian::write_u64(&mut buf[8..16], self.mapped_base);
        LittleEndian::write_u64(&mut buf[16..24], self.mapped_at_micros);
    }

    fn decode(buf: &[u8]) -> TraceResult<Self> {
        Ok(Self {
            preferred_base: LittleEndian::read_u64(&buf[0..8]),
            mapped_base: LittleEndian::read_u64(&buf[8..16]),
            mapped_at_micros: LittleEndian::read_u64(&buf[16..24]),
        })
    }
}

/// One record per region commit: the initial window and every extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRangeRecord {
    /// Region-relative start of the committed range.
    pub offset: u64,
    pub len: u64,
    /// Base address of the mapping when the range was committed.
    pub base: u64,
}

impl MetadataRecord for AddressRangeRecord {
    const KIND: MetadataKind = MetadataKind::AddressRange;
    const ENCODED_LEN: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.offset);
        LittleEndian::write_u64(&mut buf[8..16], self.len);
        LittleEndian::write_u64(&mut buf[16..24], self.base);
    }

    fn decode(buf: &[u8]) -> TraceResult<Self> {
        Ok(Self {
            offset: LittleEndian::read_u64(&buf[0..8]),
            len: LittleEndian::read_u64(&buf[8..16]),
            base: LittleEndian::read_u64(&buf[16..24]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationTimestampRecord {
    pub micros: u64,
}

impl MetadataRecord for AllocationTimestampRecord {
    const KIND: MetadataKind = MetadataKind::AllocationTimestamp;
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.micros);
    }

    fn decode(buf: &[u8]) -> TraceResult<Self> {
        Ok(Self {
            micros: LittleEndian::read_u64(&buf[0..8]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationTimestampDeltaRecord {
    /// Saturating delta from the previous timestamped allocation.
    pub delta_micros: u32,
}

impl MetadataRecord for AllocationTimestampDeltaRecord {
    const KIND: MetadataKind = MetadataKind::AllocationTimestampDelta;
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.delta_micros);
        buf[4..8].fill(0);
    }

    fn decode(buf: &[u8]) -> TraceResult<Self> {
        Ok(Self {
            delta_micros: LittleEndian::read_u32(&buf[0..4]),
        })
    }
}

/// Runtime synchronization parameters the store was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynchronizationRecord {
    pub spin_count: u32,
    pub concurrent_allocations: bool,
}

impl MetadataRecord for SynchronizationRecord {
    const KIND: MetadataKind = MetadataKind::Synchronization;
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.spin_count);
        LittleEndian::write_u32(&mut buf[4..8], self.concurrent_allocations as u32);
    }

    fn decode(buf: &[u8]) -> TraceResult<Self> {
        Ok(Self {
            spin_count: LittleEndian::read_u32(&buf[0..4]),
            concurrent_allocations: LittleEndian::read_u32(&buf[4..8]) != 0,
        })
    }
}

/// Store totals, appended when a writing session seals the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoRecord {
    pub total_allocations: u64,
    pub total_bytes: u64,
    /// Cursor position at seal time: the end of recorded data.
    pub end_of_data: u64,
}

impl MetadataRecord for InfoRecord {
    const KIND: MetadataKind = MetadataKind::Info;
    const ENCODED_LEN: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.total_allocations);
        LittleEndian::write_u64(&mut buf[8..16], self.total_bytes);
        LittleEndian::write_u64(&mut buf[16..24], self.end_of_data);
    }

    fn decode(buf: &[u8]) -> TraceResult<Self> {
        Ok(Self {
            total_allocations: LittleEndian::read_u64(&buf[0..8]),
            total_bytes: LittleEndian::read_u64(&buf[8..16]),
            end_of_data: LittleEndian::read_u64(&buf[16..24]),
        })
    }
}

/// One metadata side-store: a mapped region of fixed-size records.
///
/// Appends are safe from multiple threads; the cursor advance is an
/// interlocked compare-and-swap bounded by the region's reservation.
/// Channels are committed in full at creation: they are small, and a
/// fixed window keeps the allocation hot path free of channel growth.
pub struct MetadataChannel {
    kind: MetadataKind,
    region: MappedRegion,
    cursor: AtomicU64,
}

pub(crate) fn channel_path(root: &Path, store_name: &str, kind: MetadataKind) -> PathBuf {
    root.join(format!("{store_name}.{}", kind.file_suffix()))
}

impl MetadataChannel {
    /// Creates the channel's backing file for a writing session.
    pub(crate) fn create(root: &Path, store_name: &str, kind: MetadataKind) -> TraceResult<Self> {
        let path = channel_path(root, store_name, kind);
        let reserved = kind.reserved_bytes();
        let region = MappedRegion::create(&path, reserved, reserved)?;
        let channel = Self {
            kind,
            region,
            cursor: AtomicU64::new(CHANNEL_HEADER_SIZE),
        };
        channel.write_header(0)?;
        Ok(channel)
    }

    /// Maps an existing channel file for a readonly session.
    pub(crate) fn open_readonly(
        root: &Path,
        store_name: &str,
        kind: MetadataKind,
    ) -> TraceResult<Self> {
        let path = channel_path(root, store_name, kind);
        let region = MappedRegion::open_cow(&path)?;
        region.set_committed(region.reserved());
        let header = region.read_slice(0..CHANNEL_HEADER_SIZE as usize)?;
        let magic = LittleEndian::read_u32(&header[0..4]);
        let version = LittleEndian::read_u16(&header[4..6]);
        if magic != CHANNEL_MAGIC || version != CHANNEL_VERSION {
            return Err(TraceStoreError::corruption(format!(
                "bad channel header in {}",
                path.display()
            )));
        }
        let used = LittleEndian::read_u64(&header[8..16]);
        if CHANNEL_HEADER_SIZE + used > region.reserved() {
            return Err(TraceStoreError::corruption(format!(
                "channel {} used bytes {} exceed file size",
                path.display(),
                used
            )));
        }
        Ok(Self {
            kind,
            region,
            cursor: AtomicU64::new(CHANNEL_HEADER_SIZE + used),
        })
    }

    #[inline]
    pub fn kind(&self) -> MetadataKind {
        self.kind
    }

    /// Number of records currently recorded.
    pub fn record_count(&self) -> u64 {
        (self.cursor.load(Ordering::Acquire) - CHANNEL_HEADER_SIZE) / self.kind.record_size()
    }

    fn write_header(&self, used: u64) -> TraceResult<()> {
        let mut header = [0u8; CHANNEL_HEADER_SIZE as usize];
        LittleEndian::write_u32(&mut header[0..4], CHANNEL_MAGIC);
        LittleEndian::write_u16(&mut header[4..6], CHANNEL_VERSION);
        LittleEndian::write_u64(&mut header[8..16], used);
        self.region.write_bytes(0, &header)
    }

    /// Appends one record.  Fails with `OutOfSpace` when the channel's
    /// fixed reservation is exhausted.
    pub fn append<R: MetadataRecord>(&self, record: &R) -> TraceResult<()> {
        debug_assert_eq!(R::KIND, self.kind, "record appended to wrong channel");
        let len = R::ENCODED_LEN as u64;
        let limit = self.region.reserved();
        let offset = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(len)?;
                if next > limit { None } else { Some(next) }
            })
            .map_err(|_| TraceStoreError::OutOfSpace {
                requested: len,
                reserved: limit,
            })?;
        let mut buf = [0u8; 32];
        debug_assert!(R::ENCODED_LEN <= buf.len());
        record.encode(&mut buf[..R::ENCODED_LEN]);
        self.region.write_bytes(offset as usize, &buf[..R::ENCODED_LEN])
    }

    /// Reads every recorded entry of the channel's kind.
    pub fn read_records<R: MetadataRecord>(&self) -> TraceResult<Vec<R>> {
        debug_assert_eq!(R::KIND, self.kind, "record read from wrong channel");
        let end = self.cursor.load(Ordering::Acquire) as usize;
        let mut records = Vec::new();
        let mut offset = CHANNEL_HEADER_SIZE as usize;
        while offset + R::ENCODED_LEN <= end {
            let buf = self.region.read_slice(offset..offset + R::ENCODED_LEN)?;
            records.push(R::decode(buf)?);
            offset += R::ENCODED_LEN;
        }
        Ok(records)
    }

    /// Persists the header's used-bytes count and flushes the mapping.
    /// Called once per channel when the owning session closes.
    pub(crate) fn seal(&self) -> TraceResult<()> {
        let used = self.cursor.load(Ordering::Acquire) - CHANNEL_HEADER_SIZE;
        self.write_header(used)?;
        self.region.flush()
    }
}
