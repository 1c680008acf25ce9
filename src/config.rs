use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;

/// Minimum allowed page size (4 KiB).
const PAGE_SIZE_MIN_LIMIT: u64 = 4 * 1024;

/// Maximum allowed page size (1 MiB).
const PAGE_SIZE_MAX_LIMIT: u64 = 1024 * 1024;

/// Default page size used for page-aligned allocation strategies.
const DEFAULT_PAGE_SIZE: u64 = PAGE_SIZE_MIN_LIMIT;

/// Default number of bytes committed per region extension.
const DEFAULT_EXTENSION_GRANULARITY: u64 = 64 * 1024;

/// Default reserved address space per store (64 MiB).
const DEFAULT_STORE_RESERVED_BYTES: u64 = 64 * 1024 * 1024;

/// Default interval for the optional periodic samplers.
const DEFAULT_SAMPLER_INTERVAL_MS: u64 = 100;

/// Store identifiers above this bound cannot be represented in the
/// ignore-preferred-addresses bitmap (one quadword of bits).
pub const MAX_STORE_IDS: u16 = 64;

#[inline]
fn floor_power_of_two(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        let shift = 63_u32 - value.leading_zeros();
        1_u64 << shift
    }
}

/// Clamps a value to the given range and rounds down to a power of two.
#[inline]
fn clamp_power_of_two(value: u64, min: u64, max: u64) -> u64 {
    let clamped = value.clamp(min, max);
    if clamped.is_power_of_two() {
        clamped
    } else {
        floor_power_of_two(clamped).max(min)
    }
}

#[inline]
pub(crate) fn round_up(value: u64, multiple: u64) -> u64 {
    debug_assert!(multiple > 0);
    value.div_ceil(multiple).saturating_mul(multiple)
}

/// Stable identifier for a primary store.
///
/// Zero is reserved as the null id; valid ids fit within the
/// ignore-preferred-addresses bitmap (`1..MAX_STORE_IDS`).
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StoreId(pub u16);

impl StoreId {
    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 > 0 && self.0 < MAX_STORE_IDS
    }
}

impl From<u16> for StoreId {
    #[inline]
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Opaque handle identifying the writing session a read-write context
/// records under.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Declared behaviour of a store, fixed at construction.
///
/// Traits select the allocation strategy installed when the store's bind
/// completes: concurrency decides whether the cursor advance is interlocked,
/// page alignment decides its granularity.  The two axes are orthogonal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreTraits {
    /// Multiple threads may allocate from this store simultaneously.
    pub concurrent_allocations: bool,
    /// Every allocation is rounded up to a page-size multiple.
    pub page_aligned: bool,
    /// The store is consumed incrementally and never relocated when
    /// mapped readonly.
    pub streaming: bool,
}

/// Static description of one store supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub id: StoreId,
    /// Base name for the store's backing files.
    pub name: String,
    pub traits: StoreTraits,
    /// Reserved address space for the store's region.  Rounded up to the
    /// extension granularity during validation.
    pub reserved_bytes: u64,
    /// Stores whose relocation must complete before this store may begin
    /// relocating (readonly mode only).
    #[serde(default)]
    pub relocation_dependencies: Vec<StoreId>,
}

impl StoreDescriptor {
    pub fn new(id: StoreId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            traits: StoreTraits::default(),
            reserved_bytes: DEFAULT_STORE_RESERVED_BYTES,
            relocation_dependencies: Vec::new(),
        }
    }

    pub fn with_traits(mut self, traits: StoreTraits) -> Self {
        self.traits = traits;
        self
    }

    pub fn with_reserved_bytes(mut self, bytes: u64) -> Self {
        self.reserved_bytes = bytes;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<StoreId>) -> Self {
        self.relocation_dependencies = deps;
        self
    }
}

/// The collection of stores a context binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSet {
    /// Whether the collection was opened for reading an existing session.
    pub readonly: bool,
    pub descriptors: Vec<StoreDescriptor>,
}

impl StoreSet {
    pub fn read_write(descriptors: Vec<StoreDescriptor>) -> Self {
        Self {
            readonly: false,
            descriptors,
        }
    }

    pub fn readonly(descriptors: Vec<StoreDescriptor>) -> Self {
        Self {
            readonly: true,
            descriptors,
        }
    }
}

/// Context operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    /// Create stores and accept allocations.
    ReadWrite,
    /// Map an existing session for reading; pointers are relocated after
    /// mapping.
    Readonly,
}

impl Default for TraceMode {
    fn default() -> Self {
        Self::ReadWrite
    }
}

/// Optional behaviour flags for a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextFlags {
    /// Bitmap over store ids whose recorded preferred base address should
    /// not be enforced when mapping readonly.  Bit N marks store id N.
    /// Only valid in readonly mode; a non-empty bitmap must resolve every
    /// set bit to a known store.
    pub ignore_preferred_addresses: u64,
    /// Block `initialize` until loading completes instead of returning
    /// while binds are still in flight.
    pub synchronous_initialization: bool,
    /// Start the working-set sampler once its designated store is bound.
    pub enable_working_set_sampler: bool,
    /// Start the performance sampler once its designated store is bound.
    pub enable_performance_sampler: bool,
    /// Store the working-set sampler appends its records to.
    pub working_set_store: Option<StoreId>,
    /// Store the performance sampler appends its records to.
    pub performance_store: Option<StoreId>,
}

/// Primary configuration surface for a trace context.
///
/// Constructed explicitly by the caller and validated up front; defaults
/// are resolved here, never deep inside engine logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Directory holding every store's backing files.
    pub root_dir: PathBuf,
    pub mode: TraceMode,
    /// Number of bind worker threads.  Zero is a configuration error, not
    /// a value `normalized` repairs: the pool must be explicitly present.
    pub worker_threads: usize,
    /// Page size used by page-aligned allocation strategies.
    pub page_size: u64,
    /// Bytes committed per region extension.
    pub extension_granularity: u64,
    /// Spin count recorded in each store's synchronization metadata.
    /// Opaque to the engine.
    pub spin_count: u32,
    /// Interval for the optional periodic samplers.
    pub sampler_interval_ms: u64,
    pub flags: ContextFlags,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data/trace"),
            mode: TraceMode::default(),
            worker_threads: 4,
            page_size: DEFAULT_PAGE_SIZE,
            extension_granularity: DEFAULT_EXTENSION_GRANULARITY,
            spin_count: 4000,
            sampler_interval_ms: DEFAULT_SAMPLER_INTERVAL_MS,
            flags: ContextFlags::default(),
        }
    }
}

impl TraceConfig {
    /// Returns a copy of the configuration with sizing parameters clamped
    /// into their valid windows.
    ///
    /// Page size is rounded to a power of two; the extension granularity
    /// is rounded up to a page multiple.  `worker_threads` is left alone:
    /// its presence is a validation concern, not a sizing one.
    pub fn normalized(mut self) -> Self {
        let page_raw = if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        };
        self.page_size = clamp_power_of_two(page_raw, PAGE_SIZE_MIN_LIMIT, PAGE_SIZE_MAX_LIMIT);

        let granularity_raw = if self.extension_granularity == 0 {
            DEFAULT_EXTENSION_GRANULARITY
        } else {
            self.extension_granularity
        };
        self.extension_granularity = round_up(granularity_raw, self.page_size);

        if self.sampler_interval_ms == 0 {
            self.sampler_interval_ms = DEFAULT_SAMPLER_INTERVAL_MS;
        }

        self
    }
}
