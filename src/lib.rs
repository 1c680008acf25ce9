//! Memory-mapped, append-only storage for trace records.
//!
//! A [`TraceContext`] owns a set of stores for one recording or reading
//! session.  Each store is a reserve-then-commit mapped region shadowed
//! by nine metadata channels that record its allocations, addresses, and
//! relocation information.  Binding runs asynchronously on a worker
//! pool; allocation against a store whose bind is still in flight
//! suspends the caller until the bind resolves.
//!
//! ```no_run
//! use trace_store::{
//!     SessionId, StoreDescriptor, StoreId, StoreSet, TraceConfig, TraceContext,
//! };
//!
//! # fn main() -> trace_store::TraceResult<()> {
//! let config = TraceConfig {
//!     root_dir: "/tmp/trace-session".into(),
//!     ..TraceConfig::default()
//! };
//! let stores = StoreSet::read_write(vec![StoreDescriptor::new(StoreId::new(1), "events")]);
//! let context = TraceContext::initialize(config, Some(SessionId::new(42)), stores)?;
//!
//! if let Some(handle) = context.allocate_records(StoreId::new(1), 64, 1) {
//!     let store = context.store(StoreId::new(1)).unwrap();
//!     store.record_slice_mut(&handle)?[..5].copy_from_slice(b"hello");
//! }
//! context.close()?;
//! # Ok(())
//! # }
//! ```

pub mod alloc;
pub mod config;
pub mod error;
pub mod meta;
pub mod region;
pub mod store;
pub mod sync;
pub mod test_support;

mod bind;
mod context;
mod reloc;
mod sampler;

pub use bind::BindFailure;
pub use config::{
    ContextFlags, MAX_STORE_IDS, SessionId, StoreDescriptor, StoreId, StoreSet, StoreTraits,
    TraceConfig, TraceMode,
};
pub use context::{PhaseProgress, PipelineProgress, TraceContext};
pub use error::{BindPhase, TraceResult, TraceStoreError};
pub use region::RegionOffset;
pub use store::{BindCompleteHook, BindState, RecordHandle, TraceStore};

pub use alloc::AllocatorStrategy;
