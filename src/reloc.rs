//! Pointer fixup for readonly sessions.
//!
//! A reopened region almost never lands at the base address it was
//! recorded at, so every field the writing session marked with a
//! relocation record is displaced by the delta between the two bases.
//! Fields pointing into another store use that store's delta, which is
//! why relocation waits on the declared dependencies first.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::context::ContextInner;
use crate::error::{TraceResult, TraceStoreError};
use crate::meta::{MetadataKind, RelocationRecord};

pub(crate) fn relocate_store(ctx: &Arc<ContextInner>, index: usize) -> TraceResult<()> {
    let store = &ctx.stores[index];

    for dep_id in store.relocation_dependencies() {
        // Dependency ids were resolved during validation.
        let dep = ctx
            .store_by_id(*dep_id)
            .ok_or_else(|| TraceStoreError::invalid_state(format!("unknown store {dep_id}")))?;
        if !dep.relocation_complete_signal().wait() {
            return Err(TraceStoreError::invalid_state(format!(
                "dependency store {dep_id} failed"
            )));
        }
    }

    let delta = store.base_addr().wrapping_sub(store.recorded_base()) as i64;
    // Publish before signaling completion: dependents read the delta the
    // moment they wake.
    store.set_relocation_delta(delta);

    let records = store
        .channel(MetadataKind::Relocation)?
        .read_records::<RelocationRecord>()?;
    let mut patched = 0usize;
    for record in &records {
        let target_delta = if record.target_store == store.id() {
            delta
        } else if store.relocation_dependencies().contains(&record.target_store) {
            // The dependency wait above guarantees the target's delta is
            // published before we read it.
            let target = ctx.store_by_id(record.target_store).ok_or_else(|| {
                TraceStoreError::corruption(format!(
                    "relocation target store {} is not part of this session",
                    record.target_store
                ))
            })?;
            target.relocation_delta()
        } else {
            // An undeclared target was never waited on; its delta may not
            // be published yet and the field would keep a stale pointer.
            return Err(TraceStoreError::corruption(format!(
                "relocation record at {} targets store {} outside the declared dependencies",
                record.field_offset, record.target_store
            )));
        };
        if target_delta == 0 {
            continue;
        }
        patch_field(store, record.field_offset, target_delta)?;
        patched += 1;
    }

    store.relocation_complete_signal().complete_ok();
    debug!(
        store = %store.id(),
        delta,
        patched,
        total = records.len(),
        "store relocated"
    );
    Ok(())
}

/// Adds `delta` to the pointer-sized field at `offset` in the store's
/// copy-on-write mapping.
fn patch_field(store: &crate::store::TraceStore, offset: u64, delta: i64) -> TraceResult<()> {
    let slice = store.field_slice_mut(offset)?;
    let old = LittleEndian::read_u64(slice);
    LittleEndian::write_u64(slice, old.wrapping_add(delta as u64));
    Ok(())
}
