//! The four-phase bind pipeline.
//!
//! Phase work fans out across a small pool of named worker threads:
//! metadata-info first, then the eight remaining channels per store, then
//! the store's region, then (readonly only) relocation.  A store failing
//! any phase is published failed once and its later phases are abandoned;
//! the other stores keep going.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use tracing::{debug, error};

use crate::config::StoreId;
use crate::context::ContextInner;
use crate::error::{BindPhase, TraceResult, TraceStoreError};
use crate::meta::MetadataKind;
use crate::store::TraceStore;

/// One store's failure in the bind pipeline.
#[derive(Debug, Clone)]
pub struct BindFailure {
    pub store: StoreId,
    pub phase: BindPhase,
    pub reason: String,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of named worker threads fed over an unbounded channel.
/// Dropping the pool closes the channel and joins every worker.
pub(crate) struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(name: &str, threads: usize) -> TraceResult<Self> {
        debug_assert!(threads > 0);
        let (tx, rx) = channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(TraceStoreError::Io)?;
            handles.push(handle);
        }
        Ok(Self {
            tx: Some(tx),
            handles,
        })
    }

    pub(crate) fn submit(&self, job: Job) {
        if let Some(tx) = &self.tx {
            // Send only fails once every worker is gone, during teardown.
            let _ = tx.send(job);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("bind worker panicked");
            }
        }
    }
}

/// Kicks off the pipeline: one metadata-info job per store.  Everything
/// downstream is submitted by the jobs themselves.
pub(crate) fn submit_metadata_info(ctx: &Arc<ContextInner>) {
    for index in 0..ctx.stores.len() {
        let job_ctx = ctx.clone();
        ctx.submit_job(Box::new(move || run_metadata_info(&job_ctx, index)));
    }
}

fn phase_gate(ctx: &ContextInner, store: &TraceStore, phase: BindPhase) -> TraceResult<()> {
    if ctx.cancelled.load(Ordering::Acquire) {
        return Err(TraceStoreError::Cancelled(phase));
    }
    crate::test_support::bind_phase_override(store.id(), phase)
}

fn run_metadata_info(ctx: &Arc<ContextInner>, index: usize) {
    let store = &ctx.stores[index];
    let result = phase_gate(ctx, store, BindPhase::MetadataInfo)
        .and_then(|_| store.bind_metadata_info());
    match result {
        Ok(()) => {
            ctx.works.metadata_info.complete_item(false);
            for kind in MetadataKind::REMAINING {
                let job_ctx = ctx.clone();
                ctx.submit_job(Box::new(move || run_channel(&job_ctx, index, kind)));
            }
        }
        Err(err) => {
            fail_store(ctx, index, BindPhase::MetadataInfo, &err);
            ctx.works.metadata_info.complete_item(true);
            // The channel jobs are never submitted; settle their items and
            // everything downstream.
            for _ in MetadataKind::REMAINING {
                ctx.works.remaining_metadata.complete_item(true);
            }
            abandon_store_bind(ctx);
        }
    }
}

fn run_channel(ctx: &Arc<ContextInner>, index: usize, kind: MetadataKind) {
    let store = &ctx.stores[index];
    let result = phase_gate(ctx, store, BindPhase::RemainingMetadata)
        .and_then(|_| store.bind_channel(kind));
    let item_failed = if let Err(err) = result {
        fail_store(ctx, index, BindPhase::RemainingMetadata, &err);
        true
    } else {
        false
    };
    ctx.works.remaining_metadata.complete_item(item_failed);

    // The last channel to finish decides the store's fate for the next
    // phase, whether or not this particular channel succeeded.
    if ctx.remaining_channels[index].fetch_sub(1, Ordering::AcqRel) == 1 {
        if store.bind_state() == crate::store::BindState::Failed {
            abandon_store_bind(ctx);
        } else {
            store.finish_metadata_bind();
            let job_ctx = ctx.clone();
            ctx.submit_job(Box::new(move || run_store_bind(&job_ctx, index)));
        }
    }
}

fn run_store_bind(ctx: &Arc<ContextInner>, index: usize) {
    let store = &ctx.stores[index];
    let result =
        phase_gate(ctx, store, BindPhase::StoreBind).and_then(|_| store.bind_region());
    match result {
        Ok(()) => {
            ctx.works.store_bind.complete_item(false);
            if store.needs_relocation() {
                store.mark_relocation_pending();
                spawn_relocation(ctx, index);
            } else {
                store.publish_ready();
                finish_store(ctx);
                ctx.works.readonly_complete.complete_item(false);
            }
        }
        Err(err) => {
            fail_store(ctx, index, BindPhase::StoreBind, &err);
            ctx.works.store_bind.complete_item(true);
            ctx.works.readonly_complete.complete_item(true);
        }
    }
}

/// Relocation waits on other stores' completion signals, so it runs on a
/// dedicated thread per store rather than occupying a pool worker.
fn spawn_relocation(ctx: &Arc<ContextInner>, index: usize) {
    let store_id = ctx.stores[index].id();
    let spawn = {
        let ctx = ctx.clone();
        thread::Builder::new()
            .name(format!("trace-reloc-{store_id}"))
            .spawn(move || run_relocation(&ctx, index))
    };
    match spawn {
        Ok(handle) => ctx.reloc_threads.lock().push(handle),
        Err(err) => {
            let err = TraceStoreError::Io(err);
            fail_store(ctx, index, BindPhase::Relocation, &err);
            ctx.works.readonly_complete.complete_item(true);
        }
    }
}

fn run_relocation(ctx: &Arc<ContextInner>, index: usize) {
    let store = &ctx.stores[index];
    let result = phase_gate(ctx, store, BindPhase::Relocation)
        .and_then(|_| crate::reloc::relocate_store(ctx, index));
    match result {
        Ok(()) => {
            store.publish_ready();
            finish_store(ctx);
            ctx.works.readonly_complete.complete_item(false);
        }
        Err(err) => {
            fail_store(ctx, index, BindPhase::Relocation, &err);
            ctx.works.readonly_complete.complete_item(true);
        }
    }
}

/// Publishes the store failed and records the failure.  Only the first
/// failure per store counts; later phase errors for the same store are
/// side effects of the first.
fn fail_store(ctx: &Arc<ContextInner>, index: usize, phase: BindPhase, err: &TraceStoreError) {
    let store = &ctx.stores[index];
    let reason = err.to_string();
    if store.publish_failed(&reason) {
        debug!(store = %store.id(), %phase, reason = %reason, "store removed from bind pipeline");
        ctx.failures.lock().push(BindFailure {
            store: store.id(),
            phase,
            reason,
        });
        ctx.failed_count.fetch_add(1, Ordering::AcqRel);
        finish_store(ctx);
    }
}

/// Settles the store-bind and readonly-complete items of a store whose
/// pipeline stopped before those phases were submitted.
fn abandon_store_bind(ctx: &Arc<ContextInner>) {
    ctx.works.store_bind.complete_item(true);
    ctx.works.readonly_complete.complete_item(true);
}

/// One store has reached a terminal state, ready or failed.  The last one
/// signals loading-complete.
fn finish_store(ctx: &Arc<ContextInner>) {
    if ctx.binds_in_progress.fetch_sub(1, Ordering::AcqRel) == 1 {
        ctx.loading_complete.signal();
        debug!(
            failed = ctx.failed_count.load(Ordering::Acquire),
            "loading complete"
        );
    }
}
