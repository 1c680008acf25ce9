//! End-to-end coverage of the bind pipeline: read-write sessions,
//! failure isolation, readonly reopen, and relocation ordering.

use std::sync::Mutex;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tempfile::TempDir;

use trace_store::{
    BindPhase, BindState, RegionOffset, SessionId, StoreDescriptor, StoreId, StoreSet,
    StoreTraits, TraceConfig, TraceContext, TraceMode, TraceStoreError,
    test_support::set_bind_phase_hook,
};

/// Serializes tests that install the process-wide bind phase hook.
static HOOK_LOCK: Mutex<()> = Mutex::new(());

const LOAD_TIMEOUT: Duration = Duration::from_secs(10);

fn config(tmp: &TempDir, mode: TraceMode) -> TraceConfig {
    TraceConfig {
        root_dir: tmp.path().to_path_buf(),
        mode,
        worker_threads: 4,
        ..TraceConfig::default()
    }
}

fn descriptors() -> Vec<StoreDescriptor> {
    vec![
        StoreDescriptor::new(StoreId::new(1), "events").with_reserved_bytes(4 * 1024 * 1024),
        StoreDescriptor::new(StoreId::new(2), "strings")
            .with_traits(StoreTraits {
                concurrent_allocations: true,
                page_aligned: false,
                streaming: false,
            })
            .with_reserved_bytes(4 * 1024 * 1024),
        StoreDescriptor::new(StoreId::new(3), "blobs")
            .with_traits(StoreTraits {
                concurrent_allocations: true,
                page_aligned: true,
                streaming: true,
            })
            .with_reserved_bytes(4 * 1024 * 1024),
    ]
}

#[test]
fn read_write_session_binds_every_store() {
    let tmp = TempDir::new().expect("tempdir");
    let context = TraceContext::initialize(
        config(&tmp, TraceMode::ReadWrite),
        Some(SessionId::new(7)),
        StoreSet::read_write(descriptors()),
    )
    .expect("initialize");

    context
        .wait_for_loading_timeout(LOAD_TIMEOUT)
        .expect("loading");
    assert_eq!(context.failed_count(), 0);
    assert!(context.failures().is_empty());

    for store in context.stores() {
        assert_eq!(store.bind_state(), BindState::Ready);
    }

    let progress = context.progress();
    assert_eq!(progress.metadata_info.total, 3);
    assert_eq!(progress.metadata_info.active, 0);
    assert_eq!(progress.remaining_metadata.total, 24);
    assert_eq!(progress.remaining_metadata.active, 0);
    assert_eq!(progress.store_bind.active, 0);
    assert_eq!(progress.readonly_complete.active, 0);
    assert_eq!(progress.stores_pending, 0);

    context.close().expect("close");
}

#[test]
fn allocation_resumes_after_bind() {
    let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let hook_guard = set_bind_phase_hook(Box::new(|store, phase| {
        if store == StoreId::new(41) && phase == BindPhase::StoreBind {
            std::thread::sleep(Duration::from_millis(150));
        }
        None
    }));

    let tmp = TempDir::new().expect("tempdir");
    let context = TraceContext::initialize(
        config(&tmp, TraceMode::ReadWrite),
        Some(SessionId::new(7)),
        StoreSet::read_write(vec![
            StoreDescriptor::new(StoreId::new(41), "slow").with_reserved_bytes(1024 * 1024),
        ]),
    )
    .expect("initialize");

    // The allocator suspends until the delayed bind publishes.
    let handle = context
        .allocate_records(StoreId::new(41), 64, 1)
        .expect("allocation resumed");
    context
        .wait_for_loading_timeout(LOAD_TIMEOUT)
        .expect("loading");

    let store = context.store(StoreId::new(41)).expect("store");
    assert!(handle.offset.get() + handle.len <= store.committed_bytes());
    drop(hook_guard);
    context.close().expect("close");
}

#[test]
fn concurrent_allocations_never_overlap() {
    let tmp = TempDir::new().expect("tempdir");
    let context = TraceContext::initialize(
        config(&tmp, TraceMode::ReadWrite),
        Some(SessionId::new(7)),
        StoreSet::read_write(descriptors()),
    )
    .expect("initialize");

    let store = context.store(StoreId::new(2)).expect("store");
    let mut workers = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        workers.push(std::thread::spawn(move || {
            let mut spans = Vec::new();
            for _ in 0..50 {
                let handle = store.allocate_records(64, 1).expect("allocate");
                spans.push((handle.offset.get(), handle.len));
            }
            spans
        }));
    }
    let mut spans: Vec<(u64, u64)> = workers
        .into_iter()
        .flat_map(|w| w.join().expect("join"))
        .collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "allocations overlap");
    }
    assert_eq!(store.total_allocations(), 400);
    context.close().expect("close");
}

#[test]
fn failed_store_is_isolated() {
    let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _hook = set_bind_phase_hook(Box::new(|store, phase| {
        if store == StoreId::new(42) && phase == BindPhase::StoreBind {
            return Some(TraceStoreError::invalid_state("injected bind failure"));
        }
        None
    }));

    let tmp = TempDir::new().expect("tempdir");
    let context = TraceContext::initialize(
        config(&tmp, TraceMode::ReadWrite),
        Some(SessionId::new(7)),
        StoreSet::read_write(vec![
            StoreDescriptor::new(StoreId::new(1), "good").with_reserved_bytes(1024 * 1024),
            StoreDescriptor::new(StoreId::new(42), "doomed").with_reserved_bytes(1024 * 1024),
        ]),
    )
    .expect("initialize");

    context
        .wait_for_loading_timeout(LOAD_TIMEOUT)
        .expect("loading");
    assert_eq!(context.failed_count(), 1);
    let failures = context.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].store, StoreId::new(42));
    assert_eq!(failures[0].phase, BindPhase::StoreBind);

    let good = context.store(StoreId::new(1)).expect("store");
    let doomed = context.store(StoreId::new(42)).expect("store");
    assert_eq!(good.bind_state(), BindState::Ready);
    assert_eq!(doomed.bind_state(), BindState::Failed);
    assert!(good.allocate_records(16, 1).is_some());
    assert!(doomed.allocate_records(16, 1).is_none());
    context.close().expect("close");
}

#[test]
fn synchronous_initialization_reports_failures() {
    let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _hook = set_bind_phase_hook(Box::new(|store, phase| {
        if store == StoreId::new(43) && phase == BindPhase::MetadataInfo {
            return Some(TraceStoreError::invalid_state("injected metadata failure"));
        }
        None
    }));

    let tmp = TempDir::new().expect("tempdir");
    let mut cfg = config(&tmp, TraceMode::ReadWrite);
    cfg.flags.synchronous_initialization = true;
    let result = TraceContext::initialize(
        cfg,
        Some(SessionId::new(7)),
        StoreSet::read_write(vec![
            StoreDescriptor::new(StoreId::new(43), "doomed").with_reserved_bytes(1024 * 1024),
        ]),
    );
    match result {
        Err(TraceStoreError::BindFailed { failed }) => assert_eq!(failed, 1),
        other => panic!("expected BindFailed, got {other:?}"),
    }
}

#[test]
fn configuration_is_validated_before_any_work() {
    let tmp = TempDir::new().expect("tempdir");

    // No worker threads.
    let mut cfg = config(&tmp, TraceMode::ReadWrite);
    cfg.worker_threads = 0;
    let err = TraceContext::initialize(
        cfg,
        Some(SessionId::new(7)),
        StoreSet::read_write(descriptors()),
    )
    .unwrap_err();
    assert!(matches!(err, TraceStoreError::Configuration(_)));

    // Missing session id in read-write mode.
    let err = TraceContext::initialize(
        config(&tmp, TraceMode::ReadWrite),
        None,
        StoreSet::read_write(descriptors()),
    )
    .unwrap_err();
    assert!(matches!(err, TraceStoreError::Configuration(_)));

    // Duplicate store ids.
    let err = TraceContext::initialize(
        config(&tmp, TraceMode::ReadWrite),
        Some(SessionId::new(7)),
        StoreSet::read_write(vec![
            StoreDescriptor::new(StoreId::new(1), "a"),
            StoreDescriptor::new(StoreId::new(1), "b"),
        ]),
    )
    .unwrap_err();
    assert!(matches!(err, TraceStoreError::Configuration(_)));

    // Self-dependency.
    let err = TraceContext::initialize(
        config(&tmp, TraceMode::ReadWrite),
        Some(SessionId::new(7)),
        StoreSet::read_write(vec![
            StoreDescriptor::new(StoreId::new(1), "a").with_dependencies(vec![StoreId::new(1)]),
        ]),
    )
    .unwrap_err();
    assert!(matches!(err, TraceStoreError::Configuration(_)));

    // Bitmap in read-write mode.
    let mut cfg = config(&tmp, TraceMode::ReadWrite);
    cfg.flags.ignore_preferred_addresses = 0b10;
    let err = TraceContext::initialize(
        cfg,
        Some(SessionId::new(7)),
        StoreSet::read_write(descriptors()),
    )
    .unwrap_err();
    assert!(matches!(err, TraceStoreError::Configuration(_)));

    // Bitmap bit matching no store in readonly mode.
    let mut cfg = config(&tmp, TraceMode::Readonly);
    cfg.flags.ignore_preferred_addresses = 1u64 << 9;
    let err = TraceContext::initialize(cfg, None, StoreSet::readonly(descriptors())).unwrap_err();
    assert!(matches!(err, TraceStoreError::Configuration(_)));

    // Nothing was created by any of the rejected configurations.
    assert_eq!(std::fs::read_dir(tmp.path()).expect("dir").count(), 0);
}

fn record_session(tmp: &TempDir, node_id: StoreId, payload_id: StoreId) -> (u64, u64) {
    let stores = vec![
        StoreDescriptor::new(node_id, "nodes").with_reserved_bytes(1024 * 1024),
        StoreDescriptor::new(payload_id, "payloads").with_reserved_bytes(1024 * 1024),
    ];
    let context = TraceContext::initialize(
        config(tmp, TraceMode::ReadWrite),
        Some(SessionId::new(9)),
        StoreSet::read_write(stores),
    )
    .expect("initialize");

    let payloads = context.store(payload_id).expect("payloads");
    let payload = payloads.allocate_records(16, 1).expect("allocate payload");
    payloads.record_slice_mut(&payload).expect("slice")[..7].copy_from_slice(b"payload");

    // A node holding an absolute pointer into the payload store.
    let nodes = context.store(node_id).expect("nodes");
    let node = nodes.allocate_records(8, 1).expect("allocate node");
    let target_addr = payloads.base_addr() + payload.offset.get();
    LittleEndian::write_u64(nodes.record_slice_mut(&node).expect("slice"), target_addr);
    nodes
        .record_relocation(node.offset.get(), payload_id)
        .expect("record relocation");

    context.close().expect("close");
    (node.offset.get(), payload.offset.get())
}

#[test]
fn readonly_reopen_relocates_pointers() {
    let tmp = TempDir::new().expect("tempdir");
    let (node_offset, payload_offset) =
        record_session(&tmp, StoreId::new(1), StoreId::new(2));

    let stores = vec![
        StoreDescriptor::new(StoreId::new(1), "nodes")
            .with_dependencies(vec![StoreId::new(2)]),
        StoreDescriptor::new(StoreId::new(2), "payloads"),
    ];
    let context = TraceContext::initialize(
        config(&tmp, TraceMode::Readonly),
        None,
        StoreSet::readonly(stores),
    )
    .expect("initialize");
    context
        .wait_for_loading_timeout(LOAD_TIMEOUT)
        .expect("loading");
    assert_eq!(context.failed_count(), 0);

    let nodes = context.store(StoreId::new(1)).expect("nodes");
    let payloads = context.store(StoreId::new(2)).expect("payloads");
    assert_eq!(nodes.bind_state(), BindState::Ready);
    assert_eq!(payloads.bind_state(), BindState::Ready);

    // The recorded pointer now resolves against this session's mapping.
    let raw = nodes
        .read_at(RegionOffset(node_offset), 8)
        .expect("read node");
    let pointer = LittleEndian::read_u64(raw);
    assert_eq!(pointer, payloads.base_addr() + payload_offset);

    let bytes = payloads
        .read_at(RegionOffset(payload_offset), 7)
        .expect("read payload");
    assert_eq!(bytes, b"payload");

    // Readonly stores refuse new allocations.
    assert!(nodes.allocate_records(8, 1).is_none());
    context.close().expect("close");
}

#[test]
fn relocation_waits_for_delayed_dependency() {
    let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().expect("tempdir");
    let (node_offset, payload_offset) =
        record_session(&tmp, StoreId::new(46), StoreId::new(47));

    // Hold the dependency's region bind back so the dependent's
    // relocation thread has to park on its completion signal.
    let _hook = set_bind_phase_hook(Box::new(|store, phase| {
        if store == StoreId::new(47) && phase == BindPhase::StoreBind {
            std::thread::sleep(Duration::from_millis(400));
        }
        None
    }));

    let stores = vec![
        StoreDescriptor::new(StoreId::new(46), "nodes")
            .with_dependencies(vec![StoreId::new(47)]),
        StoreDescriptor::new(StoreId::new(47), "payloads"),
    ];
    let context = TraceContext::initialize(
        config(&tmp, TraceMode::Readonly),
        None,
        StoreSet::readonly(stores),
    )
    .expect("initialize");
    context
        .wait_for_loading_timeout(LOAD_TIMEOUT)
        .expect("loading");
    assert_eq!(context.failed_count(), 0);

    let nodes = context.store(StoreId::new(46)).expect("nodes");
    let payloads = context.store(StoreId::new(47)).expect("payloads");
    assert_eq!(nodes.bind_state(), BindState::Ready);
    assert_eq!(payloads.bind_state(), BindState::Ready);

    // The cross-store pointer was patched with the delayed store's delta,
    // not whatever it held while that store was still binding.
    let raw = nodes
        .read_at(RegionOffset(node_offset), 8)
        .expect("read node");
    assert_eq!(
        LittleEndian::read_u64(raw),
        payloads.base_addr() + payload_offset
    );
    context.close().expect("close");
}

#[test]
fn undeclared_relocation_target_fails_the_store() {
    let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().expect("tempdir");
    record_session(&tmp, StoreId::new(48), StoreId::new(49));

    // Delay the target so the node store relocates first; patching with a
    // delta the target never published must fail, not silently skip.
    let _hook = set_bind_phase_hook(Box::new(|store, phase| {
        if store == StoreId::new(49) && phase == BindPhase::StoreBind {
            std::thread::sleep(Duration::from_millis(200));
        }
        None
    }));

    // The recorded dependency on store 49 is deliberately not declared.
    let stores = vec![
        StoreDescriptor::new(StoreId::new(48), "nodes"),
        StoreDescriptor::new(StoreId::new(49), "payloads"),
    ];
    let context = TraceContext::initialize(
        config(&tmp, TraceMode::Readonly),
        None,
        StoreSet::readonly(stores),
    )
    .expect("initialize");
    context
        .wait_for_loading_timeout(LOAD_TIMEOUT)
        .expect("loading");

    assert_eq!(context.failed_count(), 1);
    let failures = context.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].store, StoreId::new(48));
    assert_eq!(failures[0].phase, BindPhase::Relocation);

    let nodes = context.store(StoreId::new(48)).expect("nodes");
    let payloads = context.store(StoreId::new(49)).expect("payloads");
    assert_eq!(nodes.bind_state(), BindState::Failed);
    assert_eq!(payloads.bind_state(), BindState::Ready);
    context.close().expect("close");
}

#[test]
fn readonly_dependency_failure_propagates() {
    let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().expect("tempdir");
    record_session(&tmp, StoreId::new(44), StoreId::new(45));

    let _hook = set_bind_phase_hook(Box::new(|store, phase| {
        if store == StoreId::new(45) && phase == BindPhase::StoreBind {
            return Some(TraceStoreError::invalid_state("injected mapping failure"));
        }
        None
    }));

    let stores = vec![
        StoreDescriptor::new(StoreId::new(44), "nodes")
            .with_dependencies(vec![StoreId::new(45)]),
        StoreDescriptor::new(StoreId::new(45), "payloads"),
    ];
    let context = TraceContext::initialize(
        config(&tmp, TraceMode::Readonly),
        None,
        StoreSet::readonly(stores),
    )
    .expect("initialize");
    context
        .wait_for_loading_timeout(LOAD_TIMEOUT)
        .expect("loading");

    // The payload store failed its bind; the dependent node store fails
    // relocation rather than hanging on the dependency.
    assert_eq!(context.failed_count(), 2);
    let nodes = context.store(StoreId::new(44)).expect("nodes");
    let payloads = context.store(StoreId::new(45)).expect("payloads");
    assert_eq!(payloads.bind_state(), BindState::Failed);
    assert_eq!(nodes.bind_state(), BindState::Failed);
    let phases: Vec<BindPhase> = context.failures().iter().map(|f| f.phase).collect();
    assert!(phases.contains(&BindPhase::StoreBind));
    assert!(phases.contains(&BindPhase::Relocation));
    context.close().expect("close");
}

#[test]
fn cancel_settles_every_store() {
    let _guard = HOOK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _hook = set_bind_phase_hook(Box::new(|_, phase| {
        if phase == BindPhase::MetadataInfo {
            std::thread::sleep(Duration::from_millis(30));
        }
        None
    }));

    let tmp = TempDir::new().expect("tempdir");
    let context = TraceContext::initialize(
        config(&tmp, TraceMode::ReadWrite),
        Some(SessionId::new(7)),
        StoreSet::read_write(descriptors()),
    )
    .expect("initialize");
    context.cancel();
    context
        .wait_for_loading_timeout(LOAD_TIMEOUT)
        .expect("loading");
    for store in context.stores() {
        assert!(matches!(
            store.bind_state(),
            BindState::Ready | BindState::Failed
        ));
    }
    context.close().expect("close");
}

#[test]
fn performance_sampler_records_into_designated_store() {
    let tmp = TempDir::new().expect("tempdir");
    let mut cfg = config(&tmp, TraceMode::ReadWrite);
    cfg.sampler_interval_ms = 5;
    cfg.flags.enable_performance_sampler = true;
    cfg.flags.performance_store = Some(StoreId::new(3));

    let context = TraceContext::initialize(
        cfg,
        Some(SessionId::new(7)),
        StoreSet::read_write(vec![
            StoreDescriptor::new(StoreId::new(1), "events").with_reserved_bytes(1024 * 1024),
            StoreDescriptor::new(StoreId::new(3), "perf")
                .with_traits(StoreTraits {
                    concurrent_allocations: true,
                    page_aligned: false,
                    streaming: false,
                })
                .with_reserved_bytes(1024 * 1024),
        ]),
    )
    .expect("initialize");

    context
        .wait_for_loading_timeout(LOAD_TIMEOUT)
        .expect("loading");
    context.allocate_records(StoreId::new(1), 32, 4).expect("allocate");
    std::thread::sleep(Duration::from_millis(100));

    let perf = context.store(StoreId::new(3)).expect("perf store");
    assert!(perf.total_allocations() > 0, "sampler never ticked");
    context.close().expect("close");
}

#[test]
fn timestamped_allocations_fill_timestamp_channels() {
    let tmp = TempDir::new().expect("tempdir");
    let context = TraceContext::initialize(
        config(&tmp, TraceMode::ReadWrite),
        Some(SessionId::new(7)),
        StoreSet::read_write(vec![
            StoreDescriptor::new(StoreId::new(1), "events").with_reserved_bytes(1024 * 1024),
        ]),
    )
    .expect("initialize");

    let store = context.store(StoreId::new(1)).expect("store");
    for micros in [100u64, 250, 900] {
        store
            .allocate_records_with_timestamp(32, 1, micros)
            .expect("allocate");
    }
    use trace_store::meta::MetadataKind;
    assert_eq!(
        store
            .channel(MetadataKind::AllocationTimestamp)
            .expect("channel")
            .record_count(),
        3
    );
    assert_eq!(
        store
            .channel(MetadataKind::AllocationTimestampDelta)
            .expect("channel")
            .record_count(),
        3
    );
    assert_eq!(
        store
            .channel(MetadataKind::Allocation)
            .expect("channel")
            .record_count(),
        3
    );
    context.close().expect("close");
}
