//! The mutation coordinator: nested-call tracking and diff-tree construction.
//!
//! Every mutation flows through [`mutate_full_inner`]. The coordinator keeps a
//! nesting level plus a stack of frames over a slab arena of records under
//! construction, and rebuilds the exact tree shape of caller-nested mutation
//! calls purely from enter/exit order:
//!
//! - entering deeper than the previous call descends into the most recently
//!   added record (the new record becomes its child),
//! - entering at the same depth appends a sibling at the current frame,
//! - entering shallower pops back and appends a sibling at the parent frame.
//!
//! When the outermost call completes, the finished top-level records are
//! flushed to the history ledger in order and all bookkeeping resets. The
//! bookkeeping is per store instance but still assumes a single outer call in
//! flight at a time; two overlapping outer call chains would interleave their
//! children into one tree and are not a supported pattern.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexSet;
use parking_lot::Mutex;
use slab::Slab;

use crate::continuation::{Continuation, Registration, Settlement};
use crate::delta::diff;
use crate::error::{Result, StoreError};
use crate::record::{DiffId, DiffRecord};
use crate::store::StoreInner;
use crate::watch::{self, FireCause, WatchId};

/// What a mutator produced.
pub enum Outcome {
    /// The mutation completed within the mutator body.
    Sync,
    /// The mutator started asynchronous work; the record is marked pending
    /// and the continuation links a follow-up record once it settles.
    Async(Continuation),
}

/// Completion handle returned by the mutate entry points.
///
/// Settles when the mutation and its entire continuation chain have finished.
/// For purely synchronous mutations it is settled by the time the call
/// returns.
#[derive(Clone)]
pub struct MutationHandle {
    shared: Arc<HandleShared>,
}

#[derive(Default)]
pub(crate) struct HandleShared {
    settled: AtomicBool,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl MutationHandle {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(HandleShared::default()),
        }
    }

    /// A handle that is already settled (locked-store no-ops).
    pub(crate) fn settled_now() -> Self {
        let handle = Self::new();
        handle.shared.settle();
        handle
    }

    pub(crate) fn from_shared(shared: Arc<HandleShared>) -> Self {
        Self { shared }
    }

    /// True once the mutation and every linked continuation completed.
    pub fn is_settled(&self) -> bool {
        self.shared.settled.load(Ordering::Acquire)
    }

    /// Run `f` when the mutation settles; immediately if it already has.
    pub fn on_done(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut callbacks = self.shared.callbacks.lock();
            if !self.shared.settled.load(Ordering::Acquire) {
                callbacks.push(Box::new(f));
                return;
            }
        }
        f();
    }
}

impl HandleShared {
    pub(crate) fn settle(&self) {
        self.settled.store(true, Ordering::Release);
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }
}

/// A record under construction plus the arena indices of its children.
struct PendingRec {
    record: DiffRecord,
    children: Vec<usize>,
}

enum FrameRef {
    /// The top-level pending list.
    Root,
    /// The children list of an in-progress record.
    Children(usize),
}

pub(crate) struct CoordState {
    /// Current nesting level; -1 while idle.
    level: i32,
    frames: Vec<FrameRef>,
    arena: Slab<PendingRec>,
    /// Top-level record indices awaiting the outermost exit.
    root: Vec<usize>,
    pub(crate) pending_each: IndexSet<WatchId>,
    pub(crate) pending_settled: IndexSet<WatchId>,
    /// Record whose completion is currently firing watcher callbacks; any
    /// mutation started inside such a callback records it as `triggered_by`.
    notifying: Option<DiffId>,
    /// Continuations registered but not yet settled.
    async_pending: usize,
    /// Settlements that arrived while a mutation was in flight; drained once
    /// the coordinator is idle so continuation records never splice into an
    /// unrelated tree.
    deferred: Vec<(Registration, Settlement)>,
    /// Id of the most recently flushed top-level record, used to attribute
    /// mutations started from settled-queue callbacks.
    last_root: Option<DiffId>,
}

impl CoordState {
    fn new() -> Self {
        Self {
            level: -1,
            frames: vec![FrameRef::Root],
            arena: Slab::new(),
            root: Vec::new(),
            pending_each: IndexSet::new(),
            pending_settled: IndexSet::new(),
            notifying: None,
            async_pending: 0,
            deferred: Vec::new(),
            last_root: None,
        }
    }

    fn reset_nesting(&mut self) {
        self.level = -1;
        self.frames.clear();
        self.frames.push(FrameRef::Root);
        debug_assert!(self.arena.is_empty());
    }

    fn top_frame_records<'a>(&'a self) -> &'a [usize] {
        match self.frames.last().expect("frame stack is never empty") {
            FrameRef::Root => &self.root,
            FrameRef::Children(parent) => &self.arena[*parent].children,
        }
    }

    fn push_to_top_frame(&mut self, idx: usize) {
        match self.frames.last().expect("frame stack is never empty") {
            FrameRef::Root => self.root.push(idx),
            FrameRef::Children(parent) => {
                let parent = *parent;
                self.arena[parent].children.push(idx);
            }
        }
    }
}

pub(crate) struct Coordinator {
    pub(crate) state: Mutex<CoordState>,
}

impl Coordinator {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CoordState::new()),
        }
    }

    /// True while any mutate call is on the stack. This is the write
    /// authorization flag checked by state views.
    pub(crate) fn in_progress(&self) -> bool {
        self.state.lock().level >= 0
    }

    /// True while a mutation is running or a continuation is pending.
    pub(crate) fn in_flight(&self) -> bool {
        let st = self.state.lock();
        st.level >= 0 || st.async_pending > 0
    }

    /// Queue a settlement that must wait for the coordinator to go idle.
    pub(crate) fn defer_settlement(&self, registration: Registration, settlement: Settlement) {
        self.state.lock().deferred.push((registration, settlement));
    }

    pub(crate) fn finish_async(&self) {
        let mut st = self.state.lock();
        st.async_pending = st.async_pending.saturating_sub(1);
    }

    /// Record which top-level record completed last, for `triggered_by`
    /// attribution of mutations started from settled-queue callbacks.
    pub(crate) fn note_flushed_root(&self, id: DiffId) {
        self.state.lock().last_root = Some(id);
    }

    pub(crate) fn forget_watch(&self, id: WatchId) {
        let mut st = self.state.lock();
        st.pending_each.shift_remove(&id);
        st.pending_settled.shift_remove(&id);
    }
}

/// Resets the coordinator if a mutator body unwinds.
///
/// Without this a panicking mutator would leave the nesting level wedged and
/// every later mutate call would build onto a half-finished tree. The records
/// of the panicked chain are discarded; the ledger cannot represent a
/// mutation that tore mid-way.
struct UnwindGuard<'a> {
    coord: &'a Coordinator,
    defused: bool,
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        tracing::error!("mutator panicked; discarding the in-flight mutation records");
        let mut st = self.coord.state.lock();
        st.arena.clear();
        st.root.clear();
        st.pending_each.clear();
        st.pending_settled.clear();
        st.notifying = None;
        st.reset_nesting();
    }
}

/// The single mutation entry point backing all public `mutate` variants.
pub(crate) fn mutate_full_inner(
    inner: &Arc<StoreInner>,
    reason: String,
    mutator: impl FnOnce() -> Outcome,
    on_error: Option<crate::continuation::OnError>,
    async_origin: Option<DiffId>,
    handle: Option<Arc<HandleShared>>,
) -> Result<MutationHandle> {
    if inner.locked.load(Ordering::Acquire) {
        tracing::info!(%reason, "modifications are locked; mutation skipped");
        if let Some(shared) = handle {
            shared.settle();
            return Ok(MutationHandle::from_shared(shared));
        }
        return Ok(MutationHandle::settled_now());
    }

    // Enter: place the new record according to the nesting transition.
    let (rec_id, idx) = {
        let mut st = inner.coord.state.lock();
        let new_level = st.level + 1;
        if new_level as usize >= inner.options.max_depth {
            return Err(StoreError::MaxNestingDepthExceeded {
                max: inner.options.max_depth,
            });
        }
        st.level = new_level;
        let depth = new_level as usize;
        // Shallower than the previous call: siblings attach at the parent
        // frame, so pop back down to it first.
        while st.frames.len() > depth + 1 {
            st.frames.pop();
        }
        // Deeper than the previous call: descend into the most recently
        // added record of the current frame.
        if st.frames.len() == depth {
            let parent = *st
                .top_frame_records()
                .last()
                .expect("a deeper call implies a prior record at the current frame");
            st.frames.push(FrameRef::Children(parent));
        }
        debug_assert_eq!(st.frames.len(), depth + 1);

        let mut record = DiffRecord::new(reason.clone(), st.notifying, capture_stack(inner));
        record.async_origin = async_origin;
        let rec_id = record.id;
        let idx = st.arena.insert(PendingRec {
            record,
            children: Vec::new(),
        });
        st.push_to_top_frame(idx);
        (rec_id, idx)
    };

    let before = inner.options.diffing.then(|| inner.snapshot_value());

    let mut guard = UnwindGuard {
        coord: &inner.coord,
        defused: false,
    };
    let outcome = mutator();

    // Per-call watcher queue drains before the delta is finalized, so
    // watcher-triggered nested mutations land inside this record and their
    // writes are part of its delta. Still guarded: a panicking watcher
    // callback must not wedge the nesting state either.
    drain_each_queue(inner, rec_id);
    guard.defused = true;
    drop(guard);

    let delta = before.and_then(|before| diff(&before, &inner.snapshot_value()));

    let shared = handle.unwrap_or_else(|| Arc::new(HandleShared::default()));
    let is_async = matches!(outcome, Outcome::Async(_));

    let (outermost, flushed) = {
        let mut st = inner.coord.state.lock();
        st.arena[idx].record.delta = delta;
        if is_async {
            st.arena[idx].record.is_async = true;
            st.async_pending += 1;
        }
        let outermost = st.level == 0;
        st.level -= 1;
        let mut flushed = Vec::new();
        if outermost {
            let roots = std::mem::take(&mut st.root);
            for root_idx in roots {
                flushed.push(reify(&mut st.arena, root_idx));
            }
            st.reset_nesting();
            st.last_root = flushed.last().map(|r| r.id);
        }
        (outermost, flushed)
    };

    if outermost {
        if inner.options.diffing && !flushed.is_empty() {
            inner.ledger.push_user_records(inner, flushed);
        }
        inner.persist_all();
    }

    // Settle (or register the continuation) only after the records reached
    // the ledger, so completion callbacks observe a consistent history.
    if let Outcome::Async(continuation) = outcome {
        continuation.register(Registration {
            store: Arc::downgrade(inner),
            origin: rec_id,
            reason,
            on_error,
            handle: Arc::clone(&shared),
        });
    } else {
        shared.settle();
    }

    if outermost {
        drain_deferred_settlements(inner);
        maybe_drain_settled(inner);
    }

    Ok(MutationHandle::from_shared(shared))
}

fn capture_stack(inner: &StoreInner) -> Option<String> {
    inner
        .options
        .capture_stack
        .then(|| std::backtrace::Backtrace::force_capture().to_string())
}

/// Turn a pending arena node into a finished record tree.
fn reify(arena: &mut Slab<PendingRec>, idx: usize) -> DiffRecord {
    let pending = arena.remove(idx);
    let mut record = pending.record;
    for child in pending.children {
        record.sub_entries.push(reify(arena, child));
    }
    record
}

/// Drain the per-mutation-call watcher queue, attributing any mutations the
/// callbacks start to `trigger`.
pub(crate) fn drain_each_queue(inner: &Arc<StoreInner>, trigger: DiffId) {
    let previous = {
        let mut st = inner.coord.state.lock();
        std::mem::replace(&mut st.notifying, Some(trigger))
    };
    loop {
        let next = {
            let mut st = inner.coord.state.lock();
            st.pending_each.shift_remove_index(0)
        };
        match next {
            Some(id) => watch::run_watch(inner, id, FireCause::EachMutation),
            None => break,
        }
    }
    inner.coord.state.lock().notifying = previous;
}

/// Drain the settled watcher queue, but only once no mutation and no
/// continuation remains in flight.
pub(crate) fn maybe_drain_settled(inner: &Arc<StoreInner>) {
    let trigger = {
        let st = inner.coord.state.lock();
        if st.level >= 0 || st.async_pending > 0 || st.pending_settled.is_empty() {
            return;
        }
        st.last_root
    };
    let previous = {
        let mut st = inner.coord.state.lock();
        std::mem::replace(&mut st.notifying, trigger)
    };
    loop {
        let next = {
            let mut st = inner.coord.state.lock();
            if st.level >= 0 || st.async_pending > 0 {
                // A settled callback kicked off new async work; the rest of
                // the queue waits for it.
                cov_mark::hit!(settled_drain_interrupted);
                break;
            }
            st.pending_settled.shift_remove_index(0)
        };
        match next {
            Some(id) => watch::run_watch(inner, id, FireCause::Settled),
            None => break,
        }
    }
    inner.coord.state.lock().notifying = previous;
}

/// Apply settlements that arrived while a mutation chain was in flight.
fn drain_deferred_settlements(inner: &Arc<StoreInner>) {
    loop {
        let next = {
            let mut st = inner.coord.state.lock();
            if st.deferred.is_empty() {
                None
            } else {
                Some(st.deferred.remove(0))
            }
        };
        match next {
            Some((registration, settlement)) => {
                cov_mark::hit!(deferred_settlement_applied);
                crate::continuation::apply_settlement(inner, registration, settlement);
            }
            None => break,
        }
    }
}
