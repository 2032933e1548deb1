//! Asynchronous mutation continuations.
//!
//! A mutator that starts asynchronous work returns
//! [`Outcome::Async`](crate::Outcome::Async) with one half of a
//! [`Continuation::pending`] pair and hands the [`Resolver`] to whatever
//! completes the work. Settling the resolver with a follow-up mutator records
//! a linked continuation record (its `async_origin` points at the record that
//! spawned it); settling with a plain value logs that no completion handler
//! was provided; rejecting runs the caller's error handler if one was given
//! and otherwise logs the rejection without letting it escape into unrelated
//! code.
//!
//! Settlements that arrive while another mutation chain is on the stack are
//! parked and applied once the coordinator goes idle, so a continuation
//! record always starts a fresh top-level tree instead of splicing into
//! whatever happens to be running.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::coordinator::{self, HandleShared, Outcome};
use crate::record::DiffId;
use crate::store::StoreInner;

/// Error handler for a rejected continuation. Runs as a mutator, so it may
/// repair state and may itself return another pending continuation.
pub type OnError = Box<dyn FnOnce(String) -> Outcome + Send>;

type FollowUp = Box<dyn FnOnce() -> Outcome + Send>;

/// How a continuation settled.
pub(crate) enum Settlement {
    /// Resolved with a follow-up mutator.
    Next(FollowUp),
    /// Resolved with a plain value; there is nothing to run.
    Value(Value),
    /// Rejected.
    Error(String),
}

/// Coordinator-side bookkeeping attached to a continuation when the mutator
/// that returned it exits.
pub(crate) struct Registration {
    pub(crate) store: Weak<StoreInner>,
    pub(crate) origin: DiffId,
    pub(crate) reason: String,
    pub(crate) on_error: Option<OnError>,
    pub(crate) handle: Arc<HandleShared>,
}

enum Slot {
    /// Created but not yet returned through a mutate call.
    Unregistered,
    /// Returned through mutate; awaiting settlement.
    Registered(Registration),
    /// Settled before the mutate call exited; applied at the outer flush.
    SettledEarly(Settlement),
    /// Fully consumed.
    Done,
}

/// The pending half of an asynchronous mutation, returned by the mutator.
pub struct Continuation {
    slot: Arc<Mutex<Slot>>,
}

/// The settling half of an asynchronous mutation.
///
/// Settles at most once; dropping an unsettled resolver rejects the
/// continuation so the store never waits forever on a forgotten handle.
pub struct Resolver {
    slot: Arc<Mutex<Slot>>,
}

impl Continuation {
    /// Create a linked continuation/resolver pair.
    pub fn pending() -> (Continuation, Resolver) {
        let slot = Arc::new(Mutex::new(Slot::Unregistered));
        (
            Continuation {
                slot: Arc::clone(&slot),
            },
            Resolver { slot },
        )
    }

    pub(crate) fn register(self, registration: Registration) {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Done) {
            Slot::Unregistered => *slot = Slot::Registered(registration),
            Slot::SettledEarly(settlement) => {
                // The resolver fired inside the mutator body; park the
                // settlement so it runs after the synchronous records flush.
                drop(slot);
                if let Some(inner) = registration.store.upgrade() {
                    inner.coord.defer_settlement(registration, settlement);
                }
            }
            Slot::Registered(_) | Slot::Done => {
                unreachable!("a continuation registers exactly once")
            }
        }
    }
}

impl Resolver {
    /// Resolve with a follow-up mutator; records the linked continuation
    /// record once applied.
    pub fn resolve(self, follow_up: impl FnOnce() -> Outcome + Send + 'static) {
        self.settle(Settlement::Next(Box::new(follow_up)));
    }

    /// Resolve with a plain value. There is no completion handler to run, so
    /// this logs and produces no follow-up record.
    pub fn resolve_value(self, value: Value) {
        self.settle(Settlement::Value(value));
    }

    /// Reject the continuation. Runs the caller's error handler when one was
    /// supplied; otherwise the rejection is logged and isolated.
    pub fn reject(self, error: impl Into<String>) {
        self.settle(Settlement::Error(error.into()));
    }

    fn settle(&self, settlement: Settlement) {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Done) {
            Slot::Unregistered => *slot = Slot::SettledEarly(settlement),
            Slot::Registered(registration) => {
                drop(slot);
                let Some(inner) = registration.store.upgrade() else {
                    return;
                };
                if inner.coord.in_progress() {
                    // Another chain is mid-flight; apply once it finishes.
                    inner.coord.defer_settlement(registration, settlement);
                } else {
                    apply_settlement(&inner, registration, settlement);
                }
            }
            Slot::SettledEarly(previous) => {
                tracing::warn!("continuation settled twice; keeping the first settlement");
                *slot = Slot::SettledEarly(previous);
            }
            Slot::Done => {
                tracing::warn!("continuation settled twice; ignoring the late settlement");
            }
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        let pending = {
            let slot = self.slot.lock();
            matches!(*slot, Slot::Unregistered | Slot::Registered(_))
        };
        if pending {
            tracing::warn!("continuation resolver dropped before settling; treating as rejected");
            self.settle(Settlement::Error(
                "continuation resolver dropped before settling".to_owned(),
            ));
        }
    }
}

/// Run a settlement against the store: decrement the in-flight count, then
/// re-enter the coordinator for follow-up/error mutators. Failures here are
/// isolated by design; a broken continuation must not crash unrelated code.
pub(crate) fn apply_settlement(
    inner: &Arc<StoreInner>,
    registration: Registration,
    settlement: Settlement,
) {
    inner.coord.finish_async();
    let Registration {
        origin,
        reason,
        on_error,
        handle,
        ..
    } = registration;

    match settlement {
        Settlement::Next(follow_up) => {
            let result = coordinator::mutate_full_inner(
                inner,
                reason,
                follow_up,
                on_error,
                Some(origin),
                Some(handle),
            );
            if let Err(error) = result {
                tracing::error!(%error, %origin, "mutation continuation failed");
            }
        }
        Settlement::Value(value) => {
            tracing::warn!(
                %origin,
                ?value,
                "continuation resolved without a completion handler; no follow-up record"
            );
            handle.settle();
        }
        Settlement::Error(message) => match on_error {
            Some(error_handler) => {
                let reason = format!("{reason} (error handler)");
                let result = coordinator::mutate_full_inner(
                    inner,
                    reason,
                    move || error_handler(message),
                    None,
                    Some(origin),
                    Some(handle),
                );
                if let Err(error) = result {
                    tracing::error!(%error, %origin, "continuation error handler failed");
                }
            }
            None => {
                tracing::error!(%message, %origin, "unhandled rejection in mutation continuation");
                handle.settle();
            }
        },
    }
    coordinator::maybe_drain_settled(inner);
}
