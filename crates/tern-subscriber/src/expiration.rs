// Lease bookkeeping: handles, expiration buckets, and the ordered table the
// extension sweep walks.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::batcher::PendingModifyDeadline;
use crate::config::MAX_ACK_DEADLINE_SECONDS;

/// One delivered message's lease. Shared between the expiration table and the
/// completion path; `decided` flips exactly once, on ack, nack, or receiver
/// failure, after which the next sweep drops the handle.
pub(crate) struct LeaseHandle {
    pub(crate) ack_id: String,
    pub(crate) bytes: usize,
    pub(crate) received_at: Instant,
    decided: AtomicBool,
}

impl LeaseHandle {
    pub(crate) fn new(ack_id: String, bytes: usize, received_at: Instant) -> Self {
        Self {
            ack_id,
            bytes,
            received_at,
            decided: AtomicBool::new(false),
        }
    }

    /// Returns whether this call was the first decision.
    pub(crate) fn decide(&self) -> bool {
        !self.decided.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_decided(&self) -> bool {
        self.decided.load(Ordering::Acquire)
    }
}

/// Handles sharing one expiration instant. `next_extension_secs` starts at the
/// initial extension and doubles per sweep, saturating at the server's
/// deadline cap.
struct Bucket {
    next_extension_secs: u64,
    handles: Vec<Arc<LeaseHandle>>,
}

/// Outcome of one extension sweep.
pub(crate) struct Sweep {
    pub(crate) extensions: Vec<PendingModifyDeadline>,
    /// Earliest expiration still in the table; the alarm re-arms on it.
    pub(crate) next_expiration: Option<Instant>,
}

/// Ordered multi-map from expiration instant to lease bucket.
///
/// Every undecided handle lives in exactly one bucket until a sweep observes
/// its decision. Insertion under an existing key merges handles and keeps the
/// incumbent bucket's extension schedule.
#[derive(Default)]
pub(crate) struct ExpirationTable {
    buckets: BTreeMap<Instant, Bucket>,
}

impl ExpirationTable {
    pub(crate) fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(
        &mut self,
        expiration: Instant,
        initial_extension_secs: u64,
        handles: Vec<Arc<LeaseHandle>>,
    ) {
        self.buckets
            .entry(expiration)
            .or_insert_with(|| Bucket {
                next_extension_secs: initial_extension_secs,
                handles: Vec::new(),
            })
            .handles
            .extend(handles);
    }

    /// Extend every bucket expiring at or before `cut_over`.
    ///
    /// Each expiring bucket moves to `now + next_extension_secs` with its
    /// extension doubled; decided handles are dropped, survivors get a
    /// modify-deadline entry and are re-inserted under the new key. Runs
    /// synchronously under the table lock.
    pub(crate) fn sweep(&mut self, now: Instant, cut_over: Instant) -> Sweep {
        let still_due = self
            .buckets
            .split_off(&(cut_over + Duration::from_nanos(1)));
        let expiring = std::mem::replace(&mut self.buckets, still_due);

        let mut extensions = Vec::new();
        for (_, mut bucket) in expiring {
            let granted_secs = bucket.next_extension_secs.min(MAX_ACK_DEADLINE_SECONDS);
            let new_expiration = now + Duration::from_secs(granted_secs);
            bucket.next_extension_secs =
                (bucket.next_extension_secs * 2).min(MAX_ACK_DEADLINE_SECONDS);

            let survivors: Vec<Arc<LeaseHandle>> = bucket
                .handles
                .into_iter()
                .filter(|handle| !handle.is_decided())
                .collect();
            if survivors.is_empty() {
                continue;
            }
            for handle in &survivors {
                extensions.push(PendingModifyDeadline {
                    ack_id: handle.ack_id.clone(),
                    extension_seconds: granted_secs,
                });
            }
            self.buckets
                .entry(new_expiration)
                .or_insert_with(|| Bucket {
                    next_extension_secs: bucket.next_extension_secs,
                    handles: Vec::new(),
                })
                .handles
                .extend(survivors);
        }

        Sweep {
            extensions,
            next_expiration: self.buckets.first_key_value().map(|(key, _)| *key),
        }
    }
}
