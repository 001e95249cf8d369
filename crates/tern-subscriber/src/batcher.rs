// Coalesces per-message decisions into size-capped request frames.
use std::collections::HashSet;
use std::sync::Mutex;

use tern_wire::StreamingPullRequest;

use crate::config::MAX_PER_REQUEST_CHANGES;

/// One deadline modification awaiting transmission. Zero seconds releases the
/// lease immediately, which is how a nack travels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingModifyDeadline {
    pub(crate) ack_id: String,
    pub(crate) extension_seconds: u64,
}

/// Pending ack and nack sets, drained wholesale into chunked frames.
///
/// A handle's decision is recorded exactly once, so the two sets stay
/// disjoint; each set has its own lock and is moved out in its entirety
/// during a flush.
#[derive(Default)]
pub(crate) struct AckBatcher {
    pending_acks: Mutex<HashSet<String>>,
    pending_nacks: Mutex<HashSet<String>>,
}

impl AckBatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_ack(&self, ack_id: String) {
        self.pending_acks
            .lock()
            .expect("pending acks lock")
            .insert(ack_id);
    }

    pub(crate) fn add_nack(&self, ack_id: String) {
        self.pending_nacks
            .lock()
            .expect("pending nacks lock")
            .insert(ack_id);
    }

    /// Drain everything pending, merge in the caller's deadline extensions,
    /// and build the outbound frames. No frame carries more than
    /// `MAX_PER_REQUEST_CHANGES` ack ids nor more than that many
    /// modify-deadline pairs.
    pub(crate) fn drain(
        &self,
        extensions: Vec<PendingModifyDeadline>,
    ) -> Vec<StreamingPullRequest> {
        let acks: Vec<String> = {
            let mut pending = self.pending_acks.lock().expect("pending acks lock");
            pending.drain().collect()
        };
        let mut modifications = extensions;
        {
            let mut pending = self.pending_nacks.lock().expect("pending nacks lock");
            modifications.extend(pending.drain().map(|ack_id| PendingModifyDeadline {
                ack_id,
                extension_seconds: 0,
            }));
        }
        build_frames(acks, modifications)
    }
}

fn build_frames(
    acks: Vec<String>,
    modifications: Vec<PendingModifyDeadline>,
) -> Vec<StreamingPullRequest> {
    if acks.is_empty() && modifications.is_empty() {
        return Vec::new();
    }
    let mut ack_chunks = acks.chunks(MAX_PER_REQUEST_CHANGES);
    let mut modify_chunks = modifications.chunks(MAX_PER_REQUEST_CHANGES);
    let mut frames = Vec::new();
    loop {
        let ack_chunk = ack_chunks.next();
        let modify_chunk = modify_chunks.next();
        if ack_chunk.is_none() && modify_chunk.is_none() {
            break;
        }
        let mut request = StreamingPullRequest::default();
        if let Some(chunk) = ack_chunk {
            request.ack_ids = chunk.to_vec();
        }
        if let Some(chunk) = modify_chunk {
            for modification in chunk {
                request.push_modify_deadline(
                    modification.ack_id.clone(),
                    modification.extension_seconds,
                );
            }
        }
        frames.push(request);
    }
    frames
}
