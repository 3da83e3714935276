//! Start-up reconciliation of local recordings against the ledger and mappings.
//!
//! Must finish for a recording before any upload queue is created for it.

use log::{debug, error, info, warn};
use std::collections::BTreeSet;

use crate::chunk_store::ChunkSlot;
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::ids::{RecordingId, RemoteRecordingId};
use crate::ledger::UploadStatus;
use crate::recording::{Recording, RecordingState};
use crate::upload_queue::{QueueStats, UploadFailure};

/// Outstanding work of one mapped, unsynced recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPlan {
    pub recording_id: RecordingId,
    pub remote_id: RemoteRecordingId,
    pub state: RecordingState,
    /// The init segment was never acknowledged
    pub resend_init: bool,
    /// In the ledger but not uploaded
    pub pending: BTreeSet<u64>,
    /// In the local store but absent from the ledger
    pub missing: BTreeSet<u64>,
}

impl RecoveryPlan {
    pub fn is_unfinished(&self) -> bool {
        self.resend_init || !self.pending.is_empty() || !self.missing.is_empty()
    }

    /// Every chunk id that has to go through the queue again
    pub fn outstanding(&self) -> BTreeSet<u64> {
        self.pending.union(&self.missing).copied().collect()
    }
}

#[derive(Debug)]
pub enum ResumeOutcome {
    Synced(Recording),
    /// Some chunks failed past the retry bound; the recording needs a manual resume
    Incomplete {
        stats: QueueStats,
        failures: Vec<UploadFailure>,
    },
}

/// Summary of a full recovery pass
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub interrupted: Vec<RecordingId>,
    pub synced: Vec<RecordingId>,
    pub incomplete: Vec<(RecordingId, QueueStats)>,
    /// Remote counterpart is gone; discarding the local copy is recommended
    pub discard_recommended: Vec<(RecordingId, RemoteRecordingId)>,
    pub errors: Vec<(RecordingId, String)>,
}

pub struct RecoveryScanner {
    ctx: SyncContext,
}

impl RecoveryScanner {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Move recordings left active by a previous process to `interrupted`
    pub async fn mark_interrupted(&self) -> Result<Vec<RecordingId>> {
        let stale = self
            .ctx
            .recordings
            .list_in_states(&[RecordingState::Recording, RecordingState::Finalizing])
            .await?;
        let mut marked = Vec::with_capacity(stale.len());
        for recording in stale {
            self.ctx.recordings.mark_interrupted(&recording.id).await?;
            info!(
                "[Recovery] {} was {} at start-up, marked interrupted",
                recording.id, recording.state
            );
            marked.push(recording.id);
        }
        Ok(marked)
    }

    /// Plans for every unsynced recording that holds chunks and was registered remotely
    pub async fn scan(&self) -> Result<Vec<RecoveryPlan>> {
        let candidates = self.ctx.recordings.list_unsynced_with_chunks().await?;
        let mut plans = Vec::new();
        for recording in candidates {
            match self.plan_for(&recording).await? {
                Some(plan) => plans.push(plan),
                None => debug!("[Recovery] {} is local-only, skipping", recording.id),
            }
        }
        Ok(plans)
    }

    async fn plan_for(&self, recording: &Recording) -> Result<Option<RecoveryPlan>> {
        let Some(mapping) = self.ctx.mappings.get(&recording.id).await? else {
            return Ok(None);
        };

        let mut ledgered = BTreeSet::new();
        let mut pending = BTreeSet::new();
        for entry in self.ctx.ledger.list(&recording.id).await? {
            if let ChunkSlot::Chunk(id) = entry.slot {
                ledgered.insert(id);
                if entry.status != UploadStatus::Uploaded {
                    pending.insert(id);
                }
            }
        }

        let missing: BTreeSet<u64> = self
            .ctx
            .local
            .list_chunk_ids(&recording.id)
            .await?
            .into_iter()
            .filter(|id| !ledgered.contains(id))
            .collect();

        let plan = RecoveryPlan {
            recording_id: recording.id.clone(),
            remote_id: mapping.remote_recording_id,
            state: recording.state,
            resend_init: !mapping.init_segment_uploaded,
            pending,
            missing,
        };
        debug!(
            "[Recovery] {}: init {}, {} pending, {} missing",
            plan.recording_id,
            if plan.resend_init { "unconfirmed" } else { "confirmed" },
            plan.pending.len(),
            plan.missing.len()
        );
        Ok(Some(plan))
    }

    /// Redrive a plan through a fresh queue and seal the recording on a full drain
    ///
    /// Fails with `RemoteRecordingGone` when the remote side no longer knows
    /// the recording; that error is not retryable.
    pub async fn resume(&self, plan: &RecoveryPlan) -> Result<ResumeOutcome> {
        if plan.state == RecordingState::Interrupted {
            self.ctx
                .recordings
                .transition(&plan.recording_id, RecordingState::Finalizing)
                .await?;
        }

        let queue = self
            .ctx
            .queue(plan.recording_id.clone(), plan.remote_id.clone());
        if plan.resend_init {
            queue.enqueue_init().await?;
        }
        for chunk_id in plan.outstanding() {
            queue.enqueue(chunk_id).await?;
        }
        let stats = queue.wait_for_completion().await;

        if queue.remote_gone() {
            return Err(SyncError::RemoteRecordingGone(plan.remote_id.to_string()));
        }
        if !stats.all_uploaded() {
            warn!(
                "[Recovery] {} still has {} failed chunk(s)",
                plan.recording_id, stats.failed
            );
            return Ok(ResumeOutcome::Incomplete {
                stats,
                failures: queue.failures(),
            });
        }

        let recording = self
            .ctx
            .seal(&plan.recording_id, &plan.remote_id, false)
            .await?;
        Ok(ResumeOutcome::Synced(recording))
    }

    /// Full start-up pass: mark stale recordings, scan, resume everything found
    pub async fn run(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            interrupted: self.mark_interrupted().await?,
            ..Default::default()
        };

        let plans = self.scan().await?;
        info!("[Recovery] {} recording(s) to reconcile", plans.len());
        for plan in plans {
            match self.resume(&plan).await {
                Ok(ResumeOutcome::Synced(recording)) => report.synced.push(recording.id),
                Ok(ResumeOutcome::Incomplete { stats, .. }) => {
                    report.incomplete.push((plan.recording_id.clone(), stats))
                }
                Err(SyncError::RemoteRecordingGone(_)) => {
                    error!(
                        "[Recovery] remote recording {} for {} is gone; discard the local copy",
                        plan.remote_id, plan.recording_id
                    );
                    report
                        .discard_recommended
                        .push((plan.recording_id.clone(), plan.remote_id.clone()));
                }
                Err(e) => {
                    error!("[Recovery] failed to resume {}: {}", plan.recording_id, e);
                    report.errors.push((plan.recording_id.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(resend_init: bool, pending: &[u64], missing: &[u64]) -> RecoveryPlan {
        RecoveryPlan {
            recording_id: RecordingId::new("rec_1"),
            remote_id: RemoteRecordingId::new("rrec_1"),
            state: RecordingState::Interrupted,
            resend_init,
            pending: pending.iter().copied().collect(),
            missing: missing.iter().copied().collect(),
        }
    }

    #[test]
    fn test_unfinished_when_anything_is_outstanding() {
        assert!(!plan(false, &[], &[]).is_unfinished());
        assert!(plan(true, &[], &[]).is_unfinished());
        assert!(plan(false, &[2], &[]).is_unfinished());
        assert!(plan(false, &[], &[7]).is_unfinished());
    }

    #[test]
    fn test_outstanding_merges_pending_and_missing() {
        let p = plan(false, &[1, 3], &[3, 5]);
        assert_eq!(p.outstanding().into_iter().collect::<Vec<_>>(), vec![1, 3, 5]);
    }
}
