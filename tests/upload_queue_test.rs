mod common;

use std::sync::Arc;
use std::time::Duration;

use save_media_chunks::chunk_store::{ChunkSlot, ChunkStore, MemoryChunkStore};
use save_media_chunks::ids::{RecordingId, RemoteRecordingId};
use save_media_chunks::ledger::UploadStatus;
use save_media_chunks::upload_queue::{FailureKind, QueueStats, UploadOptions};

use common::{chunk_bytes, client_context, seed_local, test_options, StaticRegistry, TestRemote};

type Remote = TestRemote<MemoryChunkStore<RemoteRecordingId>>;

fn remote_with_delay(delay_ms: u64) -> Arc<Remote> {
    Arc::new(TestRemote::new(MemoryChunkStore::new()).with_delay(Duration::from_millis(delay_ms)))
}

#[tokio::test]
async fn test_concurrency_never_exceeds_bound() {
    let remote = remote_with_delay(40);
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, 0..12).await;

    let queue = ctx.queue(rid.clone(), RemoteRecordingId::new("rrec_bound"));
    for id in 0..12 {
        assert!(queue.enqueue(id).await.unwrap());
    }
    let stats = queue.wait_for_completion().await;

    assert_eq!(
        stats,
        QueueStats {
            total: 12,
            uploaded: 12,
            failed: 0,
            pending: 0
        }
    );
    assert!(remote.max_in_flight() <= 3, "max in flight {}", remote.max_in_flight());
    assert!(remote.max_in_flight() >= 2, "uploads never overlapped");
}

#[tokio::test]
async fn test_single_worker_is_sequential() {
    let remote = remote_with_delay(5);
    let options = UploadOptions {
        max_concurrency: 1,
        ..test_options()
    };
    let (ctx, _guard) =
        client_context(remote.clone(), Arc::new(StaticRegistry::default()), options).await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, 0..5).await;

    let queue = ctx.queue(rid, RemoteRecordingId::new("rrec_seq"));
    for id in 0..5 {
        queue.enqueue(id).await.unwrap();
    }
    assert!(queue.wait_for_completion().await.all_uploaded());
    assert_eq!(remote.max_in_flight(), 1);
}

#[tokio::test]
async fn test_pending_is_recorded_before_transfer() {
    let remote = remote_with_delay(50);
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, [0]).await;

    let queue = ctx.queue(rid.clone(), RemoteRecordingId::new("rrec_pending"));
    queue.enqueue(0).await.unwrap();

    // Enqueue returns before the transfer finishes, the ledger already knows the slot
    let entry = ctx.ledger.get(&rid, ChunkSlot::Chunk(0)).await.unwrap().unwrap();
    assert!(matches!(
        entry.status,
        UploadStatus::Pending | UploadStatus::Uploading
    ));

    queue.wait_for_completion().await;
    let entry = ctx.ledger.get(&rid, ChunkSlot::Chunk(0)).await.unwrap().unwrap();
    assert_eq!(entry.status, UploadStatus::Uploaded);
    assert!(entry.last_attempt_at.is_some());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let remote = remote_with_delay(0);
    remote.fail(ChunkSlot::Chunk(1), 2);
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, 0..3).await;

    let remote_id = RemoteRecordingId::new("rrec_retry");
    let queue = ctx.queue(rid.clone(), remote_id.clone());
    for id in 0..3 {
        queue.enqueue(id).await.unwrap();
    }
    let stats = queue.wait_for_completion().await;

    assert!(stats.all_uploaded());
    assert!(queue.failures().is_empty());
    assert_eq!(remote.attempts(ChunkSlot::Chunk(1)), 3);
    assert_eq!(remote.attempts(ChunkSlot::Chunk(0)), 1);

    let entry = ctx.ledger.get(&rid, ChunkSlot::Chunk(1)).await.unwrap().unwrap();
    assert_eq!(entry.status, UploadStatus::Uploaded);
    assert_eq!(entry.retry_count, 2);
    assert_eq!(
        remote.inner().get(&remote_id, 1).await.unwrap(),
        Some(chunk_bytes(1))
    );
}

#[tokio::test]
async fn test_failure_after_retry_bound() {
    let remote = remote_with_delay(0);
    remote.fail(ChunkSlot::Chunk(2), 100);
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, 0..4).await;

    let queue = ctx.queue(rid.clone(), RemoteRecordingId::new("rrec_exhausted"));
    for id in 0..4 {
        queue.enqueue(id).await.unwrap();
    }
    let stats = queue.wait_for_completion().await;

    assert_eq!(stats.uploaded, 3);
    assert_eq!(stats.failed, 1);
    assert!(stats.is_complete());
    assert!(!stats.all_uploaded());

    // One first attempt plus three retries
    assert_eq!(remote.attempts(ChunkSlot::Chunk(2)), 4);
    let failures = queue.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].slot, ChunkSlot::Chunk(2));
    assert_eq!(failures[0].kind, FailureKind::Exhausted);
    assert_eq!(failures[0].attempts, 4);

    let entry = ctx.ledger.get(&rid, ChunkSlot::Chunk(2)).await.unwrap().unwrap();
    assert_eq!(entry.status, UploadStatus::Failed);
    assert_eq!(entry.retry_count, 3);
    assert!(entry.last_error.unwrap().contains("injected failure"));
}

#[tokio::test]
async fn test_failed_slot_can_be_redriven() {
    let remote = remote_with_delay(0);
    remote.fail(ChunkSlot::Chunk(0), 100);
    let options = UploadOptions {
        max_retries: 1,
        ..test_options()
    };
    let (ctx, _guard) =
        client_context(remote.clone(), Arc::new(StaticRegistry::default()), options).await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, [0]).await;

    let queue = ctx.queue(rid.clone(), RemoteRecordingId::new("rrec_redrive"));
    queue.enqueue(0).await.unwrap();
    assert_eq!(queue.wait_for_completion().await.failed, 1);

    remote.fail(ChunkSlot::Chunk(0), 0);
    assert!(queue.enqueue(0).await.unwrap());
    let stats = queue.wait_for_completion().await;
    assert_eq!(
        stats,
        QueueStats {
            total: 1,
            uploaded: 1,
            failed: 0,
            pending: 0
        }
    );
    assert!(queue.failures().is_empty());
    let entry = ctx.ledger.get(&rid, ChunkSlot::Chunk(0)).await.unwrap().unwrap();
    assert_eq!(entry.status, UploadStatus::Uploaded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redrive_racing_failures_keeps_counts_consistent() {
    let remote = remote_with_delay(0);
    remote.fail(ChunkSlot::Chunk(0), u32::MAX);
    let options = UploadOptions {
        max_retries: 0,
        ..test_options()
    };
    let (ctx, _guard) =
        client_context(remote.clone(), Arc::new(StaticRegistry::default()), options).await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, [0]).await;

    let queue = ctx.queue(rid, RemoteRecordingId::new("rrec_race"));
    for _ in 0..200 {
        queue.enqueue(0).await.unwrap();
        let stats = queue.stats();
        assert_eq!(stats.total, 1);
        assert!(stats.failed <= 1, "{:?}", stats);
        assert!(stats.uploaded + stats.failed <= stats.total, "{:?}", stats);
        tokio::task::yield_now().await;
    }

    let stats = queue.wait_for_completion().await;
    assert_eq!(
        stats,
        QueueStats {
            total: 1,
            uploaded: 0,
            failed: 1,
            pending: 0
        }
    );
    assert_eq!(queue.failures().len(), 1);
}

#[tokio::test]
async fn test_staged_unit_uploads_without_local_copy() {
    let remote = remote_with_delay(0);
    remote.fail(ChunkSlot::Chunk(4), 100);
    let options = UploadOptions {
        max_retries: 1,
        ..test_options()
    };
    let (ctx, _guard) =
        client_context(remote.clone(), Arc::new(StaticRegistry::default()), options).await;
    let rid = RecordingId::generate();
    let remote_id = RemoteRecordingId::new("rrec_staged");

    let queue = ctx.queue(rid.clone(), remote_id.clone());
    assert!(queue
        .enqueue_staged(ChunkSlot::Chunk(4), chunk_bytes(4))
        .await
        .unwrap());
    assert_eq!(queue.wait_for_completion().await.failed, 1);
    // Bytes are kept in memory while the unit is unacknowledged
    assert_eq!(queue.staged_slots(), vec![ChunkSlot::Chunk(4)]);

    remote.fail(ChunkSlot::Chunk(4), 0);
    assert!(queue.enqueue(4).await.unwrap());
    let stats = queue.wait_for_completion().await;
    assert!(stats.all_uploaded(), "{:?}", stats);
    assert!(queue.staged_slots().is_empty());
    assert_eq!(
        remote.get(&remote_id, 4).await.unwrap(),
        Some(chunk_bytes(4))
    );
    assert!(ctx.local.get(&rid, 4).await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_enqueue_is_ignored() {
    let remote = remote_with_delay(30);
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, [0]).await;

    let queue = ctx.queue(rid, RemoteRecordingId::new("rrec_dup"));
    assert!(queue.enqueue(0).await.unwrap());
    assert!(!queue.enqueue(0).await.unwrap());
    queue.wait_for_completion().await;
    assert!(!queue.enqueue(0).await.unwrap());

    assert_eq!(queue.stats().total, 1);
    assert_eq!(remote.attempts(ChunkSlot::Chunk(0)), 1);
}

#[tokio::test]
async fn test_any_enqueue_order_converges() {
    let remote = remote_with_delay(2);
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, true, 0..10).await;

    let remote_id = RemoteRecordingId::new("rrec_perm");
    let queue = ctx.queue(rid.clone(), remote_id.clone());
    for id in [7, 2, 9, 0, 5, 3, 8, 1, 6, 4] {
        queue.enqueue(id).await.unwrap();
    }
    queue.enqueue_init().await.unwrap();
    let stats = queue.wait_for_completion().await;

    assert_eq!(stats.total, 11);
    assert!(stats.all_uploaded());
    assert_eq!(
        remote.list_chunk_ids(&remote_id).await.unwrap(),
        (0..10).collect::<Vec<u64>>()
    );
    for id in 0..10 {
        assert_eq!(remote.get(&remote_id, id).await.unwrap(), Some(chunk_bytes(id)));
    }

    let entries = ctx.ledger.list(&rid).await.unwrap();
    assert_eq!(entries.len(), 11);
    assert_eq!(entries[0].slot, ChunkSlot::Init);
    assert!(entries.iter().all(|e| e.status == UploadStatus::Uploaded));
}

#[tokio::test]
async fn test_init_upload_marks_mapping() {
    let remote = remote_with_delay(0);
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;
    let rid = RecordingId::generate();
    let remote_id = RemoteRecordingId::new("rrec_init");
    seed_local(&ctx, &rid, true, 0..0).await;
    ctx.mappings.create(&rid, &remote_id).await.unwrap();

    let queue = ctx.queue(rid.clone(), remote_id.clone());
    queue.enqueue_init().await.unwrap();
    assert!(queue.wait_for_completion().await.all_uploaded());

    let mapping = ctx.mappings.get(&rid).await.unwrap().unwrap();
    assert!(mapping.init_segment_uploaded);
    assert_eq!(
        remote.get_init(&remote_id).await.unwrap(),
        Some(b"init-segment".to_vec())
    );
}

#[tokio::test]
async fn test_remote_gone_is_not_retried() {
    let remote = remote_with_delay(0);
    remote.set_gone();
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, [0]).await;

    let queue = ctx.queue(rid, RemoteRecordingId::new("rrec_gone"));
    queue.enqueue(0).await.unwrap();
    let stats = queue.wait_for_completion().await;

    assert_eq!(stats.failed, 1);
    assert!(queue.remote_gone());
    assert_eq!(remote.attempts(ChunkSlot::Chunk(0)), 1);
    assert_eq!(queue.failures()[0].kind, FailureKind::RemoteGone);
}

#[tokio::test]
async fn test_remote_conflict_is_rejected() {
    let remote = remote_with_delay(0);
    let remote_id = RemoteRecordingId::new("rrec_conflict");
    remote.inner().put(&remote_id, 0, b"someone else").await.unwrap();
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, [0]).await;

    let queue = ctx.queue(rid.clone(), remote_id.clone());
    queue.enqueue(0).await.unwrap();
    queue.wait_for_completion().await;

    let failures = queue.failures();
    assert_eq!(failures[0].kind, FailureKind::Rejected);
    assert_eq!(failures[0].attempts, 1);
    assert_eq!(
        remote.get(&remote_id, 0).await.unwrap(),
        Some(b"someone else".to_vec())
    );
    let entry = ctx.ledger.get(&rid, ChunkSlot::Chunk(0)).await.unwrap().unwrap();
    assert_eq!(entry.status, UploadStatus::Failed);
}

#[tokio::test]
async fn test_missing_local_chunk_fails_without_retry() {
    let remote = remote_with_delay(0);
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;

    let queue = ctx.queue(RecordingId::generate(), RemoteRecordingId::new("rrec_nolocal"));
    queue.enqueue(3).await.unwrap();
    queue.wait_for_completion().await;

    let failures = queue.failures();
    assert_eq!(failures[0].kind, FailureKind::Rejected);
    assert_eq!(remote.attempts(ChunkSlot::Chunk(3)), 0);
}

#[tokio::test]
async fn test_closed_queue_rejects_work() {
    let remote = remote_with_delay(0);
    let (ctx, _guard) = client_context(
        remote.clone(),
        Arc::new(StaticRegistry::default()),
        test_options(),
    )
    .await;
    let rid = RecordingId::generate();
    seed_local(&ctx, &rid, false, [0]).await;

    let queue = ctx.queue(rid, RemoteRecordingId::new("rrec_closed"));
    queue.close();
    assert!(queue.is_closed());
    assert!(queue.enqueue(0).await.is_err());
    assert_eq!(queue.wait_for_completion().await, QueueStats::default());
}
