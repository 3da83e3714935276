use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;

use save_media_chunks::db::create_test_connection_in_temporary_file;
use save_media_chunks::events::{BroadcastPublisher, RoomEvent};
use save_media_chunks::ids::RemoteRecordingId;
use save_media_chunks::recording::{Recording, RecordingMetadata, RecordingRepository, RecordingState};
use save_media_chunks::room::{RoomRepository, RoomService, RoomState};
use save_media_chunks::SyncError;

struct Fixture {
    service: RoomService,
    recordings: RecordingRepository<RemoteRecordingId>,
    events: BroadcastPublisher,
    _guard: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let (pool, guard) = create_test_connection_in_temporary_file().await.unwrap();
    let recordings = RecordingRepository::new(pool.clone());
    let events = BroadcastPublisher::default();
    let service = RoomService::new(
        RoomRepository::new(pool),
        recordings.clone(),
        Arc::new(events.clone()),
        Duration::milliseconds(3000),
    );
    Fixture {
        service,
        recordings,
        events,
        _guard: guard,
    }
}

async fn member(f: &Fixture, room_id: &save_media_chunks::ids::RoomId) -> RemoteRecordingId {
    let mut recording = Recording::new(
        RemoteRecordingId::generate(),
        Some(room_id.clone()),
        RecordingMetadata::default(),
    );
    recording
        .transition(RecordingState::Recording, Utc::now())
        .unwrap();
    f.recordings.insert(&recording).await.unwrap();
    f.service.join(room_id, &recording.id).await.unwrap();
    recording.id
}

#[tokio::test]
async fn test_entering_recording_schedules_start_once() {
    let f = fixture().await;
    let room = f.service.create().await.unwrap();
    assert_eq!(room.state, RoomState::Idle);
    let mut rx = f.events.subscribe();

    let t = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    let view = f
        .service
        .transition_at(&room.id, &room.access_token, RoomState::Recording, t)
        .await
        .unwrap();
    let expected_start = t + Duration::milliseconds(3000);
    assert_eq!(view.state, RoomState::Recording);
    assert_eq!(view.scheduled_start_at, Some(expected_start));

    assert_eq!(
        rx.try_recv().unwrap(),
        RoomEvent::RoomStateChanged {
            room_id: room.id.clone(),
            from: RoomState::Idle,
            to: RoomState::Recording,
            scheduled_start_at: Some(expected_start),
            changed_at: t,
        }
    );
    assert_eq!(
        rx.try_recv().unwrap(),
        RoomEvent::ScheduledRecordingStart {
            room_id: room.id.clone(),
            start_at: expected_start,
        }
    );
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    // Later transitions never announce another start
    f.service
        .transition_at(
            &room.id,
            &room.access_token,
            RoomState::Finalizing,
            t + Duration::seconds(60),
        )
        .await
        .unwrap();
    let event = rx.try_recv().unwrap();
    assert_eq!(event.name(), "roomStateChanged");
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    // The persisted view keeps the schedule
    let stored = f.service.view(&room.id).await.unwrap();
    assert_eq!(stored.state, RoomState::Finalizing);
    assert_eq!(stored.scheduled_start_at, Some(expected_start));
}

#[tokio::test]
async fn test_bad_token_is_denied() {
    let f = fixture().await;
    let room = f.service.create().await.unwrap();

    let err = f
        .service
        .transition(&room.id, "tok_wrong", RoomState::Recording)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied(_)));
    assert_eq!(f.service.view(&room.id).await.unwrap().state, RoomState::Idle);

    let err = f
        .service
        .transition_by_token("tok_unknown", RoomState::Recording)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::AccessDenied(_)));
}

#[tokio::test]
async fn test_transition_by_token() {
    let f = fixture().await;
    let room = f.service.create().await.unwrap();
    let view = f
        .service
        .transition_by_token(&room.access_token, RoomState::Recording)
        .await
        .unwrap();
    assert_eq!(view.id, room.id);
    assert_eq!(view.state, RoomState::Recording);
    assert!(view.scheduled_start_at.is_some());
}

#[tokio::test]
async fn test_illegal_room_transition() {
    let f = fixture().await;
    let room = f.service.create().await.unwrap();
    let err = f
        .service
        .transition(&room.id, &room.access_token, RoomState::Finished)
        .await
        .unwrap_err();
    match err {
        SyncError::InvalidStateTransition { from, to, .. } => {
            assert_eq!(from, "idle");
            assert_eq!(to, "finished");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_join_announces_recording() {
    let f = fixture().await;
    let room = f.service.create().await.unwrap();
    let mut rx = f.events.subscribe();

    let first = member(&f, &room.id).await;
    let second = member(&f, &room.id).await;

    assert_eq!(
        rx.try_recv().unwrap(),
        RoomEvent::RecordingCreated {
            room_id: room.id.clone(),
            recording_id: first.clone(),
        }
    );
    assert_eq!(rx.try_recv().unwrap().name(), "recordingCreated");
    assert_eq!(
        f.service.view(&room.id).await.unwrap().recording_ids,
        vec![first, second]
    );
}

#[tokio::test]
async fn test_reset_waits_for_member_recordings() {
    let f = fixture().await;
    let room = f.service.create().await.unwrap();
    let token = room.access_token.clone();
    f.service
        .transition(&room.id, &token, RoomState::Recording)
        .await
        .unwrap();
    let a = member(&f, &room.id).await;
    let b = member(&f, &room.id).await;
    f.service
        .transition(&room.id, &token, RoomState::Finalizing)
        .await
        .unwrap();
    f.service
        .transition(&room.id, &token, RoomState::Finished)
        .await
        .unwrap();

    // b is still uploading
    f.recordings
        .transition(&a, RecordingState::Synced)
        .await
        .unwrap();
    f.recordings
        .transition(&b, RecordingState::Finalizing)
        .await
        .unwrap();
    let err = f
        .service
        .transition(&room.id, &token, RoomState::Idle)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
    assert_eq!(
        f.service.view(&room.id).await.unwrap().state,
        RoomState::Finished
    );

    f.recordings
        .transition(&b, RecordingState::Synced)
        .await
        .unwrap();
    let view = f
        .service
        .transition(&room.id, &token, RoomState::Idle)
        .await
        .unwrap();
    assert_eq!(view.state, RoomState::Idle);
    assert!(view.recording_ids.is_empty());
    assert_eq!(view.scheduled_start_at, None);

    // Reset only clears membership, the recordings themselves are untouched
    for id in [&a, &b] {
        let recording = f.recordings.get(id).await.unwrap();
        assert_eq!(recording.state, RecordingState::Synced);
        assert_eq!(recording.room_id, Some(room.id.clone()));
    }

    // A reset room runs a new session with fresh membership
    f.service
        .transition(&room.id, &token, RoomState::Recording)
        .await
        .unwrap();
    let c = member(&f, &room.id).await;
    assert_eq!(f.service.view(&room.id).await.unwrap().recording_ids, vec![c]);
}
