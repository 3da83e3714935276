//! Room events pushed to participants.
//!
//! Delivery is best-effort: a participant that misses an event converges by
//! polling `GET /rooms/{id}`.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::{RemoteRecordingId, RoomId};
use crate::room::RoomState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RoomEvent {
    /// Sent on every room transition
    RoomStateChanged {
        room_id: RoomId,
        from: RoomState,
        to: RoomState,
        scheduled_start_at: Option<DateTime<Utc>>,
        changed_at: DateTime<Utc>,
    },
    /// Sent once when the room enters `recording`
    ScheduledRecordingStart {
        room_id: RoomId,
        start_at: DateTime<Utc>,
    },
    RecordingCreated {
        room_id: RoomId,
        recording_id: RemoteRecordingId,
    },
}

impl RoomEvent {
    pub fn room_id(&self) -> &RoomId {
        match self {
            RoomEvent::RoomStateChanged { room_id, .. }
            | RoomEvent::ScheduledRecordingStart { room_id, .. }
            | RoomEvent::RecordingCreated { room_id, .. } => room_id,
        }
    }

    /// SSE event name, same as the JSON `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            RoomEvent::RoomStateChanged { .. } => "roomStateChanged",
            RoomEvent::ScheduledRecordingStart { .. } => "scheduledRecordingStart",
            RoomEvent::RecordingCreated { .. } => "recordingCreated",
        }
    }
}

/// Sink for room events, chosen once when the service is built
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: RoomEvent);
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: RoomEvent) {}
}

/// Fans events out to every live subscriber
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<RoomEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: RoomEvent) {
        // Err only means nobody is listening right now.
        if self.sender.send(event.clone()).is_err() {
            debug!("[Events] no subscribers for {} in room {}", event.name(), event.room_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = RoomEvent::RecordingCreated {
            room_id: RoomId::new("room_1"),
            recording_id: RemoteRecordingId::new("rrec_1"),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "recordingCreated");
        assert_eq!(json["room_id"], "room_1");
        assert_eq!(json["recording_id"], "rrec_1");
        assert_eq!(event.name(), "recordingCreated");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers_only_after_subscribe() {
        let publisher = BroadcastPublisher::new(8);
        publisher.publish(RoomEvent::RecordingCreated {
            room_id: RoomId::new("room_1"),
            recording_id: RemoteRecordingId::new("rrec_0"),
        });

        let mut rx = publisher.subscribe();
        let event = RoomEvent::RecordingCreated {
            room_id: RoomId::new("room_1"),
            recording_id: RemoteRecordingId::new("rrec_1"),
        };
        publisher.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
        assert!(rx.try_recv().is_err());
    }
}
