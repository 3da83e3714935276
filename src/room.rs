//! Room lifecycle: a shared session coordinating several guest recordings.
//!
//! ```text
//! idle -> recording -> finalizing -> finished
//!  ^____________________________________|  (reset for reuse)
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::api::{CreatedRoom, RoomView};
use crate::constants::generate_access_token;
use crate::error::{Result, SyncError};
use crate::events::{EventPublisher, RoomEvent};
use crate::ids::{RemoteRecordingId, RoomId};
use crate::queries::rooms;
use crate::recording::{RecordingRepository, RecordingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomState {
    Idle,
    Recording,
    Finalizing,
    Finished,
}

impl RoomState {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomState::Idle => "idle",
            RoomState::Recording => "recording",
            RoomState::Finalizing => "finalizing",
            RoomState::Finished => "finished",
        }
    }

    pub fn can_transition_to(self, next: RoomState) -> bool {
        use RoomState::*;
        matches!(
            (self, next),
            (Idle, Recording) | (Recording, Finalizing) | (Finalizing, Finished) | (Finished, Idle)
        )
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(RoomState::Idle),
            "recording" => Ok(RoomState::Recording),
            "finalizing" => Ok(RoomState::Finalizing),
            "finished" => Ok(RoomState::Finished),
            other => Err(SyncError::StorageAccess(format!("unknown room state '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub id: RoomId,
    pub access_token: String,
    pub state: RoomState,
    /// Join order
    pub recording_ids: Vec<RemoteRecordingId>,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An applied room transition
#[derive(Debug, Clone, PartialEq)]
pub struct RoomTransition {
    pub room_id: RoomId,
    pub from: RoomState,
    pub to: RoomState,
    pub changed_at: DateTime<Utc>,
    /// Set only when entering `recording`
    pub scheduled_start: Option<DateTime<Utc>>,
}

impl RoomTransition {
    /// Events to broadcast for this transition, in order
    pub fn events(&self) -> Vec<RoomEvent> {
        let mut events = vec![RoomEvent::RoomStateChanged {
            room_id: self.room_id.clone(),
            from: self.from,
            to: self.to,
            scheduled_start_at: self.scheduled_start,
            changed_at: self.changed_at,
        }];
        if let Some(start_at) = self.scheduled_start {
            events.push(RoomEvent::ScheduledRecordingStart {
                room_id: self.room_id.clone(),
                start_at,
            });
        }
        events
    }
}

impl Room {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: RoomId::generate(),
            access_token: generate_access_token(),
            state: RoomState::Idle,
            recording_ids: Vec::new(),
            scheduled_start_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transition at wall-clock `now`
    ///
    /// Entering `recording` schedules the shared start at `now + lead_time`.
    /// Resetting `finished -> idle` requires `members_in_flight == false` and
    /// starts a fresh membership list; member recordings are left untouched.
    pub fn transition_at(
        &mut self,
        next: RoomState,
        now: DateTime<Utc>,
        lead_time: Duration,
        members_in_flight: bool,
    ) -> Result<RoomTransition> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::invalid_transition("room", self.state, next));
        }
        if next == RoomState::Idle && members_in_flight {
            return Err(SyncError::InvalidStateTransition {
                entity: "room",
                from: self.state.to_string(),
                to: format!("{} (recordings still in flight)", next),
            });
        }

        let from = self.state;
        let scheduled_start = match next {
            RoomState::Recording => Some(now + lead_time),
            _ => None,
        };
        self.state = next;
        self.updated_at = now;
        match next {
            RoomState::Recording => self.scheduled_start_at = scheduled_start,
            RoomState::Idle => {
                self.scheduled_start_at = None;
                self.recording_ids.clear();
            }
            _ => {}
        }

        Ok(RoomTransition {
            room_id: self.id.clone(),
            from,
            to: next,
            changed_at: now,
            scheduled_start,
        })
    }

    pub fn view(&self) -> RoomView {
        RoomView {
            id: self.id.clone(),
            state: self.state,
            recording_ids: self.recording_ids.clone(),
            scheduled_start_at: self.scheduled_start_at,
        }
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[derive(Clone)]
pub struct RoomRepository {
    pool: SqlitePool,
}

impl RoomRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, room: &Room) -> Result<()> {
        let sql = rooms::insert(
            room.id.as_str(),
            &room.access_token,
            room.state.as_str(),
            room.created_at.timestamp_millis(),
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn find(&self, id: &RoomId) -> Result<Option<Room>> {
        let row = sqlx::query(&rooms::select_by_id(id.as_str()))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.load(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, id: &RoomId) -> Result<Room> {
        self.find(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("room {}", id)))
    }

    pub async fn find_by_token(&self, token: &str) -> Result<Option<Room>> {
        let row = sqlx::query(&rooms::select_by_token(token))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.load(&row).await?)),
            None => Ok(None),
        }
    }

    async fn load(&self, row: &SqliteRow) -> Result<Room> {
        let id = RoomId::new(row.try_get::<String, _>("id")?);
        let state: String = row.try_get("state")?;
        let scheduled: Option<i64> = row.try_get("scheduled_start_at_ms")?;
        let members: Vec<String> = sqlx::query_scalar(&rooms::select_members(id.as_str()))
            .fetch_all(&self.pool)
            .await?;
        Ok(Room {
            access_token: row.try_get("access_token")?,
            state: state.parse()?,
            recording_ids: members.into_iter().map(RemoteRecordingId::new).collect(),
            scheduled_start_at: scheduled.map(millis_to_datetime),
            created_at: millis_to_datetime(row.try_get("created_at_ms")?),
            updated_at: millis_to_datetime(row.try_get("updated_at_ms")?),
            id,
        })
    }

    /// Persist a transition, guarded on the state it was applied from
    pub async fn save_transition(&self, room: &Room, from: RoomState) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let sql = rooms::update_state(
            room.id.as_str(),
            from.as_str(),
            room.state.as_str(),
            room.scheduled_start_at.map(|t| t.timestamp_millis()),
            room.updated_at.timestamp_millis(),
        );
        let updated = sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
        if updated == 0 {
            return Err(SyncError::invalid_transition("room", from, room.state));
        }
        if room.state == RoomState::Idle {
            sqlx::query(&rooms::delete_members(room.id.as_str()))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_member(&self, room_id: &RoomId, recording_id: &RemoteRecordingId) -> Result<()> {
        let sql = rooms::insert_member(room_id.as_str(), recording_id.as_str());
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

/// Server-side room operations with event fan-out
#[derive(Clone)]
pub struct RoomService {
    rooms: RoomRepository,
    recordings: RecordingRepository<RemoteRecordingId>,
    publisher: Arc<dyn EventPublisher>,
    lead_time: Duration,
}

impl RoomService {
    pub fn new(
        rooms: RoomRepository,
        recordings: RecordingRepository<RemoteRecordingId>,
        publisher: Arc<dyn EventPublisher>,
        lead_time: Duration,
    ) -> Self {
        Self {
            rooms,
            recordings,
            publisher,
            lead_time,
        }
    }

    pub async fn create(&self) -> Result<CreatedRoom> {
        let room = Room::new(Utc::now());
        self.rooms.insert(&room).await?;
        info!("[Room] created {}", room.id);
        Ok(CreatedRoom {
            id: room.id,
            access_token: room.access_token,
            state: room.state,
        })
    }

    pub async fn view(&self, id: &RoomId) -> Result<RoomView> {
        Ok(self.rooms.get(id).await?.view())
    }

    /// Transition a room by id, authorized by its access token
    pub async fn transition(&self, id: &RoomId, token: &str, next: RoomState) -> Result<RoomView> {
        self.transition_at(id, token, next, Utc::now()).await
    }

    pub async fn transition_at(
        &self,
        id: &RoomId,
        token: &str,
        next: RoomState,
        now: DateTime<Utc>,
    ) -> Result<RoomView> {
        let room = self.rooms.get(id).await?;
        if room.access_token != token {
            return Err(SyncError::AccessDenied(format!("bad access token for room {}", id)));
        }
        self.apply(room, next, now).await
    }

    /// Transition the room the token belongs to
    pub async fn transition_by_token(&self, token: &str, next: RoomState) -> Result<RoomView> {
        let room = self
            .rooms
            .find_by_token(token)
            .await?
            .ok_or_else(|| SyncError::AccessDenied("unknown access token".to_string()))?;
        self.apply(room, next, Utc::now()).await
    }

    async fn apply(&self, mut room: Room, next: RoomState, now: DateTime<Utc>) -> Result<RoomView> {
        let in_flight = next == RoomState::Idle && self.members_in_flight(&room).await?;
        let from = room.state;
        let transition = room.transition_at(next, now, self.lead_time, in_flight)?;
        self.rooms.save_transition(&room, from).await?;

        info!("[Room] {} {} -> {}", room.id, transition.from, transition.to);
        for event in transition.events() {
            self.publisher.publish(event);
        }
        Ok(room.view())
    }

    async fn members_in_flight(&self, room: &Room) -> Result<bool> {
        for recording_id in &room.recording_ids {
            if let Some(recording) = self.recordings.find(recording_id).await? {
                if matches!(
                    recording.state,
                    RecordingState::Recording | RecordingState::Finalizing
                ) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Append a registered recording to the room's membership
    pub async fn join(&self, room_id: &RoomId, recording_id: &RemoteRecordingId) -> Result<()> {
        self.rooms.add_member(room_id, recording_id).await?;
        self.publisher.publish(RoomEvent::RecordingCreated {
            room_id: room_id.clone(),
            recording_id: recording_id.clone(),
        });
        Ok(())
    }

    pub async fn exists(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.rooms.find(room_id).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RoomState::*;

    fn lead() -> Duration {
        Duration::milliseconds(3000)
    }

    #[test]
    fn test_full_cycle_and_reset() {
        let t = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let mut room = Room::new(t);
        room.recording_ids.push(RemoteRecordingId::new("rrec_1"));

        let started = room.transition_at(Recording, t, lead(), false).unwrap();
        assert_eq!(started.scheduled_start, Some(t + lead()));
        assert!(room.transition_at(Finalizing, t, lead(), false).unwrap().scheduled_start.is_none());
        room.transition_at(Finished, t, lead(), false).unwrap();
        room.transition_at(Idle, t, lead(), false).unwrap();

        assert_eq!(room.state, Idle);
        assert!(room.recording_ids.is_empty());
        assert!(room.scheduled_start_at.is_none());
    }

    #[test]
    fn test_illegal_room_transitions() {
        let now = Utc::now();
        let mut room = Room::new(now);
        for next in [Idle, Finalizing, Finished] {
            assert!(room.transition_at(next, now, lead(), false).is_err());
        }
        room.transition_at(Recording, now, lead(), false).unwrap();
        assert!(room.transition_at(Idle, now, lead(), false).is_err());
        assert!(room.transition_at(Recording, now, lead(), false).is_err());
    }

    #[test]
    fn test_reset_refused_while_members_in_flight() {
        let now = Utc::now();
        let mut room = Room::new(now);
        room.state = Finished;
        let err = room.transition_at(Idle, now, lead(), true).unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { entity: "room", .. }));
        assert_eq!(room.state, Finished);
    }

    #[test]
    fn test_scheduled_start_event_only_on_recording() {
        let t = Utc.timestamp_millis_opt(10_000).unwrap();
        let mut room = Room::new(t);
        let events = room.transition_at(Recording, t, lead(), false).unwrap().events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            RoomEvent::ScheduledRecordingStart {
                room_id: room.id.clone(),
                start_at: Utc.timestamp_millis_opt(13_000).unwrap(),
            }
        );
        let events = room.transition_at(Finalizing, t, lead(), false).unwrap().events();
        assert_eq!(events.len(), 1);
    }
}
