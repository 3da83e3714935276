//! Identifier newtypes.
//!
//! Local and remote recording ids share a string representation but live in
//! different id spaces; keeping them as separate types makes mixing them a
//! compile error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// An id that can address rows in a recording-keyed table.
pub trait RecordingKey:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    fn as_str(&self) -> &str;
    fn from_raw(raw: String) -> Self;
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random id
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "_{}"), uuid::Uuid::new_v4().simple()))
            }

            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl RecordingKey for $name {
            fn as_str(&self) -> &str {
                &self.0
            }

            fn from_raw(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

string_id!(
    /// Client-generated recording id, assigned before any network round trip
    RecordingId,
    "rec"
);

string_id!(
    /// Id the remote side assigned when the recording was registered
    RemoteRecordingId,
    "rrec"
);

string_id!(RoomId, "room");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = RecordingId::generate();
        let b = RecordingId::generate();
        assert!(a.as_str().starts_with("rec_"));
        assert_ne!(a, b);
        assert!(RemoteRecordingId::generate().as_str().starts_with("rrec_"));
        assert!(RoomId::generate().as_str().starts_with("room_"));
    }

    #[test]
    fn test_serde_transparent() {
        let id = RemoteRecordingId::new("rrec_abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"rrec_abc\"");
        let back: RemoteRecordingId = serde_json::from_str("\"rrec_abc\"").unwrap();
        assert_eq!(back, id);
    }
}
