use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Schema-free record body. Domain code decides the shape per collection.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Returns the current time truncated to microseconds.
///
/// Records are persisted with microsecond precision; truncating here keeps
/// in-memory and stored timestamps comparable.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(Duration::microseconds(1)).unwrap_or(now)
}

/// The unit of storage, unique per (collection, owner, id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub collection: String,
    pub owner: String,
    pub id: String,
    pub payload: Payload,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Creates a live record with a freshly generated id.
    pub fn new(collection: impl Into<String>, owner: impl Into<String>, payload: Payload) -> Self {
        Self {
            collection: collection.into(),
            owner: owner.into(),
            id: Uuid::new_v4().to_string(),
            payload,
            updated_at: now(),
            deleted: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Creates a tombstone for a record that has no stored body.
    pub fn tombstone(
        collection: impl Into<String>,
        owner: impl Into<String>,
        id: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            collection: collection.into(),
            owner: owner.into(),
            id: id.into(),
            payload: Payload::new(),
            updated_at,
            deleted: true,
        }
    }

    /// Shallow-merges `partial` into the payload. Keys in `partial` win.
    pub fn merge_payload(&mut self, partial: &Payload) {
        for (key, value) in partial {
            self.payload.insert(key.clone(), value.clone());
        }
    }

    /// Moves `updated_at` forward to now, or one microsecond past the
    /// previous value if the clock has not advanced.
    pub fn touch(&mut self) {
        self.updated_at = next_timestamp(self.updated_at);
    }

    /// Looks up a field, including the `id` and `updated_at` pseudo-fields.
    pub fn field(&self, name: &str) -> Option<serde_json::Value> {
        match name {
            "id" => Some(serde_json::Value::String(self.id.clone())),
            "updated_at" => Some(serde_json::Value::String(timestamp_key(self.updated_at))),
            _ => self.payload.get(name).cloned(),
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)?;
        if self.deleted {
            write!(f, " (deleted)")?;
        }
        Ok(())
    }
}

/// Returns a timestamp strictly greater than `previous`.
pub fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

/// Fixed-width, lexicographically sortable timestamp string.
pub fn timestamp_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_new_record_is_live_with_generated_id() {
        let record = Record::new("tasks", "u1", payload(json!({"title": "Buy milk"})));

        assert_eq!(record.collection, "tasks");
        assert_eq!(record.owner, "u1");
        assert!(!record.deleted);
        assert!(Uuid::parse_str(&record.id).is_ok());
    }

    #[test]
    fn test_merge_payload_overwrites_and_keeps() {
        let mut record = Record::new("tasks", "u1", payload(json!({"title": "a", "done": false})));
        record.merge_payload(&payload(json!({"done": true, "priority": 2})));

        assert_eq!(record.payload["title"], json!("a"));
        assert_eq!(record.payload["done"], json!(true));
        assert_eq!(record.payload["priority"], json!(2));
    }

    #[test]
    fn test_touch_is_strictly_increasing() {
        let future = now() + Duration::seconds(60);
        let mut record = Record::new("tasks", "u1", Payload::new()).with_updated_at(future);
        record.touch();
        assert!(record.updated_at > future);
    }

    #[test]
    fn test_pseudo_fields() {
        let record = Record::new("notes", "u1", Payload::new()).with_id("n1");
        assert_eq!(record.field("id"), Some(json!("n1")));
        assert!(record.field("updated_at").is_some());
        assert_eq!(record.field("missing"), None);
    }

    #[test]
    fn test_timestamp_key_sorts_like_time() {
        let a = now();
        let b = a + Duration::microseconds(5);
        assert!(timestamp_key(a) < timestamp_key(b));
    }
}
