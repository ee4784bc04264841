//! Collection registry and input validation.
//!
//! The engine itself is generic over [`Payload`], but the app knows a fixed
//! set of collections. Each one lists the fields an insert must carry, and a
//! few have a typed record implementing [`CollectionRecord`] so domain code
//! does not touch raw JSON.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Payload, Record};

/// Longest accepted collection name. Collection names become table names.
pub const MAX_COLLECTION_NAME_LEN: usize = 48;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Invalid collection name '{0}': use lowercase letters, digits and '_', starting with a letter")]
    InvalidCollection(String),

    #[error("Owner must not be empty")]
    EmptyOwner,

    #[error("Record id must not be empty")]
    EmptyId,

    #[error("Missing required field '{field}' for collection '{collection}'")]
    MissingField { collection: String, field: String },

    #[error("Field '{field}' in collection '{collection}' must not be null")]
    NullField { collection: String, field: String },

    #[error("Update for '{0}' has no fields")]
    EmptyUpdate(String),

    #[error("Payload must be a JSON object")]
    NotAnObject,

    #[error("Payload does not match {collection}: {message}")]
    Shape { collection: String, message: String },
}

/// Built-in collections of the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Goals,
    Tasks,
    Habits,
    Workouts,
    Expenses,
    Prayers,
    ShoppingItems,
    Notes,
    Trips,
}

impl Collection {
    pub const ALL: [Collection; 9] = [
        Collection::Goals,
        Collection::Tasks,
        Collection::Habits,
        Collection::Workouts,
        Collection::Expenses,
        Collection::Prayers,
        Collection::ShoppingItems,
        Collection::Notes,
        Collection::Trips,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Goals => "goals",
            Collection::Tasks => "tasks",
            Collection::Habits => "habits",
            Collection::Workouts => "workouts",
            Collection::Expenses => "expenses",
            Collection::Prayers => "prayers",
            Collection::ShoppingItems => "shopping_items",
            Collection::Notes => "notes",
            Collection::Trips => "trips",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == s)
    }

    /// Fields an insert must carry.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Collection::Goals => &["title"],
            Collection::Tasks => &["title"],
            Collection::Habits => &["name"],
            Collection::Workouts => &["name", "date"],
            Collection::Expenses => &["amount", "category"],
            Collection::Prayers => &["name", "date"],
            Collection::ShoppingItems => &["name"],
            Collection::Notes => &["title"],
            Collection::Trips => &["destination"],
        }
    }
}

/// Checks that a collection name is usable as a table suffix.
pub fn validate_collection_name(name: &str) -> Result<(), ValidationError> {
    let mut chars = name.chars();
    let valid = name.len() <= MAX_COLLECTION_NAME_LEN
        && chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidCollection(name.to_string()))
    }
}

/// Validates the scope of any request.
pub fn validate_scope(collection: &str, owner: &str) -> Result<(), ValidationError> {
    validate_collection_name(collection)?;
    if owner.trim().is_empty() {
        return Err(ValidationError::EmptyOwner);
    }
    Ok(())
}

/// Validates a full insert payload.
///
/// Unknown collections only get the scope check; built-in ones must carry
/// their required fields with non-null values.
pub fn validate_insert(collection: &str, payload: &Payload) -> Result<(), ValidationError> {
    validate_collection_name(collection)?;
    let Some(known) = Collection::parse(collection) else {
        return Ok(());
    };
    for field in known.required_fields() {
        match payload.get(*field) {
            None => {
                return Err(ValidationError::MissingField {
                    collection: collection.to_string(),
                    field: field.to_string(),
                })
            }
            Some(serde_json::Value::Null) => {
                return Err(ValidationError::NullField {
                    collection: collection.to_string(),
                    field: field.to_string(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Validates a partial update payload.
pub fn validate_update(collection: &str, partial: &Payload) -> Result<(), ValidationError> {
    validate_collection_name(collection)?;
    if partial.is_empty() {
        return Err(ValidationError::EmptyUpdate(collection.to_string()));
    }
    if let Some(known) = Collection::parse(collection) {
        for field in known.required_fields() {
            if matches!(partial.get(*field), Some(serde_json::Value::Null)) {
                return Err(ValidationError::NullField {
                    collection: collection.to_string(),
                    field: field.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Converts a JSON value into a payload, rejecting non-objects.
pub fn payload_from_value(value: serde_json::Value) -> Result<Payload, ValidationError> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(ValidationError::NotAnObject),
    }
}

/// A compile-time-known record type bound to one collection.
pub trait CollectionRecord: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn to_payload(&self) -> Result<Payload, ValidationError> {
        let value = serde_json::to_value(self).map_err(|e| ValidationError::Shape {
            collection: Self::COLLECTION.name().to_string(),
            message: e.to_string(),
        })?;
        payload_from_value(value)
    }

    fn from_payload(payload: &Payload) -> Result<Self, ValidationError> {
        serde_json::from_value(serde_json::Value::Object(payload.clone())).map_err(|e| {
            ValidationError::Shape {
                collection: Self::COLLECTION.name().to_string(),
                message: e.to_string(),
            }
        })
    }
}

/// A record paired with its decoded body.
#[derive(Debug, Clone)]
pub struct Typed<T> {
    pub id: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub value: T,
}

impl<T: CollectionRecord> Typed<T> {
    pub fn from_record(record: &Record) -> Result<Self, ValidationError> {
        Ok(Self {
            id: record.id.clone(),
            updated_at: record.updated_at,
            value: T::from_payload(&record.payload)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            done: false,
            due: None,
            goal_id: None,
            notes: None,
        }
    }

    pub fn with_due(mut self, due: NaiveDate) -> Self {
        self.due = Some(due);
        self
    }

    pub fn with_goal(mut self, goal_id: impl Into<String>) -> Self {
        self.goal_id = Some(goal_id.into());
        self
    }
}

impl CollectionRecord for Task {
    const COLLECTION: Collection = Collection::Tasks;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<NaiveDate>,
    /// Completion percentage, 0-100.
    #[serde(default)]
    pub progress: u8,
}

impl CollectionRecord for Goal {
    const COLLECTION: Collection = Collection::Goals;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Habit {
    pub name: String,
    /// e.g. "daily", "weekly"
    #[serde(default = "default_frequency")]
    pub frequency: String,
    #[serde(default)]
    pub completed_dates: Vec<NaiveDate>,
}

fn default_frequency() -> String {
    "daily".to_string()
}

impl CollectionRecord for Habit {
    const COLLECTION: Collection = Collection::Habits;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub amount: f64,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CollectionRecord for Expense {
    const COLLECTION: Collection = Collection::Expenses;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

impl CollectionRecord for Note {
    const COLLECTION: Collection = Collection::Notes;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_collection_names_roundtrip_and_are_valid() {
        for collection in Collection::ALL {
            assert_eq!(Collection::parse(collection.name()), Some(collection));
            assert!(validate_collection_name(collection.name()).is_ok());
        }
        assert_eq!(Collection::parse("meals"), None);
    }

    #[test]
    fn test_invalid_collection_names() {
        for name in ["", "Tasks", "9lives", "drop table", "tasks;--", "a-b"] {
            assert!(
                validate_collection_name(name).is_err(),
                "{} should be rejected",
                name
            );
        }
        let long = "a".repeat(MAX_COLLECTION_NAME_LEN + 1);
        assert!(validate_collection_name(&long).is_err());
    }

    #[test]
    fn test_scope_requires_owner() {
        assert_eq!(validate_scope("tasks", " "), Err(ValidationError::EmptyOwner));
        assert!(validate_scope("tasks", "u1").is_ok());
    }

    #[test]
    fn test_insert_requires_fields() {
        let err = validate_insert("tasks", &payload(json!({"done": false}))).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingField {
                collection: "tasks".into(),
                field: "title".into()
            }
        );

        let err = validate_insert("expenses", &payload(json!({"amount": 5, "category": null})))
            .unwrap_err();
        assert!(matches!(err, ValidationError::NullField { .. }));

        assert!(validate_insert("tasks", &payload(json!({"title": "Buy milk"}))).is_ok());
    }

    #[test]
    fn test_unknown_collection_accepts_any_payload() {
        assert!(validate_insert("journal", &Payload::new()).is_ok());
    }

    #[test]
    fn test_update_rules() {
        assert_eq!(
            validate_update("tasks", &Payload::new()),
            Err(ValidationError::EmptyUpdate("tasks".into()))
        );
        assert!(validate_update("tasks", &payload(json!({"title": null}))).is_err());
        assert!(validate_update("tasks", &payload(json!({"done": true}))).is_ok());
    }

    #[test]
    fn test_payload_from_value_rejects_arrays() {
        assert_eq!(
            payload_from_value(json!([1, 2])),
            Err(ValidationError::NotAnObject)
        );
    }

    #[test]
    fn test_task_payload_shape() {
        let due = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let task = Task::new("Buy milk").with_due(due);
        let payload = task.to_payload().unwrap();

        assert_eq!(payload["title"], json!("Buy milk"));
        assert_eq!(payload["due"], json!("2025-03-01"));
        assert!(!payload.contains_key("goal_id"));

        let decoded = Task::from_payload(&payload).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn test_typed_from_record_reports_shape_errors() {
        let record = Record::new("tasks", "u1", payload(json!({"title": 5})));
        let err = Typed::<Task>::from_record(&record).unwrap_err();
        assert!(matches!(err, ValidationError::Shape { .. }));
    }

    #[test]
    fn test_habit_defaults() {
        let habit = Habit::from_payload(&payload(json!({"name": "Read"}))).unwrap();
        assert_eq!(habit.frequency, "daily");
        assert!(habit.completed_dates.is_empty());
    }
}
