//! Field validation and sanitization for pushed changes
//!
//! Every entity kind has a fixed allow-list of writable fields. Unknown field
//! names are dropped without complaint; known fields with the wrong shape fail
//! the whole request with a [`ValidationError`] naming the offending path.

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{EntityType, NodeType, Operation, TaskStatus, TaskType, VectorClock};
use crate::util::{format_timestamp, normalize_text_option, parse_timestamp};

/// Maximum number of changes accepted in one push
pub const MAX_BATCH_SIZE: usize = 100;

/// Maximum length of a device identifier
pub const MAX_DEVICE_ID_LEN: usize = 100;

/// Schema failure scoped to a single field path (e.g. `changes[2].data.priority`)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    fn nested(self, prefix: &str) -> Self {
        Self {
            field: format!("{prefix}.{}", self.field),
            message: self.message,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FieldRule {
    Text { min: usize, max: usize, nullable: bool },
    OneOf(&'static [&'static str]),
    Integer { min: i64, max: i64, nullable: bool },
    Number,
    Timestamp,
    Uuid,
    Object { nullable: bool },
    TextList { max_items: usize, max_len: usize },
}

const TASK_FIELDS: &[(&str, FieldRule)] = &[
    ("title", FieldRule::Text { min: 1, max: 500, nullable: false }),
    ("content", FieldRule::Text { min: 0, max: 100_000, nullable: true }),
    ("rich_content", FieldRule::Object { nullable: true }),
    ("status", FieldRule::OneOf(TaskStatus::ALL)),
    ("priority", FieldRule::Integer { min: 1, max: 10, nullable: false }),
    ("manual_priority", FieldRule::Integer { min: 1, max: 10, nullable: true }),
    ("due_date", FieldRule::Timestamp),
    ("start_date", FieldRule::Timestamp),
    ("completed_at", FieldRule::Timestamp),
    ("tags", FieldRule::TextList { max_items: 50, max_len: 50 }),
    ("parent_id", FieldRule::Uuid),
    ("root_id", FieldRule::Uuid),
    ("position", FieldRule::Integer { min: 0, max: i64::MAX, nullable: false }),
    ("task_type", FieldRule::OneOf(TaskType::ALL)),
    ("type_metadata", FieldRule::Object { nullable: true }),
    ("node_type", FieldRule::OneOf(NodeType::ALL)),
    ("category", FieldRule::Text { min: 0, max: 100, nullable: true }),
    ("duration_minutes", FieldRule::Integer { min: 0, max: 10_080, nullable: true }),
    ("computed_priority", FieldRule::Number),
    ("updated_at", FieldRule::Timestamp),
];

const USER_FIELDS: &[(&str, FieldRule)] = &[
    ("display_name", FieldRule::Text { min: 1, max: 100, nullable: true }),
    ("preferences", FieldRule::Object { nullable: false }),
];

const fn schema(entity_type: EntityType) -> &'static [(&'static str, FieldRule)] {
    match entity_type {
        EntityType::Task => TASK_FIELDS,
        EntityType::User => USER_FIELDS,
    }
}

/// Names of the fields a device may write for an entity kind
pub fn allowed_fields(entity_type: EntityType) -> impl Iterator<Item = &'static str> {
    schema(entity_type).iter().map(|(name, _)| *name)
}

/// Keep only allow-listed fields and check each one's shape.
///
/// Returned values are normalized: text is trimmed, timestamps are rendered as
/// UTC RFC 3339 and UUIDs in lowercase hyphenated form. Error paths are
/// relative to the map (`priority`, `tags[3]`).
pub fn sanitize(
    entity_type: EntityType,
    raw: &Map<String, Value>,
) -> Result<Map<String, Value>, ValidationError> {
    let mut clean = Map::new();
    for (name, rule) in schema(entity_type) {
        if let Some(value) = raw.get(*name) {
            clean.insert((*name).to_string(), check_field(*rule, name, value)?);
        }
    }
    Ok(clean)
}

fn check_field(rule: FieldRule, name: &str, value: &Value) -> Result<Value, ValidationError> {
    let fail = |message: String| ValidationError::new(name, message);

    let nullable = match rule {
        FieldRule::Text { nullable, .. }
        | FieldRule::Integer { nullable, .. }
        | FieldRule::Object { nullable } => nullable,
        FieldRule::Number | FieldRule::Timestamp | FieldRule::Uuid => true,
        FieldRule::OneOf(_) | FieldRule::TextList { .. } => false,
    };
    if value.is_null() {
        return if nullable {
            Ok(Value::Null)
        } else {
            Err(fail("must not be null".to_string()))
        };
    }

    match rule {
        FieldRule::Text { min, max, .. } => {
            let text = value
                .as_str()
                .ok_or_else(|| fail("must be a string".to_string()))?
                .trim();
            let len = text.chars().count();
            if len < min || len > max {
                return Err(fail(format!("length must be between {min} and {max}")));
            }
            Ok(Value::String(text.to_string()))
        }
        FieldRule::OneOf(allowed) => {
            let text = value
                .as_str()
                .ok_or_else(|| fail("must be a string".to_string()))?;
            if allowed.contains(&text) {
                Ok(Value::String(text.to_string()))
            } else {
                Err(fail(format!("must be one of {}", allowed.join(", "))))
            }
        }
        FieldRule::Integer { min, max, .. } => {
            let number = value
                .as_i64()
                .ok_or_else(|| fail("must be an integer".to_string()))?;
            if number < min || number > max {
                return Err(fail(format!("must be between {min} and {max}")));
            }
            Ok(Value::from(number))
        }
        FieldRule::Number => {
            let number = value
                .as_f64()
                .filter(|number| number.is_finite())
                .ok_or_else(|| fail("must be a finite number".to_string()))?;
            Ok(Value::from(number))
        }
        FieldRule::Timestamp => {
            let parsed = value
                .as_str()
                .and_then(parse_timestamp)
                .ok_or_else(|| fail("must be an RFC 3339 timestamp".to_string()))?;
            Ok(Value::String(format_timestamp(&parsed)))
        }
        FieldRule::Uuid => {
            let parsed = value
                .as_str()
                .and_then(|text| Uuid::parse_str(text.trim()).ok())
                .ok_or_else(|| fail("must be a UUID".to_string()))?;
            Ok(Value::String(parsed.to_string()))
        }
        FieldRule::Object { .. } => {
            if value.is_object() {
                Ok(value.clone())
            } else {
                Err(fail("must be an object".to_string()))
            }
        }
        FieldRule::TextList { max_items, max_len } => {
            let items = value
                .as_array()
                .ok_or_else(|| fail("must be an array of strings".to_string()))?;
            if items.len() > max_items {
                return Err(fail(format!("must have at most {max_items} items")));
            }
            let mut clean = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let text = item
                    .as_str()
                    .map(str::trim)
                    .filter(|text| !text.is_empty() && text.chars().count() <= max_len)
                    .ok_or_else(|| {
                        ValidationError::new(
                            format!("{name}[{index}]"),
                            format!("must be a non-empty string of at most {max_len} characters"),
                        )
                    })?;
                clean.push(Value::String(text.to_string()));
            }
            Ok(Value::Array(clean))
        }
    }
}

/// A schema-valid change ready to be logged and applied
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedChange {
    pub operation: Operation,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub data: Map<String, Value>,
    pub vector_clock: VectorClock,
}

/// One slot of a validated batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItem {
    /// Passed validation and may be applied
    Accepted(ValidatedChange),
    /// Structurally valid but not applicable; reported as an item-level error
    Rejected { entity_id: Uuid, error: String },
}

impl BatchItem {
    pub const fn entity_id(&self) -> Uuid {
        match self {
            Self::Accepted(change) => change.entity_id,
            Self::Rejected { entity_id, .. } => *entity_id,
        }
    }
}

/// A whole push request after validation, in submission order
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    pub device_id: String,
    pub items: Vec<BatchItem>,
}

impl ValidatedBatch {
    pub fn accepted(&self) -> impl Iterator<Item = &ValidatedChange> {
        self.items.iter().filter_map(|item| match item {
            BatchItem::Accepted(change) => Some(change),
            BatchItem::Rejected { .. } => None,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Validate a device identifier (required, 1..=100 chars after trim)
pub fn validate_device_id(value: Option<&str>) -> Result<String, ValidationError> {
    let device_id = normalize_text_option(value)
        .ok_or_else(|| ValidationError::new("device_id", "is required"))?;
    if device_id.chars().count() > MAX_DEVICE_ID_LEN {
        return Err(ValidationError::new(
            "device_id",
            format!("must be at most {MAX_DEVICE_ID_LEN} characters"),
        ));
    }
    Ok(device_id)
}

/// Parse and validate a raw push payload.
///
/// Nothing is persisted by this step; any structural failure rejects the
/// whole request.
pub fn parse_push_request(payload: &Value) -> Result<ValidatedBatch, ValidationError> {
    let envelope = payload
        .as_object()
        .ok_or_else(|| ValidationError::new("body", "must be a JSON object"))?;

    let device_id = match envelope.get("device_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.as_str()),
        Some(_) => return Err(ValidationError::new("device_id", "must be a string")),
    };
    let device_id = validate_device_id(device_id)?;

    let changes = envelope
        .get("changes")
        .ok_or_else(|| ValidationError::new("changes", "is required"))?
        .as_array()
        .ok_or_else(|| ValidationError::new("changes", "must be an array"))?;
    if changes.len() > MAX_BATCH_SIZE {
        return Err(ValidationError::new(
            "changes",
            format!(
                "batch of {} exceeds the limit of {MAX_BATCH_SIZE} changes",
                changes.len()
            ),
        ));
    }

    let items = changes
        .iter()
        .enumerate()
        .map(|(index, change)| {
            parse_change(change).map_err(|error| error.nested(&format!("changes[{index}]")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ValidatedBatch { device_id, items })
}

fn parse_change(raw: &Value) -> Result<BatchItem, ValidationError> {
    let object = raw
        .as_object()
        .ok_or_else(|| ValidationError::new("self", "must be an object"))?;

    let operation = required_str(object, "operation")?
        .parse::<Operation>()
        .map_err(|message| ValidationError::new("operation", message))?;

    let entity_id = Uuid::parse_str(required_str(object, "entity_id")?.trim())
        .map_err(|_| ValidationError::new("entity_id", "must be a UUID"))?;

    let vector_clock = parse_vector_clock(object.get("vector_clock"))?;

    let empty = Map::new();
    let data = match (object.get("data"), operation) {
        (Some(Value::Object(map)), _) => map,
        (None | Some(Value::Null), Operation::Delete) => &empty,
        (None, _) => return Err(ValidationError::new("data", "is required")),
        (Some(_), _) => return Err(ValidationError::new("data", "must be an object")),
    };

    let entity_type = match required_str(object, "entity_type")?.parse::<EntityType>() {
        Ok(entity_type) => entity_type,
        Err(message) => return Ok(BatchItem::Rejected { entity_id, error: message }),
    };

    let data = sanitize(entity_type, data).map_err(|error| error.nested("data"))?;

    if entity_type == EntityType::User && operation != Operation::Update {
        return Ok(BatchItem::Rejected {
            entity_id,
            error: format!("operation `{operation}` is not supported for entity_type `user`"),
        });
    }

    Ok(BatchItem::Accepted(ValidatedChange {
        operation,
        entity_type,
        entity_id,
        data,
        vector_clock,
    }))
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a str, ValidationError> {
    match object.get(field) {
        Some(Value::String(text)) => Ok(text.as_str()),
        None | Some(Value::Null) => Err(ValidationError::new(field, "is required")),
        Some(_) => Err(ValidationError::new(field, "must be a string")),
    }
}

fn parse_vector_clock(raw: Option<&Value>) -> Result<VectorClock, ValidationError> {
    let map = match raw {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => {
            return Err(ValidationError::new("vector_clock", "is required"))
        }
        Some(_) => return Err(ValidationError::new("vector_clock", "must be an object")),
    };
    if map.is_empty() {
        return Err(ValidationError::new("vector_clock", "must not be empty"));
    }

    map.iter()
        .map(|(device, counter)| {
            if device.is_empty() || device.chars().count() > MAX_DEVICE_ID_LEN {
                return Err(ValidationError::new(
                    "vector_clock",
                    format!("device keys must be 1 to {MAX_DEVICE_ID_LEN} characters"),
                ));
            }
            let counter = counter.as_u64().ok_or_else(|| {
                ValidationError::new(
                    format!("vector_clock.{device}"),
                    "must be a non-negative integer",
                )
            })?;
            Ok((device.clone(), counter))
        })
        .collect()
}
