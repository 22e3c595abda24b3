//! Durable record formats and schema migrations
//!
//! Every persisted build carries a `schema_version`. Loading reads the raw
//! JSON, walks the ordered [`MIGRATIONS`] table from the stored version up to
//! [`CURRENT_SCHEMA_VERSION`], and only then deserializes into a
//! [`BuildRecord`]. Records written before versioning existed have no
//! `schema_version` field and are treated as version 1.
//!
//! | Version | Change |
//! |---------|--------|
//! | 1 | `times: [start, end]` epoch seconds, integer `results`, `blamelist` |
//! | 2 | `started_at` / `finished_at` timestamps, named `result` |
//! | 3 | `responsible_users`, explicit step `waiting` flag |

use super::{BuildRecord, BuildResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema version written by this build of the crate
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Builder descriptor schema version
pub const DESCRIPTOR_SCHEMA_VERSION: u32 = 1;

type Migration = fn(Value) -> Result<Value, String>;

/// Ordered migrations; entry `(n, f)` upgrades version `n` to `n + 1`
const MIGRATIONS: &[(u32, Migration)] = &[(1, v1_to_v2), (2, v2_to_v3)];

/// On-disk form of a build record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBuild {
    pub schema_version: u32,
    #[serde(flatten)]
    pub record: BuildRecord,
}

impl StoredBuild {
    pub fn from_record(record: &BuildRecord) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            record: record.clone(),
        }
    }

    pub fn into_record(self) -> BuildRecord {
        self.record
    }
}

/// Result of decoding a persisted build
#[derive(Debug)]
pub struct Decoded {
    pub record: BuildRecord,
    /// Version the record was stored with, if it had to be migrated
    pub migrated_from: Option<u32>,
}

/// Why a persisted build could not be decoded
#[derive(Debug)]
pub enum DecodeError {
    Malformed(String),
    Unsupported(u32),
}

/// Decode raw bytes into a current-version record
pub fn decode_build(bytes: &[u8]) -> Result<Decoded, DecodeError> {
    let mut value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let stored_version = match value.get("schema_version") {
        None => 1,
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| DecodeError::Malformed("schema_version is not an integer".into()))?,
    };

    if stored_version == 0 || stored_version > CURRENT_SCHEMA_VERSION {
        return Err(DecodeError::Unsupported(stored_version));
    }

    let mut version = stored_version;
    for (from, migrate) in MIGRATIONS {
        if *from == version {
            value = migrate(value).map_err(DecodeError::Malformed)?;
            version += 1;
        }
    }

    let stored: StoredBuild =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    Ok(Decoded {
        record: stored.into_record(),
        migrated_from: (stored_version != CURRENT_SCHEMA_VERSION).then_some(stored_version),
    })
}

/// Encode a record in the current schema
pub fn encode_build(record: &BuildRecord) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec_pretty(&StoredBuild::from_record(record))
}

fn object(value: Value) -> Result<Map<String, Value>, String> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected object, found {}", other)),
    }
}

fn epoch_to_timestamp(value: &Value) -> Result<Value, String> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Number(n) => {
            let secs = n.as_f64().ok_or("timestamp is not numeric")?;
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
            let at: DateTime<Utc> = DateTime::from_timestamp(whole, nanos.min(999_999_999))
                .ok_or_else(|| format!("timestamp {} out of range", secs))?;
            Ok(Value::String(at.to_rfc3339()))
        }
        other => Err(format!("unexpected timestamp {}", other)),
    }
}

/// Split a v1 `times` pair into `started_at` / `finished_at`
fn split_times(map: &mut Map<String, Value>) -> Result<(), String> {
    let times = map.remove("times").unwrap_or(Value::Null);
    let (start, end) = match &times {
        Value::Array(pair) => (
            pair.first().cloned().unwrap_or(Value::Null),
            pair.get(1).cloned().unwrap_or(Value::Null),
        ),
        _ => (Value::Null, Value::Null),
    };
    map.insert("started_at".into(), epoch_to_timestamp(&start)?);
    map.insert("finished_at".into(), epoch_to_timestamp(&end)?);
    Ok(())
}

fn v1_to_v2(value: Value) -> Result<Value, String> {
    let mut map = object(value)?;
    split_times(&mut map)?;

    let result = match map.remove("results") {
        None | Some(Value::Null) => Value::Null,
        Some(Value::Number(code)) => {
            let code = code
                .as_u64()
                .and_then(|c| u8::try_from(c).ok())
                .ok_or("result code out of range")?;
            let result = BuildResult::from_code(code).ok_or_else(|| format!("unknown result code {}", code))?;
            Value::String(result.to_string())
        }
        Some(other) => return Err(format!("unexpected results {}", other)),
    };
    map.insert("result".into(), result);

    if let Some(Value::Array(steps)) = map.remove("steps") {
        let steps = steps
            .into_iter()
            .map(|step| {
                let mut step = object(step)?;
                split_times(&mut step)?;
                Ok(Value::Object(step))
            })
            .collect::<Result<Vec<_>, String>>()?;
        map.insert("steps".into(), Value::Array(steps));
    } else {
        map.insert("steps".into(), Value::Array(vec![]));
    }

    map.insert("schema_version".into(), Value::from(2));
    Ok(Value::Object(map))
}

fn v2_to_v3(value: Value) -> Result<Value, String> {
    let mut map = object(value)?;
    let users = map.remove("blamelist").unwrap_or_else(|| Value::Array(vec![]));
    map.insert("responsible_users".into(), users);

    if let Some(Value::Array(steps)) = map.get_mut("steps") {
        for step in steps.iter_mut() {
            if let Value::Object(step) = step {
                step.entry("waiting").or_insert(Value::Bool(false));
            }
        }
    }

    map.insert("schema_version".into(), Value::from(3));
    Ok(Value::Object(map))
}

/// Durable projection of a builder's identity
///
/// Only these fields survive a restart; running builds, subscribers and
/// caches are rebuilt from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderDescriptor {
    pub schema_version: u32,
    pub name: String,
    pub category: Option<String>,
    pub project: Option<String>,
    pub friendly_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}
