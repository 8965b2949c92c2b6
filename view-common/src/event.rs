//! # Event
//!
//! The view event carried on the queue, and its wire payload.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kinds of content whose views are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Series,
    Chapter,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::Series, EntityType::Chapter];

    /// Singular name, as used in the queue payload and per-entity keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Series => "series",
            EntityType::Chapter => "chapter",
        }
    }

    /// Plural name, as used for the per-type dirty set.
    pub fn plural(&self) -> &'static str {
        match self {
            EntityType::Series => "series",
            EntityType::Chapter => "chapters",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = EventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "series" => Ok(EntityType::Series),
            "chapter" => Ok(EntityType::Chapter),
            invalid => Err(EventParseError::InvalidEntityType(invalid.to_owned())),
        }
    }
}

/// Enumeration of the ways a queued payload can fail to be a valid `ViewEvent`.
/// These are permanent: re-delivering the same payload can never succeed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventParseError {
    #[error("{0} is not a valid entity type")]
    InvalidEntityType(String),
    #[error("view event payload could not be deserialized: {0}")]
    InvalidPayload(String),
    #[error("view event has an empty entity id")]
    MissingEntityId,
    #[error("view event has an empty fingerprint")]
    MissingFingerprint,
    #[error("{0} is not a valid millisecond timestamp")]
    InvalidTimestamp(i64),
}

/// The JSON payload stored in a queue job's `parameters` column.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ViewJobParameters {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
    pub fingerprint: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A single observed view of an entity by a fingerprinted viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEvent {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub fingerprint: String,
    pub observed_at: DateTime<Utc>,
}

impl ViewEvent {
    pub fn new(entity_type: EntityType, entity_id: &str, fingerprint: &str) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.to_owned(),
            fingerprint: fingerprint.to_owned(),
            observed_at: Utc::now(),
        }
    }

    pub fn to_parameters(&self) -> ViewJobParameters {
        ViewJobParameters {
            entity_type: self.entity_type.as_str().to_owned(),
            id: self.entity_id.clone(),
            fingerprint: self.fingerprint.clone(),
            timestamp: self.observed_at.timestamp_millis(),
        }
    }

    /// Parse a raw queue payload. Payloads are read as untyped JSON so that one
    /// malformed job fails on its own instead of failing the whole dequeue.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, EventParseError> {
        let parameters: ViewJobParameters = serde_json::from_value(payload.clone())
            .map_err(|e| EventParseError::InvalidPayload(e.to_string()))?;
        Self::try_from(parameters)
    }
}

impl TryFrom<ViewJobParameters> for ViewEvent {
    type Error = EventParseError;

    fn try_from(parameters: ViewJobParameters) -> Result<Self, Self::Error> {
        let entity_type = EntityType::from_str(&parameters.entity_type)?;

        if parameters.id.trim().is_empty() {
            return Err(EventParseError::MissingEntityId);
        }
        if parameters.fingerprint.trim().is_empty() {
            return Err(EventParseError::MissingFingerprint);
        }

        let observed_at = Utc
            .timestamp_millis_opt(parameters.timestamp)
            .single()
            .ok_or(EventParseError::InvalidTimestamp(parameters.timestamp))?;

        Ok(Self {
            entity_type,
            entity_id: parameters.id,
            fingerprint: parameters.fingerprint,
            observed_at,
        })
    }
}

/// Error classes recorded on a failed or retried queue job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ViewJobErrorType {
    Parse,
    Store,
    Timeout,
}

/// Error details appended to a job's `errors` column.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ViewJobError {
    pub r#type: ViewJobErrorType,
    pub message: String,
}

impl ViewJobError {
    pub fn new_parse(message: &str) -> Self {
        Self {
            r#type: ViewJobErrorType::Parse,
            message: message.to_owned(),
        }
    }

    pub fn new_store(message: &str) -> Self {
        Self {
            r#type: ViewJobErrorType::Store,
            message: message.to_owned(),
        }
    }

    pub fn new_timeout(message: &str) -> Self {
        Self {
            r#type: ViewJobErrorType::Timeout,
            message: message.to_owned(),
        }
    }
}
