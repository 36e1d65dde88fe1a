//! Catalog records: resources, packages and resource identifiers.
//!
//! # Responsibility
//! - Define the read-only view of the host catalog consumed by core.
//! - Provide the sharded path/key layout derived from resource ids.
//!
//! # Invariants
//! - `ResourceId` always holds a canonical lowercase hyphenated UUID, so
//!   every id is 36 characters long and can be sharded as 3/3/30.
//! - Core never mutates catalog records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Mime types recognized as RT-DC datasets.
pub const DC_MIME_TYPES: &[&str] = &["RT-DC", "application/rtdc", "application/x-rtdc"];

/// Returns whether `mimetype` denotes an RT-DC dataset.
pub fn is_dc_mime_type(mimetype: &str) -> bool {
    DC_MIME_TYPES.contains(&mimetype)
}

/// Stable resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    /// Parses and canonicalizes a resource id.
    pub fn parse(value: &str) -> Result<Self, ResourceIdError> {
        let trimmed = value.trim();
        let uuid = Uuid::parse_str(trimmed)
            .map_err(|_| ResourceIdError::Invalid(trimmed.to_string()))?;
        Ok(Self(uuid.hyphenated().to_string()))
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Splits the id into the three storage shards (3 / 3 / remainder).
    pub fn shards(&self) -> (&str, &str, &str) {
        (&self.0[..3], &self.0[3..6], &self.0[6..])
    }

    /// Returns the shards joined with `/`.
    pub fn shard_path(&self) -> String {
        let (first, second, rest) = self.shards();
        format!("{first}/{second}/{rest}")
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = ResourceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.0
    }
}

/// Resource id parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceIdError {
    Invalid(String),
}

impl Display for ResourceIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(value) => write!(f, "invalid resource id `{value}`"),
        }
    }
}

impl Error for ResourceIdError {}

/// One uploaded file within a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub package_id: String,
    pub name: String,
    #[serde(default)]
    pub mimetype: Option<String>,
    /// `upload` for files held by the storage backend.
    #[serde(default)]
    pub url_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl Resource {
    /// Creates an uploaded resource record.
    pub fn upload(
        id: ResourceId,
        package_id: impl Into<String>,
        name: impl Into<String>,
        mimetype: impl Into<String>,
    ) -> Self {
        Self {
            id,
            package_id: package_id.into(),
            name: name.into(),
            mimetype: Some(mimetype.into()),
            url_type: Some("upload".to_string()),
            url: None,
        }
    }

    /// Returns whether this resource carries a recognized RT-DC mime type.
    pub fn is_dc_resource(&self) -> bool {
        self.mimetype.as_deref().is_some_and(is_dc_mime_type)
    }

    pub fn is_upload(&self) -> bool {
        self.url_type.as_deref() == Some("upload")
    }
}

/// A dataset (package) grouping resources under one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    pub organization_id: String,
    #[serde(default)]
    pub private: bool,
    pub metadata_modified: DateTime<Utc>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[cfg(test)]
mod tests {
    use super::{is_dc_mime_type, ResourceId};

    #[test]
    fn resource_id_is_canonicalized_and_sharded() {
        let id = ResourceId::parse(" 8FF3A5C1-4D6E-4B2A-9C1D-2E3F4A5B6C7D ").expect("valid uuid");
        assert_eq!(id.as_str(), "8ff3a5c1-4d6e-4b2a-9c1d-2e3f4a5b6c7d");
        assert_eq!(id.shards(), ("8ff", "3a5", "c1-4d6e-4b2a-9c1d-2e3f4a5b6c7d"));
        assert_eq!(id.shard_path(), "8ff/3a5/c1-4d6e-4b2a-9c1d-2e3f4a5b6c7d");
    }

    #[test]
    fn resource_id_rejects_non_uuid_values() {
        assert!(ResourceId::parse("../../etc/passwd").is_err());
        assert!(ResourceId::parse("").is_err());
    }

    #[test]
    fn recognizes_dc_mime_types() {
        assert!(is_dc_mime_type("RT-DC"));
        assert!(!is_dc_mime_type("text/csv"));
    }
}
