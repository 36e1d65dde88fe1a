//! Basin records: declared upstream sources for features a dataset does
//! not store itself.
//!
//! # Invariants
//! - The set of basin kinds is closed; every reader handles all three.
//! - Descriptor `type` is always `remote` for the kinds defined here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

const BASIN_TYPE_REMOTE: &str = "remote";

/// Where a basin fetches its features from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasinKind {
    /// The original dataset behind the dcserv query API.
    DcorApi,
    /// Direct object-store access (credentials required for private data).
    ObjectStore,
    /// Anonymous HTTP access to the object store (public data only).
    PublicHttp,
}

impl BasinKind {
    /// Descriptor `format` value.
    pub fn format(self) -> &'static str {
        match self {
            Self::DcorApi => "dcor",
            Self::ObjectStore => "s3",
            Self::PublicHttp => "http",
        }
    }

    pub fn from_format(value: &str) -> Option<Self> {
        match value {
            "dcor" => Some(Self::DcorApi),
            "s3" => Some(Self::ObjectStore),
            "http" => Some(Self::PublicHttp),
            _ => None,
        }
    }
}

/// One basin record as embedded in a condensed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Basin {
    pub kind: BasinKind,
    pub name: String,
    pub description: String,
    /// Ordered candidate locations; the first reachable one wins.
    pub locations: Vec<String>,
    /// Features this basin claims to provide.
    pub features: Vec<String>,
    /// Whether reachability must be verified when the basin is written.
    pub verify: bool,
}

impl Basin {
    /// Basin pointing at the dcserv API of `site_url`.
    pub fn dcor_api(site_url: &str, resource_id: &str, features: Vec<String>) -> Self {
        let site_url = site_url.trim_end_matches('/');
        Self {
            kind: BasinKind::DcorApi,
            name: "DCOR dcserv".to_string(),
            description: "Original access via DCOR API".to_string(),
            locations: vec![format!("{site_url}/api/3/action/dcserv?id={resource_id}")],
            features,
            verify: false,
        }
    }

    /// Basin pointing directly at an object-store URL.
    pub fn object_store(url: impl Into<String>, features: Vec<String>) -> Self {
        Self {
            kind: BasinKind::ObjectStore,
            name: "DCOR direct S3".to_string(),
            description: "Direct access via S3".to_string(),
            locations: vec![url.into()],
            features,
            verify: false,
        }
    }

    /// Basin pointing at the public HTTP view of an object-store URL.
    pub fn public_http(url: impl Into<String>, features: Vec<String>) -> Self {
        Self {
            kind: BasinKind::PublicHttp,
            name: "DCOR public S3 via HTTP".to_string(),
            description: "Public resource access via HTTP".to_string(),
            locations: vec![url.into()],
            features,
            verify: false,
        }
    }

    /// Returns whether this basin declares `feature`.
    pub fn provides(&self, feature: &str) -> bool {
        self.features.iter().any(|name| name == feature)
    }

    /// Serializes the basin into its descriptor mapping.
    pub fn to_descriptor(&self) -> Value {
        let descriptor = BasinDescriptor {
            name: self.name.clone(),
            basin_type: BASIN_TYPE_REMOTE.to_string(),
            format: self.kind.format().to_string(),
            urls: self.locations.clone(),
            description: self.description.clone(),
            features: self.features.clone(),
            verify: self.verify,
        };
        serde_json::to_value(descriptor).unwrap_or(Value::Null)
    }

    /// Parses a basin descriptor.
    pub fn from_descriptor(value: &Value) -> Result<Self, BasinError> {
        let descriptor: BasinDescriptor = serde_json::from_value(value.clone())
            .map_err(|err| BasinError::Malformed(err.to_string()))?;
        if descriptor.basin_type != BASIN_TYPE_REMOTE {
            return Err(BasinError::UnsupportedType(descriptor.basin_type));
        }
        let kind = BasinKind::from_format(&descriptor.format)
            .ok_or_else(|| BasinError::UnsupportedFormat(descriptor.format.clone()))?;
        Ok(Self {
            kind,
            name: descriptor.name,
            description: descriptor.description,
            locations: descriptor.urls,
            features: descriptor.features,
            verify: descriptor.verify,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BasinDescriptor {
    name: String,
    #[serde(rename = "type")]
    basin_type: String,
    format: String,
    urls: Vec<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    verify: bool,
}

/// Basin descriptor parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasinError {
    Malformed(String),
    UnsupportedType(String),
    UnsupportedFormat(String),
}

impl Display for BasinError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(message) => write!(f, "malformed basin descriptor: {message}"),
            Self::UnsupportedType(value) => write!(f, "unsupported basin type `{value}`"),
            Self::UnsupportedFormat(value) => write!(f, "unsupported basin format `{value}`"),
        }
    }
}

impl Error for BasinError {}

#[cfg(test)]
mod tests {
    use super::{Basin, BasinError, BasinKind};
    use serde_json::json;

    #[test]
    fn api_basin_points_at_dcserv_endpoint() {
        let basin = Basin::dcor_api("https://dcor.example.org/", "abc", vec!["image".into()]);
        assert_eq!(
            basin.locations,
            vec!["https://dcor.example.org/api/3/action/dcserv?id=abc".to_string()]
        );
        assert!(!basin.verify);
    }

    #[test]
    fn descriptor_uses_remote_type_and_kind_format() {
        let basin = Basin::object_store("https://s3.example.org/b/resource/x", vec!["mask".into()]);
        let descriptor = basin.to_descriptor();
        assert_eq!(descriptor["type"], "remote");
        assert_eq!(descriptor["format"], "s3");
        assert_eq!(descriptor["features"], json!(["mask"]));
        assert_eq!(Basin::from_descriptor(&descriptor).expect("parse"), basin);
    }

    #[test]
    fn rejects_unknown_format() {
        let descriptor = json!({
            "name": "x",
            "type": "remote",
            "format": "ftp",
            "urls": ["ftp://host/file"],
        });
        let err = Basin::from_descriptor(&descriptor).expect_err("ftp is unsupported");
        assert_eq!(err, BasinError::UnsupportedFormat("ftp".to_string()));
        assert_eq!(BasinKind::from_format("http"), Some(BasinKind::PublicHttp));
    }
}
