//! Versioned data-access API over assembled datasets.
//!
//! # Responsibility
//! - Validate requests in a fixed order: query, id, version, access,
//!   mime type.
//! - Answer `valid`, `metadata`, `feature`, `feature_list`, `logs`, `size`,
//!   `basins`, `tables`, `trace` and `trace_list` queries as JSON.
//!
//! # Invariants
//! - Validation failures never open a dataset view.
//! - Version 2 never serves feature data; clients are sent to basins.
//! - Validation messages name the offending parameter.

use super::access::AccessPolicy;
use super::assembler::{AssemblyError, DatasetAssembler};
use crate::cache::MemoCache;
use crate::dataset::{DatasetError, RtdcDataset, TableData};
use crate::model::feature::{feature_exists, scalar_feature_exists};
use crate::model::resource::{is_dc_mime_type, ResourceId};
use crate::repo::{CatalogError, ResourceCatalog};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

const TRACE_FEATURE: &str = "trace";

/// Query API errors.
#[derive(Debug)]
pub enum QueryError {
    /// Malformed or missing request parameter; user-visible.
    Validation(String),
    AccessDenied(String),
    /// The dataset contains a forbidden external link.
    Forbidden(String),
    Unavailable(String),
    Internal(String),
}

impl QueryError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl Display for QueryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "{message}"),
            Self::AccessDenied(message) => write!(f, "access denied: {message}"),
            Self::Forbidden(message) => write!(f, "forbidden: {message}"),
            Self::Unavailable(message) => write!(f, "unavailable: {message}"),
            Self::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl Error for QueryError {}

impl From<AssemblyError> for QueryError {
    fn from(value: AssemblyError) -> Self {
        match value {
            AssemblyError::ForbiddenExternalLink { .. } => Self::Forbidden(value.to_string()),
            AssemblyError::Unavailable(_) | AssemblyError::UnknownResource(_) => {
                Self::Unavailable(value.to_string())
            }
            AssemblyError::Dataset(err) => err.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<DatasetError> for QueryError {
    fn from(value: DatasetError) -> Self {
        match value {
            DatasetError::ForbiddenExternalLink { .. } => Self::Forbidden(value.to_string()),
            DatasetError::EventOutOfRange { .. } => Self::Validation(value.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CatalogError> for QueryError {
    fn from(value: CatalogError) -> Self {
        Self::Internal(value.to_string())
    }
}

/// Event index as sent by clients: a number or a numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EventIndex {
    Number(u64),
    Text(String),
}

impl EventIndex {
    fn resolve(&self) -> Result<usize, QueryError> {
        let parsed = match self {
            Self::Number(value) => usize::try_from(*value).ok(),
            Self::Text(value) => value.trim().parse().ok(),
        };
        parsed.ok_or_else(|| {
            QueryError::validation(format!("Invalid 'event' parameter '{}'!", self.as_text()))
        })
    }

    fn as_text(&self) -> String {
        match self {
            Self::Number(value) => value.to_string(),
            Self::Text(value) => value.clone(),
        }
    }
}

impl From<usize> for EventIndex {
    fn from(value: usize) -> Self {
        Self::Number(value as u64)
    }
}

/// One request to the data-access API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueryRequest {
    pub id: Option<String>,
    pub query: Option<String>,
    /// `"1"` (default) or `"2"`.
    pub version: Option<String>,
    pub feature: Option<String>,
    pub event: Option<EventIndex>,
    pub trace: Option<String>,
}

impl QueryRequest {
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<EventIndex>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Query {
    Valid,
    Metadata,
    Feature,
    FeatureList,
    Logs,
    Size,
    Basins,
    Tables,
    Trace,
    TraceList,
}

impl Query {
    fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "valid" => Self::Valid,
            "metadata" => Self::Metadata,
            "feature" => Self::Feature,
            "feature_list" => Self::FeatureList,
            "logs" => Self::Logs,
            "size" => Self::Size,
            "basins" => Self::Basins,
            "tables" => Self::Tables,
            "trace" => Self::Trace,
            "trace_list" => Self::TraceList,
            _ => return None,
        })
    }
}

/// Dispatches data-access queries to assembled datasets.
pub struct QueryDispatcher {
    assembler: Arc<DatasetAssembler>,
    catalog: Arc<dyn ResourceCatalog>,
    dc_resources: MemoCache<String, bool>,
}

impl QueryDispatcher {
    pub fn new(
        assembler: Arc<DatasetAssembler>,
        catalog: Arc<dyn ResourceCatalog>,
        mimetype_capacity: usize,
    ) -> Self {
        Self {
            assembler,
            catalog,
            dc_resources: MemoCache::new(mimetype_capacity),
        }
    }

    pub fn assembler(&self) -> &DatasetAssembler {
        &self.assembler
    }

    /// Answers `request` on behalf of a caller vetted by `policy`.
    ///
    /// # Errors
    /// - `Validation` for missing or invalid parameters, unknown queries
    ///   and unknown or unavailable features.
    /// - `AccessDenied` when `policy` rejects the resource.
    /// - `Forbidden` when the dataset holds an external link.
    pub fn dispatch(
        &self,
        policy: &dyn AccessPolicy,
        request: &QueryRequest,
    ) -> Result<Value, QueryError> {
        let query = request
            .query
            .as_deref()
            .ok_or_else(|| QueryError::validation("Please specify 'query' parameter!"))?;
        let id = request
            .id
            .as_deref()
            .ok_or_else(|| QueryError::validation("Please specify 'id' parameter!"))?;
        let version_2 = match request.version.as_deref().unwrap_or("1") {
            "1" => false,
            "2" => true,
            _ => return Err(QueryError::validation("Please specify version '1' or '2'!")),
        };
        policy
            .check_resource_access(id)
            .map_err(QueryError::AccessDenied)?;
        if !self.is_rtdc_resource(id)? {
            return Err(QueryError::validation(format!(
                "Resource ID {id} must be an .rtdc dataset!"
            )));
        }
        let query_kind = Query::parse(query)
            .ok_or_else(|| QueryError::validation(format!("Invalid query parameter '{query}'!")))?;
        let resource_id = ResourceId::parse(id)
            .map_err(|_| QueryError::validation(format!("Invalid 'id' parameter '{id}'!")))?;
        debug!(
            "event=dcserv module=query status=start query={} version={} resource_id={}",
            query,
            if version_2 { 2 } else { 1 },
            resource_id
        );

        match query_kind {
            Query::Valid => return Ok(Value::Bool(self.assembler.is_available(&resource_id)?)),
            Query::Metadata => {
                let sections = self.assembler.read_metadata(&resource_id)?;
                return to_json(&sections);
            }
            Query::Feature if version_2 => {
                return Err(QueryError::validation("Features unavailable, use basins!"))
            }
            _ => {}
        }

        let dataset = self.assembler.open(&resource_id, version_2)?;
        match query_kind {
            Query::Feature => feature_data(&dataset, request),
            Query::FeatureList if version_2 => Ok(json!([])),
            Query::FeatureList => Ok(json!(dataset.features_loaded())),
            Query::Logs => Ok(json!(collect_logs(&dataset, version_2)?)),
            Query::Size => Ok(json!(dataset.len())),
            Query::Basins => Ok(Value::Array(dataset.basin_descriptors())),
            Query::Tables => Ok(tables_json(collect_tables(&dataset, version_2)?)),
            Query::Trace => {
                warn!(
                    "event=dcserv module=query status=deprecated query=trace resource_id={}",
                    resource_id
                );
                let mut request = request.clone();
                request.feature = Some(TRACE_FEATURE.to_string());
                feature_data(&dataset, &request)
            }
            Query::TraceList => Ok(json!(dataset.trace_names()?)),
            Query::Valid | Query::Metadata => Err(QueryError::Internal(
                "query answered before opening the dataset".to_string(),
            )),
        }
    }

    /// Memoized check of the catalog mime type of `resource_id`.
    pub fn is_rtdc_resource(&self, resource_id: &str) -> Result<bool, QueryError> {
        self.dc_resources
            .get_or_try_init(resource_id.to_string(), || {
                let Ok(parsed) = ResourceId::parse(resource_id) else {
                    return Ok(false);
                };
                let resource = self.catalog.resource(&parsed)?;
                Ok(resource
                    .and_then(|resource| resource.mimetype)
                    .is_some_and(|mimetype| is_dc_mime_type(&mimetype)))
            })
    }

    /// Clears the dataset-view and mime-type caches.
    pub fn clear_caches(&self) {
        self.assembler.clear();
        self.dc_resources.clear();
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, QueryError> {
    serde_json::to_value(value).map_err(|err| QueryError::Internal(err.to_string()))
}

fn feature_data(dataset: &RtdcDataset, request: &QueryRequest) -> Result<Value, QueryError> {
    let feature = request
        .feature
        .as_deref()
        .ok_or_else(|| QueryError::validation("Please specify 'feature' parameter!"))?;

    if !dataset.features_loaded().iter().any(|name| name == feature) {
        if !feature_exists(feature) {
            return Err(QueryError::validation(format!(
                "Unknown feature name '{feature}'!"
            )));
        }
        return Err(QueryError::validation(format!(
            "Feature '{feature}' unavailable!"
        )));
    }

    if scalar_feature_exists(feature) {
        return dataset
            .feature_json(feature)?
            .ok_or_else(|| unavailable_feature(feature));
    }

    let event = request
        .event
        .as_ref()
        .ok_or_else(|| {
            QueryError::validation(format!(
                "Please specify 'event' for non-scalar feature {feature}!"
            ))
        })?
        .resolve()?;

    if feature == TRACE_FEATURE {
        let trace = request
            .trace
            .as_deref()
            .ok_or_else(|| QueryError::validation("Please specify 'trace' parameter!"))?;
        return dataset
            .trace_event_json(trace, event)?
            .ok_or_else(|| QueryError::validation(format!("Trace '{trace}' unavailable!")));
    }

    dataset
        .event_json(feature, event)?
        .ok_or_else(|| unavailable_feature(feature))
}

fn unavailable_feature(feature: &str) -> QueryError {
    QueryError::validation(format!("Feature '{feature}' unavailable!"))
}

/// Logs of `dataset`, or of its available basins for version 2.
fn collect_logs(
    dataset: &RtdcDataset,
    from_basins: bool,
) -> Result<BTreeMap<String, Vec<String>>, QueryError> {
    if !from_basins {
        return Ok(dataset.logs());
    }
    let mut logs = BTreeMap::new();
    for handle in dataset.basins() {
        if let Some(basin_dataset) = handle.dataset()? {
            logs.extend(basin_dataset.logs());
        }
    }
    Ok(logs)
}

/// Tables of `dataset`, or of its available basins for version 2.
fn collect_tables(
    dataset: &RtdcDataset,
    from_basins: bool,
) -> Result<BTreeMap<String, TableData>, QueryError> {
    if !from_basins {
        return Ok(dataset.tables());
    }
    let mut tables = BTreeMap::new();
    for handle in dataset.basins() {
        if let Some(basin_dataset) = handle.dataset()? {
            tables.extend(basin_dataset.tables());
        }
    }
    Ok(tables)
}

fn tables_json(tables: BTreeMap<String, TableData>) -> Value {
    Value::Object(
        tables
            .into_iter()
            .map(|(name, (columns, rows))| (name, json!([columns, rows])))
            .collect(),
    )
}
