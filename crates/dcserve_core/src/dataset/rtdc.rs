//! RT-DC dataset view over a container plus its declared basins.
//!
//! # Responsibility
//! - Expose features, metadata, logs, tables and basin descriptors of a
//!   loaded container.
//! - Satisfy features the container lacks from its basins, resolving each
//!   basin lazily on first use.
//!
//! # Invariants
//! - A view is never built over a container holding external links.
//! - Local features always win over basin features of the same name.
//! - Basin resolution depth is bounded, so cyclic basin chains terminate.

use crate::container::{
    AttrValue, Attributes, Container, ContainerError, Node, BASINS_GROUP, LOGS_GROUP,
    TABLES_GROUP,
};
use crate::model::basin::Basin;
use log::warn;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

const MAX_BASIN_DEPTH: usize = 3;
const EVENT_COUNT_KEY: &str = "experiment:event count";
const TRACE_FEATURE: &str = "trace";

pub type DatasetResult<T> = Result<T, DatasetError>;

/// Metadata grouped as `section -> key -> value`.
pub type ConfigSections = BTreeMap<String, BTreeMap<String, Value>>;

/// Table content as `(column names, rows)`.
pub type TableData = (Vec<String>, Vec<Vec<f64>>);

/// Dataset view errors.
#[derive(Debug)]
pub enum DatasetError {
    /// The container references a file outside itself.
    ForbiddenExternalLink { path: String },
    InvalidBasin { path: String, message: String },
    EventOutOfRange {
        feature: String,
        event: usize,
        len: usize,
    },
    /// The named node is not an array (e.g. a group or a link).
    NotAnArray(String),
    Container(ContainerError),
}

impl Display for DatasetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForbiddenExternalLink { path } => {
                write!(f, "external link at `{path}` is not allowed")
            }
            Self::InvalidBasin { path, message } => {
                write!(f, "invalid basin at `{path}`: {message}")
            }
            Self::EventOutOfRange {
                feature,
                event,
                len,
            } => write!(
                f,
                "event {event} out of range for feature `{feature}` with {len} events"
            ),
            Self::NotAnArray(name) => write!(f, "`{name}` is not an array"),
            Self::Container(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DatasetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Container(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ContainerError> for DatasetError {
    fn from(value: ContainerError) -> Self {
        Self::Container(value)
    }
}

/// Resolves a basin record into the container it points to.
pub trait BasinResolver: Send + Sync {
    /// Returns `None` when the basin is unreachable.
    fn resolve(&self, basin: &Basin) -> Option<Container>;
}

/// One declared basin plus its lazily opened dataset.
pub struct BasinHandle {
    basin: Basin,
    resolver: Option<Arc<dyn BasinResolver>>,
    depth: usize,
    dataset: OnceCell<Option<Arc<RtdcDataset>>>,
}

impl BasinHandle {
    pub fn basin(&self) -> &Basin {
        &self.basin
    }

    /// Opens the basin on first call; `Ok(None)` means unavailable.
    pub fn dataset(&self) -> DatasetResult<Option<Arc<RtdcDataset>>> {
        self.dataset
            .get_or_try_init(|| {
                let Some(resolver) = &self.resolver else {
                    return Ok(None);
                };
                if self.depth >= MAX_BASIN_DEPTH {
                    warn!(
                        "event=basin_resolve module=dataset status=skip reason=max_depth name={}",
                        self.basin.name
                    );
                    return Ok(None);
                }
                match resolver.resolve(&self.basin) {
                    Some(container) => RtdcDataset::with_depth(
                        container,
                        Some(Arc::clone(resolver)),
                        self.depth + 1,
                    )
                    .map(|dataset| Some(Arc::new(dataset))),
                    None => Ok(None),
                }
            })
            .cloned()
    }

    /// Returns whether the basin can be opened.
    pub fn is_available(&self) -> bool {
        matches!(self.dataset(), Ok(Some(_)))
    }
}

impl Debug for BasinHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasinHandle")
            .field("basin", &self.basin)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// Read-only RT-DC dataset.
pub struct RtdcDataset {
    container: Arc<Container>,
    basins: Vec<BasinHandle>,
}

impl RtdcDataset {
    /// Builds a view over `container`; basins resolve through `resolver`.
    ///
    /// # Errors
    /// - `ForbiddenExternalLink` when any node is an external link.
    /// - `InvalidBasin` when a stored basin descriptor cannot be parsed.
    pub fn new(
        container: Container,
        resolver: Option<Arc<dyn BasinResolver>>,
    ) -> DatasetResult<Self> {
        Self::with_depth(container, resolver, 0)
    }

    fn with_depth(
        container: Container,
        resolver: Option<Arc<dyn BasinResolver>>,
        depth: usize,
    ) -> DatasetResult<Self> {
        if let Some(path) = container.external_links().into_iter().next() {
            return Err(DatasetError::ForbiddenExternalLink { path });
        }

        let mut basins = Vec::new();
        if let Some(group) = container.root().group(BASINS_GROUP) {
            for (name, node) in group.children() {
                let path = format!("{BASINS_GROUP}/{name}");
                let basin = parse_basin(&path, node)?;
                basins.push(BasinHandle {
                    basin,
                    resolver: resolver.clone(),
                    depth,
                    dataset: OnceCell::new(),
                });
            }
        }

        Ok(Self {
            container: Arc::new(container),
            basins,
        })
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        if let Some(events) = self.container.events() {
            if let Some(len) = events
                .children()
                .find_map(|(_, node)| node.as_dataset().map(|dataset| dataset.array.len()))
            {
                return len;
            }
        }
        if let Some(count) = self
            .container
            .attrs()
            .get(EVENT_COUNT_KEY)
            .and_then(AttrValue::as_f64)
        {
            return count.max(0.0) as usize;
        }
        self.basins
            .iter()
            .find_map(|handle| handle.dataset().ok().flatten())
            .map_or(0, |dataset| dataset.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metadata grouped by section.
    pub fn config(&self) -> ConfigSections {
        config_sections(self.container.attrs())
    }

    /// Features stored in this container's event group.
    pub fn local_features(&self) -> Vec<String> {
        self.container
            .events()
            .map(|events| events.keys())
            .unwrap_or_default()
    }

    /// Local features plus features obtainable from available basins.
    pub fn features_loaded(&self) -> Vec<String> {
        let mut features: BTreeSet<String> = self.local_features().into_iter().collect();
        for handle in &self.basins {
            let missing: Vec<&String> = handle
                .basin
                .features
                .iter()
                .filter(|name| !features.contains(*name))
                .collect();
            if missing.is_empty() {
                continue;
            }
            let Ok(Some(dataset)) = handle.dataset() else {
                continue;
            };
            let provided: Vec<String> = missing
                .into_iter()
                .filter(|name| dataset.contains_feature(name))
                .cloned()
                .collect();
            features.extend(provided);
        }
        features.into_iter().collect()
    }

    pub fn contains_feature(&self, name: &str) -> bool {
        matches!(self.feature_node(name), Ok(Some(_)))
    }

    /// Returns the node of feature `name`, local first, then basins.
    pub fn feature_node(&self, name: &str) -> DatasetResult<Option<Node>> {
        if let Some(node) = self.container.events().and_then(|events| events.get(name)) {
            return Ok(Some(node.clone()));
        }
        for handle in &self.basins {
            if !handle.basin.provides(name) {
                continue;
            }
            if let Some(dataset) = handle.dataset()? {
                if let Some(node) = dataset.feature_node(name)? {
                    return Ok(Some(node));
                }
            }
        }
        Ok(None)
    }

    /// Scalar feature values as floats.
    pub fn scalar_values(&self, name: &str) -> DatasetResult<Option<Vec<f64>>> {
        let Some(node) = self.feature_node(name)? else {
            return Ok(None);
        };
        let dataset = node
            .as_dataset()
            .ok_or_else(|| DatasetError::NotAnArray(name.to_string()))?;
        Ok(dataset.array.to_f64_vec())
    }

    /// Full feature data as (nested) JSON.
    pub fn feature_json(&self, name: &str) -> DatasetResult<Option<Value>> {
        let Some(node) = self.feature_node(name)? else {
            return Ok(None);
        };
        let dataset = node
            .as_dataset()
            .ok_or_else(|| DatasetError::NotAnArray(name.to_string()))?;
        Ok(Some(dataset.array.to_json()))
    }

    /// One event of a non-scalar feature as nested JSON.
    pub fn event_json(&self, name: &str, event: usize) -> DatasetResult<Option<Value>> {
        let Some(node) = self.feature_node(name)? else {
            return Ok(None);
        };
        let dataset = node
            .as_dataset()
            .ok_or_else(|| DatasetError::NotAnArray(name.to_string()))?;
        dataset
            .array
            .item_json(event)
            .map(Some)
            .ok_or_else(|| DatasetError::EventOutOfRange {
                feature: name.to_string(),
                event,
                len: dataset.array.len(),
            })
    }

    /// Sorted trace channel names; empty without a trace group.
    pub fn trace_names(&self) -> DatasetResult<Vec<String>> {
        Ok(match self.feature_node(TRACE_FEATURE)? {
            Some(Node::Group(group)) => group.keys(),
            _ => Vec::new(),
        })
    }

    /// One event of trace channel `trace` as JSON.
    pub fn trace_event_json(&self, trace: &str, event: usize) -> DatasetResult<Option<Value>> {
        let Some(Node::Group(group)) = self.feature_node(TRACE_FEATURE)? else {
            return Ok(None);
        };
        let Some(dataset) = group.dataset(trace) else {
            return Ok(None);
        };
        dataset
            .array
            .item_json(event)
            .map(Some)
            .ok_or_else(|| DatasetError::EventOutOfRange {
                feature: format!("{TRACE_FEATURE}/{trace}"),
                event,
                len: dataset.array.len(),
            })
    }

    /// Log blocks stored in this container.
    pub fn logs(&self) -> BTreeMap<String, Vec<String>> {
        let mut logs = BTreeMap::new();
        if let Some(group) = self.container.root().group(LOGS_GROUP) {
            for (name, node) in group.children() {
                if let Some(lines) = node
                    .as_dataset()
                    .and_then(|dataset| dataset.array.text_lines())
                {
                    logs.insert(name.clone(), lines.to_vec());
                }
            }
        }
        logs
    }

    /// Tables stored in this container.
    pub fn tables(&self) -> BTreeMap<String, TableData> {
        let mut tables = BTreeMap::new();
        if let Some(group) = self.container.root().group(TABLES_GROUP) {
            for (name, node) in group.children() {
                if let Some(table) = node
                    .as_dataset()
                    .and_then(|dataset| dataset.array.table_rows())
                {
                    tables.insert(name.clone(), table);
                }
            }
        }
        tables
    }

    pub fn basins(&self) -> &[BasinHandle] {
        &self.basins
    }

    /// Descriptor mappings of all basins, in storage order.
    pub fn basin_descriptors(&self) -> Vec<Value> {
        self.basins
            .iter()
            .map(|handle| handle.basin.to_descriptor())
            .collect()
    }
}

impl Debug for RtdcDataset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtdcDataset")
            .field("features", &self.local_features())
            .field("basins", &self.basins)
            .finish_non_exhaustive()
    }
}

/// Groups `section:key` attributes into sections.
pub fn config_sections(attrs: &Attributes) -> ConfigSections {
    let mut sections = ConfigSections::new();
    for (name, value) in attrs {
        let Some((section, key)) = name.split_once(':') else {
            continue;
        };
        sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_json());
    }
    sections
}

fn parse_basin(path: &str, node: &Node) -> DatasetResult<Basin> {
    let invalid = |message: String| DatasetError::InvalidBasin {
        path: path.to_string(),
        message,
    };
    let lines = node
        .as_dataset()
        .and_then(|dataset| dataset.array.text_lines())
        .ok_or_else(|| invalid("basin record is not text".to_string()))?;
    let value: Value =
        serde_json::from_str(&lines.join("\n")).map_err(|err| invalid(err.to_string()))?;
    Basin::from_descriptor(&value).map_err(|err| invalid(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{BasinResolver, DatasetError, RtdcDataset};
    use crate::container::{Array, Container, Node};
    use crate::model::basin::Basin;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedResolver {
        container: Container,
        calls: AtomicUsize,
    }

    impl BasinResolver for FixedResolver {
        fn resolve(&self, _basin: &Basin) -> Option<Container> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(self.container.clone())
        }
    }

    fn container_with_basin(features: Vec<String>) -> Container {
        let mut container = Container::new();
        container
            .insert_dataset("events/deform", Array::from_f64(vec![0.1, 0.2, 0.3]))
            .expect("deform");
        let basin = Basin::object_store("https://s3.example.org/bucket/resource/x", features);
        let descriptor = serde_json::to_string(&basin.to_descriptor()).expect("json");
        container
            .insert_dataset("basins/0000", Array::text(vec![descriptor]))
            .expect("basin");
        container
    }

    #[test]
    fn missing_features_are_served_from_basins_lazily() {
        let mut upstream = Container::new();
        upstream
            .insert_dataset("events/area_um", Array::from_f64(vec![5.0, 6.0, 7.0]))
            .expect("area_um");
        let resolver = Arc::new(FixedResolver {
            container: upstream,
            calls: AtomicUsize::new(0),
        });
        let dataset = RtdcDataset::new(
            container_with_basin(vec!["area_um".to_string()]),
            Some(resolver.clone()),
        )
        .expect("dataset");

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            dataset.scalar_values("area_um").expect("lookup"),
            Some(vec![5.0, 6.0, 7.0])
        );
        assert_eq!(dataset.features_loaded(), vec!["area_um", "deform"]);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unavailable_basin_yields_no_feature() {
        let dataset =
            RtdcDataset::new(container_with_basin(vec!["image".to_string()]), None).expect("ok");
        assert_eq!(dataset.feature_node("image").expect("lookup"), None);
        assert_eq!(dataset.features_loaded(), vec!["deform"]);
        assert!(!dataset.basins()[0].is_available());
        assert_eq!(dataset.len(), 3);
    }

    #[test]
    fn rejects_containers_with_external_links() {
        let mut container = Container::new();
        container
            .insert_node(
                "tables/leak",
                Node::ExternalLink {
                    file: "/etc/shadow".to_string(),
                    target: "/".to_string(),
                },
            )
            .expect("insert");
        let err = RtdcDataset::new(container, None).expect_err("external link must fail");
        assert!(matches!(err, DatasetError::ForbiddenExternalLink { path } if path == "tables/leak"));
    }

    #[test]
    fn config_groups_attributes_by_section() {
        let mut container = Container::new();
        container.set_attr("experiment:sample", "beads");
        container.set_attr("imaging:frame rate", 2000.0);
        let dataset = RtdcDataset::new(container, None).expect("dataset");
        let config = dataset.config();
        assert_eq!(config["experiment"]["sample"], json!("beads"));
        assert_eq!(config["imaging"]["frame rate"], json!(2000.0));
    }
}
