//! Hierarchical data container used for raw and condensed datasets.
//!
//! # Responsibility
//! - Model a tree of groups, typed n-dimensional datasets, attributes and
//!   links, independent of the on-disk encoding.
//! - Detect external links anywhere in a tree.
//!
//! # Invariants
//! - Dataset payloads are shared through `Arc`, so cloning a group or
//!   grafting a node into another container never copies array data.
//! - An `Array` always holds exactly `product(shape)` elements.
//! - Paths are `/`-separated and never contain empty, `.` or `..` segments.

use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

pub mod store;

pub use store::{read_attributes, read_container, write_container, ContainerWriter};

/// Event-stream group holding one node per feature.
pub const EVENTS_GROUP: &str = "events";
/// Named text blocks.
pub const LOGS_GROUP: &str = "logs";
/// Named tables with column names.
pub const TABLES_GROUP: &str = "tables";
/// Basin descriptors.
pub const BASINS_GROUP: &str = "basins";

pub type ContainerResult<T> = Result<T, ContainerError>;

/// Container model and persistence errors.
#[derive(Debug)]
pub enum ContainerError {
    Sqlite(rusqlite::Error),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    NotFound(PathBuf),
    UnsupportedFormatVersion {
        file_version: u32,
        latest_supported: u32,
    },
    InvalidPath(String),
    PathConflict(String),
    InvalidData(String),
}

impl Display for ContainerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Io { path, source } => write!(f, "i/o error at `{}`: {source}", path.display()),
            Self::NotFound(path) => write!(f, "container not found: `{}`", path.display()),
            Self::UnsupportedFormatVersion {
                file_version,
                latest_supported,
            } => write!(
                f,
                "container format version {file_version} is newer than supported {latest_supported}"
            ),
            Self::InvalidPath(path) => write!(f, "invalid container path `{path}`"),
            Self::PathConflict(path) => write!(f, "container path `{path}` is not a group"),
            Self::InvalidData(message) => write!(f, "invalid container data: {message}"),
        }
    }
}

impl Error for ContainerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for ContainerError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(value) => Value::from(*value),
            Self::Int(value) => Value::from(*value),
            Self::Float(value) => Value::from(*value),
            Self::Text(value) => Value::from(value.as_str()),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// Typed, flat element storage of an `Array`.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    F64(Vec<f64>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
    Text(Vec<String>),
    /// Row-major numeric table; `shape == [rows, columns.len()]`.
    Table {
        columns: Vec<String>,
        values: Vec<f64>,
    },
}

impl ArrayData {
    fn element_count(&self) -> usize {
        match self {
            Self::F64(values) => values.len(),
            Self::I64(values) => values.len(),
            Self::U8(values) => values.len(),
            Self::Bool(values) => values.len(),
            Self::Text(values) => values.len(),
            Self::Table { values, .. } => values.len(),
        }
    }

    fn element_json(&self, index: usize) -> Value {
        match self {
            Self::F64(values) => Value::from(values[index]),
            Self::I64(values) => Value::from(values[index]),
            Self::U8(values) => Value::from(values[index]),
            Self::Bool(values) => Value::from(values[index]),
            Self::Text(values) => Value::from(values[index].as_str()),
            Self::Table { values, .. } => Value::from(values[index]),
        }
    }

    fn element_f64(&self, index: usize) -> Option<f64> {
        match self {
            Self::F64(values) => Some(values[index]),
            Self::I64(values) => Some(values[index] as f64),
            Self::U8(values) => Some(f64::from(values[index])),
            Self::Bool(values) => Some(if values[index] { 1.0 } else { 0.0 }),
            Self::Table { values, .. } => Some(values[index]),
            Self::Text(_) => None,
        }
    }
}

/// N-dimensional array; the first axis is the event axis for features.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    shape: Vec<usize>,
    data: ArrayData,
}

impl Array {
    /// Creates an array after checking the element count against `shape`.
    pub fn new(shape: Vec<usize>, data: ArrayData) -> ContainerResult<Self> {
        let expected: usize = shape.iter().product();
        if shape.is_empty() || expected != data.element_count() {
            return Err(ContainerError::InvalidData(format!(
                "shape {shape:?} does not match {} elements",
                data.element_count()
            )));
        }
        if let ArrayData::Table { columns, .. } = &data {
            if shape.len() != 2 || shape[1] != columns.len() {
                return Err(ContainerError::InvalidData(format!(
                    "table shape {shape:?} does not match {} columns",
                    columns.len()
                )));
            }
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional float series.
    pub fn from_f64(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: ArrayData::F64(values),
        }
    }

    /// One-dimensional integer series.
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: ArrayData::I64(values),
        }
    }

    /// Text block, one element per line.
    pub fn text(lines: Vec<String>) -> Self {
        Self {
            shape: vec![lines.len()],
            data: ArrayData::Text(lines),
        }
    }

    /// Numeric table from rows of equal width.
    pub fn table(columns: Vec<String>, rows: Vec<Vec<f64>>) -> ContainerResult<Self> {
        let width = columns.len();
        if let Some(row) = rows.iter().find(|row| row.len() != width) {
            return Err(ContainerError::InvalidData(format!(
                "table row has {} values, expected {width}",
                row.len()
            )));
        }
        let shape = vec![rows.len(), width];
        let values = rows.into_iter().flatten().collect();
        Self::new(shape, ArrayData::Table { columns, values })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    /// Length of the first axis.
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements per item along the first axis.
    pub fn item_size(&self) -> usize {
        self.shape[1..].iter().product()
    }

    /// Flat numeric copy of all elements.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        (0..self.data.element_count())
            .map(|index| self.data.element_f64(index))
            .collect()
    }

    /// Item `index` along the first axis as nested JSON.
    pub fn item_json(&self, index: usize) -> Option<Value> {
        if index >= self.len() {
            return None;
        }
        let size = self.item_size();
        Some(self.nested_json(&self.shape[1..], index * size))
    }

    /// The whole array as nested JSON.
    pub fn to_json(&self) -> Value {
        self.nested_json(&self.shape, 0)
    }

    /// Table rows, for arrays holding table data.
    pub fn table_rows(&self) -> Option<(Vec<String>, Vec<Vec<f64>>)> {
        let ArrayData::Table { columns, values } = &self.data else {
            return None;
        };
        let width = columns.len().max(1);
        let rows = values.chunks(width).map(<[f64]>::to_vec).collect();
        Some((columns.clone(), rows))
    }

    /// Text lines, for arrays holding text data.
    pub fn text_lines(&self) -> Option<&[String]> {
        match &self.data {
            ArrayData::Text(lines) => Some(lines),
            _ => None,
        }
    }

    fn nested_json(&self, shape: &[usize], offset: usize) -> Value {
        match shape.split_first() {
            None => self.data.element_json(offset),
            Some((&count, rest)) => {
                let stride: usize = rest.iter().product();
                Value::Array(
                    (0..count)
                        .map(|index| self.nested_json(rest, offset + index * stride))
                        .collect(),
                )
            }
        }
    }
}

/// Dataset node: an array plus its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub attrs: Attributes,
    pub array: Array,
}

impl Dataset {
    pub fn new(array: Array) -> Self {
        Self {
            attrs: Attributes::new(),
            array,
        }
    }
}

/// One entry of a group.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Group(Group),
    Dataset(Arc<Dataset>),
    /// Link to another path inside the same container.
    SoftLink { target: String },
    /// Link resolving into another file.
    ExternalLink { file: String, target: String },
}

impl Node {
    pub fn dataset(array: Array) -> Self {
        Self::Dataset(Arc::new(Dataset::new(array)))
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Self::Group(group) => Some(group),
            _ => None,
        }
    }

    pub fn as_dataset(&self) -> Option<&Arc<Dataset>> {
        match self {
            Self::Dataset(dataset) => Some(dataset),
            _ => None,
        }
    }
}

/// Group node with ordered children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Group {
    pub attrs: Attributes,
    children: BTreeMap<String, Node>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Child names in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    pub fn children(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.children.iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.get(name).and_then(Node::as_group)
    }

    pub fn dataset(&self, name: &str) -> Option<&Arc<Dataset>> {
        self.get(name).and_then(Node::as_dataset)
    }

    /// Inserts or replaces a child, returning the previous node.
    pub fn insert(&mut self, name: impl Into<String>, node: Node) -> Option<Node> {
        self.children.insert(name.into(), node)
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.children.remove(name)
    }

    /// Returns the child group `name`, creating it when absent.
    pub fn ensure_group(&mut self, name: &str) -> ContainerResult<&mut Group> {
        let node = self
            .children
            .entry(name.to_string())
            .or_insert_with(|| Node::Group(Group::new()));
        match node {
            Node::Group(group) => Ok(group),
            _ => Err(ContainerError::PathConflict(name.to_string())),
        }
    }

    fn collect_external_links(&self, prefix: &str, found: &mut Vec<String>) {
        for (name, node) in &self.children {
            let path = join_path(prefix, name);
            match node {
                Node::Group(group) => group.collect_external_links(&path, found),
                Node::ExternalLink { .. } => found.push(path),
                Node::Dataset(_) | Node::SoftLink { .. } => {}
            }
        }
    }
}

/// Root of a container tree; root attributes hold the dataset metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    root: Group,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }

    pub fn attrs(&self) -> &Attributes {
        &self.root.attrs
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.root.attrs.insert(key.into(), value.into());
    }

    /// Resolves a `/`-separated path without following links.
    pub fn node(&self, path: &str) -> Option<&Node> {
        let segments = split_path(path).ok()?;
        let (last, parents) = segments.split_last()?;
        let mut group = &self.root;
        for segment in parents {
            group = group.group(segment)?;
        }
        group.get(last)
    }

    pub fn group(&self, path: &str) -> Option<&Group> {
        self.node(path).and_then(Node::as_group)
    }

    /// The event-stream group, if present.
    pub fn events(&self) -> Option<&Group> {
        self.root.group(EVENTS_GROUP)
    }

    /// Inserts `node` at `path`, creating intermediate groups.
    pub fn insert_node(&mut self, path: &str, node: Node) -> ContainerResult<Option<Node>> {
        let segments = split_path(path)?;
        let Some((last, parents)) = segments.split_last() else {
            return Err(ContainerError::InvalidPath(path.to_string()));
        };
        let mut group = &mut self.root;
        for segment in parents {
            group = group.ensure_group(segment)?;
        }
        Ok(group.insert(*last, node))
    }

    pub fn insert_dataset(&mut self, path: &str, array: Array) -> ContainerResult<()> {
        self.insert_node(path, Node::dataset(array))?;
        Ok(())
    }

    /// Returns the paths of all external links in the tree.
    pub fn external_links(&self) -> Vec<String> {
        let mut found = Vec::new();
        self.root.collect_external_links("", &mut found);
        found
    }
}

pub(crate) fn split_path(path: &str) -> ContainerResult<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments
        .iter()
        .any(|segment| segment.is_empty() || *segment == "." || *segment == "..")
    {
        return Err(ContainerError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

pub(crate) fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
