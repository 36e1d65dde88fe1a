//! SQLite-backed persistence for containers.
//!
//! # Responsibility
//! - Write a container tree into a single file and read it back.
//! - Reopen an existing file to append nodes (basin records).
//!
//! # Invariants
//! - Format version is tracked via `PRAGMA user_version`; files written by a
//!   newer format are rejected instead of being misread.
//! - `write_container` replaces any existing file at the target path.
//! - Readers never create files; a missing path is `ContainerError::NotFound`.

use super::{
    join_path, Array, ArrayData, AttrValue, Attributes, Container, ContainerError,
    ContainerResult, Dataset, Group, Node, BASINS_GROUP,
};
use crate::model::basin::Basin;
use log::{debug, error, info};
use rusqlite::{params, Connection, OpenFlags, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: "CREATE TABLE IF NOT EXISTS nodes (
        path TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        dtype TEXT,
        shape TEXT,
        columns TEXT,
        data BLOB,
        link_file TEXT,
        link_target TEXT
    );
    CREATE TABLE IF NOT EXISTS attrs (
        path TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (path, key)
    );",
}];

const KIND_GROUP: &str = "group";
const KIND_DATASET: &str = "dataset";
const KIND_SOFT_LINK: &str = "soft_link";
const KIND_EXTERNAL_LINK: &str = "external_link";

/// Returns the latest container format version known by this binary.
pub fn latest_format_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Writes `container` to `path`, replacing any existing file.
pub fn write_container(path: impl AsRef<Path>, container: &Container) -> ContainerResult<()> {
    let path = path.as_ref();
    let started_at = Instant::now();

    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(ContainerError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let mut conn = Connection::open(path)?;
    apply_migrations(&mut conn)?;
    let tx = conn.transaction()?;
    write_attrs(&tx, "", &container.root().attrs)?;
    write_group(&tx, "", container.root())?;
    tx.commit()?;

    debug!(
        "event=container_write module=container status=ok path={} duration_ms={}",
        path.display(),
        started_at.elapsed().as_millis()
    );
    Ok(())
}

/// Reads the full container tree stored at `path`.
pub fn read_container(path: impl AsRef<Path>) -> ContainerResult<Container> {
    let path = path.as_ref();
    let started_at = Instant::now();
    let conn = open_existing(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let mut attrs_by_path = read_all_attrs(&conn)?;
    let mut container = Container::new();
    container.root_mut().attrs = attrs_by_path.remove("").unwrap_or_default();

    let mut stmt = conn.prepare(
        "SELECT path, kind, dtype, shape, columns, data, link_file, link_target
         FROM nodes
         ORDER BY path ASC;",
    )?;
    let mut rows = stmt.query([])?;
    let mut node_count = 0usize;
    while let Some(row) = rows.next()? {
        let node_path: String = row.get(0)?;
        let kind: String = row.get(1)?;
        let attrs = attrs_by_path.remove(&node_path).unwrap_or_default();
        let node = match kind.as_str() {
            KIND_GROUP => {
                let group = group_at_mut(&mut container, &node_path)?;
                group.attrs = attrs;
                node_count += 1;
                continue;
            }
            KIND_DATASET => {
                let dtype: Option<String> = row.get(2)?;
                let shape: Option<String> = row.get(3)?;
                let columns: Option<String> = row.get(4)?;
                let data: Option<Vec<u8>> = row.get(5)?;
                let array = decode_array(
                    dtype.as_deref().unwrap_or_default(),
                    shape.as_deref().unwrap_or("[]"),
                    columns.as_deref(),
                    data.unwrap_or_default(),
                )
                .map_err(|err| {
                    ContainerError::InvalidData(format!("node `{node_path}`: {err}"))
                })?;
                Node::Dataset(Arc::new(Dataset { attrs, array }))
            }
            KIND_SOFT_LINK => Node::SoftLink {
                target: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            },
            KIND_EXTERNAL_LINK => Node::ExternalLink {
                file: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                target: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            },
            other => {
                return Err(ContainerError::InvalidData(format!(
                    "unknown node kind `{other}` at `{node_path}`"
                )))
            }
        };
        container.insert_node(&node_path, node)?;
        node_count += 1;
    }

    debug!(
        "event=container_read module=container status=ok path={} nodes={} duration_ms={}",
        path.display(),
        node_count,
        started_at.elapsed().as_millis()
    );
    Ok(container)
}

/// Reads only the root attributes (dataset metadata) stored at `path`.
pub fn read_attributes(path: impl AsRef<Path>) -> ContainerResult<Attributes> {
    let conn = open_existing(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut attrs = read_all_attrs(&conn)?;
    Ok(attrs.remove("").unwrap_or_default())
}

/// Append-mode handle on an existing container file.
pub struct ContainerWriter {
    conn: Connection,
}

impl ContainerWriter {
    /// Reopens the container at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> ContainerResult<Self> {
        let conn = open_existing(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        Ok(Self { conn })
    }

    /// Stores `array` at `path`, replacing an existing dataset there.
    pub fn insert_dataset(&mut self, path: &str, array: &Array) -> ContainerResult<()> {
        let segments = super::split_path(path)?;
        if segments.is_empty() {
            return Err(ContainerError::InvalidPath(path.to_string()));
        }
        let tx = self.conn.transaction()?;
        let mut prefix = String::new();
        for segment in &segments[..segments.len() - 1] {
            prefix = join_path(&prefix, segment);
            tx.execute(
                "INSERT OR IGNORE INTO nodes (path, kind) VALUES (?1, ?2);",
                params![prefix, KIND_GROUP],
            )?;
        }
        write_dataset_row(&tx, &segments.join("/"), array)?;
        tx.commit()?;
        Ok(())
    }

    /// Appends `basin` after all previously stored basins.
    pub fn store_basin(&mut self, basin: &Basin) -> ContainerResult<()> {
        let existing: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM nodes
             WHERE path LIKE ?1 AND path NOT LIKE ?2;",
            params![format!("{BASINS_GROUP}/%"), format!("{BASINS_GROUP}/%/%")],
            |row| row.get(0),
        )?;
        let descriptor = serde_json::to_string(&basin.to_descriptor())
            .map_err(|err| ContainerError::InvalidData(err.to_string()))?;
        let path = format!("{BASINS_GROUP}/{existing:04}");
        self.insert_dataset(&path, &Array::text(vec![descriptor]))?;
        info!(
            "event=basin_store module=container status=ok path={} format={} features={}",
            path,
            basin.kind.format(),
            basin.features.len()
        );
        Ok(())
    }
}

fn open_existing(path: &Path, flags: OpenFlags) -> ContainerResult<Connection> {
    if !path.is_file() {
        return Err(ContainerError::NotFound(path.to_path_buf()));
    }
    let conn = match Connection::open_with_flags(path, flags | OpenFlags::SQLITE_OPEN_NO_MUTEX) {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=container_open module=container status=error path={} error={}",
                path.display(),
                err
            );
            return Err(err.into());
        }
    };
    check_format_version(&conn)?;
    Ok(conn)
}

fn apply_migrations(conn: &mut Connection) -> ContainerResult<()> {
    let current = current_user_version(conn)?;
    let latest = latest_format_version();
    if current > latest {
        return Err(ContainerError::UnsupportedFormatVersion {
            file_version: current,
            latest_supported: latest,
        });
    }
    if current == latest {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        tx.execute_batch(migration.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))?;
    }
    tx.commit()?;
    Ok(())
}

fn check_format_version(conn: &Connection) -> ContainerResult<()> {
    let current = current_user_version(conn)?;
    let latest = latest_format_version();
    if current > latest {
        return Err(ContainerError::UnsupportedFormatVersion {
            file_version: current,
            latest_supported: latest,
        });
    }
    if current == 0 {
        return Err(ContainerError::InvalidData(
            "file carries no container format version".to_string(),
        ));
    }
    Ok(())
}

fn current_user_version(conn: &Connection) -> ContainerResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}

fn read_all_attrs(conn: &Connection) -> ContainerResult<HashMap<String, Attributes>> {
    let mut stmt = conn.prepare("SELECT path, key, value FROM attrs;")?;
    let mut rows = stmt.query([])?;
    let mut attrs: HashMap<String, Attributes> = HashMap::new();
    while let Some(row) = rows.next()? {
        let path: String = row.get(0)?;
        let key: String = row.get(1)?;
        let raw: String = row.get(2)?;
        let value: AttrValue = serde_json::from_str(&raw).map_err(|err| {
            ContainerError::InvalidData(format!("attribute `{key}` at `{path}`: {err}"))
        })?;
        attrs.entry(path).or_default().insert(key, value);
    }
    Ok(attrs)
}

fn group_at_mut<'a>(container: &'a mut Container, path: &str) -> ContainerResult<&'a mut Group> {
    let mut group = container.root_mut();
    for segment in super::split_path(path)? {
        group = group.ensure_group(segment)?;
    }
    Ok(group)
}

fn write_attrs(tx: &Transaction<'_>, path: &str, attrs: &Attributes) -> ContainerResult<()> {
    for (key, value) in attrs {
        let encoded = serde_json::to_string(value)
            .map_err(|err| ContainerError::InvalidData(err.to_string()))?;
        tx.execute(
            "INSERT OR REPLACE INTO attrs (path, key, value) VALUES (?1, ?2, ?3);",
            params![path, key, encoded],
        )?;
    }
    Ok(())
}

fn write_group(tx: &Transaction<'_>, prefix: &str, group: &Group) -> ContainerResult<()> {
    for (name, node) in group.children() {
        let path = join_path(prefix, name);
        match node {
            Node::Group(child) => {
                tx.execute(
                    "INSERT INTO nodes (path, kind) VALUES (?1, ?2);",
                    params![path, KIND_GROUP],
                )?;
                write_attrs(tx, &path, &child.attrs)?;
                write_group(tx, &path, child)?;
            }
            Node::Dataset(dataset) => {
                write_dataset_row(tx, &path, &dataset.array)?;
                write_attrs(tx, &path, &dataset.attrs)?;
            }
            Node::SoftLink { target } => {
                tx.execute(
                    "INSERT INTO nodes (path, kind, link_target) VALUES (?1, ?2, ?3);",
                    params![path, KIND_SOFT_LINK, target],
                )?;
            }
            Node::ExternalLink { file, target } => {
                tx.execute(
                    "INSERT INTO nodes (path, kind, link_file, link_target)
                     VALUES (?1, ?2, ?3, ?4);",
                    params![path, KIND_EXTERNAL_LINK, file, target],
                )?;
            }
        }
    }
    Ok(())
}

fn write_dataset_row(tx: &Transaction<'_>, path: &str, array: &Array) -> ContainerResult<()> {
    let (dtype, columns, data) = encode_array(array)?;
    let shape = serde_json::to_string(array.shape())
        .map_err(|err| ContainerError::InvalidData(err.to_string()))?;
    tx.execute(
        "INSERT OR REPLACE INTO nodes (path, kind, dtype, shape, columns, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        params![path, KIND_DATASET, dtype, shape, columns, data],
    )?;
    Ok(())
}

fn encode_array(array: &Array) -> ContainerResult<(&'static str, Option<String>, Vec<u8>)> {
    let encoded = match array.data() {
        ArrayData::F64(values) => ("f64", None, encode_f64(values)),
        ArrayData::I64(values) => (
            "i64",
            None,
            values.iter().flat_map(|value| value.to_le_bytes()).collect(),
        ),
        ArrayData::U8(values) => ("u8", None, values.clone()),
        ArrayData::Bool(values) => ("bool", None, values.iter().map(|&v| u8::from(v)).collect()),
        ArrayData::Text(lines) => (
            "text",
            None,
            serde_json::to_vec(lines).map_err(|err| ContainerError::InvalidData(err.to_string()))?,
        ),
        ArrayData::Table { columns, values } => (
            "table",
            Some(
                serde_json::to_string(columns)
                    .map_err(|err| ContainerError::InvalidData(err.to_string()))?,
            ),
            encode_f64(values),
        ),
    };
    Ok(encoded)
}

fn encode_f64(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn decode_array(
    dtype: &str,
    shape: &str,
    columns: Option<&str>,
    data: Vec<u8>,
) -> ContainerResult<Array> {
    let shape: Vec<usize> = serde_json::from_str(shape)
        .map_err(|err| ContainerError::InvalidData(format!("shape: {err}")))?;
    let data = match dtype {
        "f64" => ArrayData::F64(decode_words(&data, f64::from_le_bytes)?),
        "i64" => ArrayData::I64(decode_words(&data, i64::from_le_bytes)?),
        "u8" => ArrayData::U8(data),
        "bool" => ArrayData::Bool(data.iter().map(|&byte| byte != 0).collect()),
        "text" => ArrayData::Text(
            serde_json::from_slice(&data)
                .map_err(|err| ContainerError::InvalidData(format!("text: {err}")))?,
        ),
        "table" => {
            let columns: Vec<String> = serde_json::from_str(columns.unwrap_or("[]"))
                .map_err(|err| ContainerError::InvalidData(format!("columns: {err}")))?;
            ArrayData::Table {
                columns,
                values: decode_words(&data, f64::from_le_bytes)?,
            }
        }
        other => {
            return Err(ContainerError::InvalidData(format!(
                "unknown dtype `{other}`"
            )))
        }
    };
    Array::new(shape, data)
}

fn decode_words<T>(data: &[u8], from_bytes: fn([u8; 8]) -> T) -> ContainerResult<Vec<T>> {
    if data.len() % 8 != 0 {
        return Err(ContainerError::InvalidData(format!(
            "payload of {} bytes is not a multiple of 8",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            from_bytes(word)
        })
        .collect())
}
