//! Property graph kept in SQLite: one row per node, one row per relationship,
//! properties as JSON objects merged on upsert.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, params};
use tracing::debug;

use crate::config::StoreConfig;
use crate::extract::{EdgeRecord, NodeRecord};
use crate::gateway::{GatewayError, GraphGateway, UpsertRequest};
use crate::schema::{EntityKind, KeyValue, NodeKey, Props, RelationKind};
use crate::table::FieldValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    InMemory,
}

impl StoreLocation {
    pub fn parse(uri: &str) -> Result<Self> {
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("empty store uri"));
        }
        if matches!(trimmed, ":memory:" | "sqlite::memory:" | "sqlite://:memory:") {
            return Ok(StoreLocation::InMemory);
        }
        if let Some(path) = trimmed
            .strip_prefix("sqlite://")
            .or_else(|| trimmed.strip_prefix("file://"))
            .or_else(|| trimmed.strip_prefix("file:"))
        {
            if path.is_empty() {
                return Err(anyhow!("store uri {trimmed} has no path"));
            }
            return Ok(StoreLocation::File(PathBuf::from(path)));
        }
        if let Some((scheme, _)) = trimmed.split_once("://") {
            return Err(anyhow!(
                "unsupported store uri scheme `{scheme}` (expected sqlite://, file: or a path)"
            ));
        }
        Ok(StoreLocation::File(PathBuf::from(trimmed)))
    }
}

pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

impl SqliteGraphStore {
    pub fn connect(config: &StoreConfig) -> Result<Self> {
        if config.user.is_some() || config.password.is_some() {
            debug!("sqlite graph store ignores user/password credentials");
        }
        match StoreLocation::parse(&config.uri)? {
            StoreLocation::File(path) => Self::open(&path),
            StoreLocation::InMemory => Self::open_in_memory(),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create graph store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open graph store {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory graph store")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = self
            .conn
            .into_inner()
            .map_err(|_| anyhow!("graph store lock poisoned"))?;
        conn.close()
            .map_err(|(_, err)| err)
            .context("close graph store")
    }

    pub fn node_count(&self, kind: EntityKind) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn
            .query_row(
                "SELECT COUNT(*) FROM nodes WHERE label = ?1",
                params![kind.label()],
                |row| row.get::<_, i64>(0),
            )
            .context("count nodes")?;
        Ok(n as usize)
    }

    pub fn edge_count(&self, kind: RelationKind) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn
            .query_row(
                "SELECT COUNT(*) FROM edges WHERE rel_type = ?1",
                params![kind.rel_type()],
                |row| row.get::<_, i64>(0),
            )
            .context("count edges")?;
        Ok(n as usize)
    }

    /// Stored properties of one node, key fields included.
    pub fn node_properties(&self, kind: EntityKind, key: &NodeKey) -> Result<Option<Props>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT props FROM nodes WHERE label = ?1 AND node_key = ?2",
                params![kind.label(), key.canonical()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("load node properties")?;
        raw.map(|json| decode_props(&json)).transpose()
    }

    pub fn edge_properties(
        &self,
        kind: RelationKind,
        from: &NodeKey,
        to: &NodeKey,
    ) -> Result<Option<Props>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT props FROM edges
                 WHERE rel_type = ?1 AND from_label = ?2 AND from_key = ?3
                   AND to_label = ?4 AND to_key = ?5",
                params![
                    kind.rel_type(),
                    kind.from_kind().label(),
                    from.canonical(),
                    kind.to_kind().label(),
                    to.canonical()
                ],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("load edge properties")?;
        raw.map(|json| decode_props(&json)).transpose()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, GatewayError> {
        self.conn
            .lock()
            .map_err(|_| GatewayError::Rejected("graph store lock poisoned".to_string()))
    }
}

impl GraphGateway for SqliteGraphStore {
    fn upsert(&self, request: UpsertRequest<'_>) -> Result<usize, GatewayError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(store_error)?;
        let set_fields = request.set_fields();
        let affected = match request {
            UpsertRequest::Nodes { kind, records } => {
                upsert_nodes(&tx, kind, &request.merge_keys(), set_fields, records)?
            }
            UpsertRequest::Edges { kind, records } => {
                upsert_edges(&tx, kind, set_fields, records)?
            }
        };
        tx.commit().map_err(store_error)?;
        debug!(target_name = request.name(), affected, "upsert committed");
        Ok(affected)
    }

    fn reset(&self) -> Result<(), GatewayError> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM edges; DELETE FROM nodes;")
            .map_err(store_error)
    }
}

/// Opens the store, hands it to `f`, and closes the connection whatever `f` returns.
pub fn with_store<T>(
    config: &StoreConfig,
    f: impl FnOnce(&SqliteGraphStore) -> Result<T>,
) -> Result<T> {
    let store = SqliteGraphStore::connect(config)?;
    let out = f(&store);
    let closed = store.close();
    let value = out?;
    closed?;
    Ok(value)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS nodes (
            label TEXT NOT NULL,
            node_key TEXT NOT NULL,
            props TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (label, node_key)
        );
        CREATE TABLE IF NOT EXISTS edges (
            rel_type TEXT NOT NULL,
            from_label TEXT NOT NULL,
            from_key TEXT NOT NULL,
            to_label TEXT NOT NULL,
            to_key TEXT NOT NULL,
            props TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (rel_type, from_label, from_key, to_label, to_key)
        );
        CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_label, from_key);
        CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_label, to_key);
        "#,
    )
    .context("create graph store schema")?;
    Ok(())
}

fn upsert_nodes(
    tx: &Transaction<'_>,
    kind: EntityKind,
    merge_keys: &[&str],
    set_fields: &[&str],
    records: &[NodeRecord],
) -> Result<usize, GatewayError> {
    let mut stmt = tx
        .prepare_cached(
            r#"
            INSERT INTO nodes (label, node_key, props, updated_at)
            VALUES (?1, ?2, json_patch('{}', ?3), ?4)
            ON CONFLICT(label, node_key) DO UPDATE SET
                props = json_patch(nodes.props, ?3),
                updated_at = excluded.updated_at
            "#,
        )
        .map_err(store_error)?;
    let now = Utc::now().to_rfc3339();
    for record in records {
        let mut props = key_props(merge_keys, &record.key);
        props.extend(settable(&record.attributes, set_fields));
        stmt.execute(params![
            kind.label(),
            record.key.canonical(),
            encode_props(&props)?,
            now
        ])
        .map_err(store_error)?;
    }
    Ok(records.len())
}

fn upsert_edges(
    tx: &Transaction<'_>,
    kind: RelationKind,
    set_fields: &[&str],
    records: &[EdgeRecord],
) -> Result<usize, GatewayError> {
    let from_label = kind.from_kind().label();
    let to_label = kind.to_kind().label();
    let mut exists = tx
        .prepare_cached("SELECT 1 FROM nodes WHERE label = ?1 AND node_key = ?2")
        .map_err(store_error)?;
    let mut stmt = tx
        .prepare_cached(
            r#"
            INSERT INTO edges (rel_type, from_label, from_key, to_label, to_key, props, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, json_patch('{}', ?6), ?7)
            ON CONFLICT(rel_type, from_label, from_key, to_label, to_key) DO UPDATE SET
                props = json_patch(edges.props, ?6),
                updated_at = excluded.updated_at
            "#,
        )
        .map_err(store_error)?;
    let now = Utc::now().to_rfc3339();
    for record in records {
        let from_key = record.from.canonical();
        let to_key = record.to.canonical();
        for (label, key, display) in [
            (from_label, &from_key, &record.from),
            (to_label, &to_key, &record.to),
        ] {
            if !exists.exists(params![label, key]).map_err(store_error)? {
                return Err(GatewayError::MissingEndpoint {
                    rel_type: kind.rel_type(),
                    label,
                    key: display.to_string(),
                });
            }
        }
        stmt.execute(params![
            kind.rel_type(),
            from_label,
            from_key,
            to_label,
            to_key,
            encode_props(&settable(&record.properties, set_fields))?,
            now
        ])
        .map_err(store_error)?;
    }
    Ok(records.len())
}

/// Key values stored as ordinary properties under their merge-key names.
fn key_props(merge_keys: &[&str], key: &NodeKey) -> Props {
    merge_keys
        .iter()
        .zip(&key.0)
        .map(|(field, value)| {
            let value = match value {
                KeyValue::Int(n) => FieldValue::Int(*n),
                KeyValue::Text(s) => FieldValue::Text(s.clone()),
            };
            (field.to_string(), value)
        })
        .collect()
}

/// Only the fields the request declares as writable.
fn settable(props: &Props, set_fields: &[&str]) -> Props {
    props
        .iter()
        .filter(|(name, _)| set_fields.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn encode_props(props: &Props) -> Result<String, GatewayError> {
    // serde_json writes NaN and infinities as null, which would delete the property.
    if let Some((name, value)) = props
        .iter()
        .find(|(_, v)| matches!(v, FieldValue::Float(f) if !f.is_finite()))
    {
        return Err(GatewayError::Rejected(format!(
            "property `{name}` is not a finite number: {value:?}"
        )));
    }
    serde_json::to_string(props)
        .map_err(|err| GatewayError::Rejected(format!("encode properties: {err}")))
}

fn decode_props(raw: &str) -> Result<Props> {
    serde_json::from_str(raw).context("decode stored properties")
}

fn store_error(err: rusqlite::Error) -> GatewayError {
    let transient = matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen)
    );
    if transient {
        GatewayError::Unavailable(err.to_string())
    } else {
        GatewayError::Rejected(err.to_string())
    }
}
