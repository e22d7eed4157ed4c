//! SQLite-backed metadata store.
//!
//! Holds the object table, the inter-object dependency edges, the label
//! namespace, and the temp-object reservations that make blob insertion
//! crash safe. All multi-step mutations run inside `BEGIN IMMEDIATE`
//! transactions; any batch that also touches `data/` must do its file work
//! inside the same transaction.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::name::Name;
use crate::{Result, StoreError};

pub const VERSION_LATEST: i64 = 1;

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SCHEMA_INIT: &str = "
CREATE TABLE IF NOT EXISTS version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name BLOB UNIQUE NOT NULL,
    ref_count INTEGER NOT NULL,
    lease_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS object_by_name ON objects(name);
CREATE INDEX IF NOT EXISTS object_by_ref_count ON objects(ref_count, lease_time);

CREATE TABLE IF NOT EXISTS object_deps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER NOT NULL,
    child_id INTEGER NOT NULL,
    FOREIGN KEY (parent_id) REFERENCES objects(id),
    FOREIGN KEY (child_id) REFERENCES objects(id)
);
CREATE INDEX IF NOT EXISTS object_deps_by_parent ON object_deps(parent_id, child_id);

CREATE TABLE IF NOT EXISTS temp_objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS labels (
    namespace TEXT NOT NULL,
    label TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    PRIMARY KEY (namespace, label)
);
";

/// Transactional metadata table store over a single SQLite connection.
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    /// Open the metadata database, creating the schema when asked.
    ///
    /// The version handshake runs in both modes: a store written by any
    /// other schema version fails with [`StoreError::VersionMismatch`].
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(SQLITE_BUSY_TIMEOUT)?;

        if create {
            conn.execute_batch(SCHEMA_INIT)?;
            let existing: Option<i64> = conn
                .query_row("SELECT version FROM version", [], |row| row.get(0))
                .optional()?;
            if existing.is_none() {
                conn.execute("INSERT INTO version VALUES (?1)", [VERSION_LATEST])?;
            }
        }

        let version: i64 = conn
            .query_row("SELECT version FROM version", [], |row| row.get(0))
            .optional()?
            .ok_or(StoreError::VersionMismatch { found: 0 })?;
        if version != VERSION_LATEST {
            return Err(StoreError::VersionMismatch { found: version });
        }

        Ok(MetaStore {
            conn: Mutex::new(conn),
        })
    }

    /// Run `body` inside an exclusive write transaction, committing on `Ok`
    /// and rolling back on `Err`.
    pub fn with_immediate_tx<T>(&self, body: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("metadata lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = body(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn find_object_id(&self, name: &Name) -> Result<Option<i64>> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        Ok(conn
            .query_row(
                "SELECT id FROM objects WHERE name = ?1",
                [name.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn touch_lease(&self, object_id: i64, lease_time: i64) -> Result<()> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute(
            "UPDATE objects SET lease_time = MAX(?1, lease_time) WHERE id = ?2",
            params![lease_time, object_id],
        )?;
        Ok(())
    }

    pub fn enqueue_temp_object(&self, name: &Name) -> Result<i64> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        conn.execute(
            "INSERT INTO temp_objects (name) VALUES (?1)",
            [name.as_bytes().as_slice()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_label(&self, namespace: &str, label: &str) -> Result<Option<(i64, Name)>> {
        let conn = self.conn.lock().expect("metadata lock poisoned");
        let row: Option<(i64, Vec<u8>)> = conn
            .query_row(
                "SELECT l.object_id, o.name FROM labels AS l
                     JOIN objects AS o ON (l.object_id = o.id)
                     WHERE l.namespace = ?1 AND l.label = ?2",
                params![namespace, label],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((id, raw)) => Ok(Some((id, Name::from_bytes(&raw)?))),
            None => Ok(None),
        }
    }

    /// Atomically point `namespace:label` at `name`, or clear it with `None`.
    ///
    /// Ref counts of the displaced and the new target are both adjusted in
    /// the same transaction.
    pub fn set_label(&self, namespace: &str, label: &str, name: Option<&Name>) -> Result<()> {
        self.with_immediate_tx(|tx| {
            let new_id = match name {
                Some(name) => Some(
                    tx.query_row(
                        "SELECT id FROM objects WHERE name = ?1",
                        [name.as_bytes().as_slice()],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound(name.to_hex()))?,
                ),
                None => None,
            };

            tx.execute(
                "UPDATE objects AS o SET ref_count = ref_count - 1
                     WHERE EXISTS (
                         SELECT 1 FROM labels
                         WHERE namespace = ?1 AND label = ?2 AND object_id = o.id
                     )",
                params![namespace, label],
            )?;

            match new_id {
                Some(id) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO labels (namespace, label, object_id)
                             VALUES (?1, ?2, ?3)",
                        params![namespace, label, id],
                    )?;
                    tx.execute(
                        "UPDATE objects SET ref_count = ref_count + 1 WHERE id = ?1",
                        [id],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM labels WHERE namespace = ?1 AND label = ?2",
                        params![namespace, label],
                    )?;
                }
            }
            Ok(())
        })
    }

}

// In-transaction helpers shared by the writer and the collector.

pub fn tx_find_object_id(tx: &Transaction, name: &Name) -> Result<Option<i64>> {
    Ok(tx
        .query_row(
            "SELECT id FROM objects WHERE name = ?1",
            [name.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?)
}

/// Extend the lease on an existing object, returning whether a row matched.
/// The `+ 1` keeps the update observable even when the lease is unchanged.
pub fn tx_bump_existing_lease(tx: &Transaction, name: &Name, lease_time: i64) -> Result<bool> {
    let changed = tx.execute(
        "UPDATE objects SET lease_time = MAX(?1, lease_time + 1) WHERE name = ?2",
        params![lease_time, name.as_bytes().as_slice()],
    )?;
    Ok(changed > 0)
}

pub fn tx_create_object(tx: &Transaction, name: &Name, lease_time: i64) -> Result<i64> {
    tx.execute(
        "INSERT INTO objects (name, ref_count, lease_time) VALUES (?1, 0, ?2)",
        params![name.as_bytes().as_slice(), lease_time],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Record a dependency edge and bump the child's ref count. Duplicate edges
/// are recorded again; the ref count tracks edge count exactly.
pub fn tx_add_dep(tx: &Transaction, parent_id: i64, child_id: i64) -> Result<()> {
    tx.execute(
        "INSERT INTO object_deps (parent_id, child_id) VALUES (?1, ?2)",
        params![parent_id, child_id],
    )?;
    tx.execute(
        "UPDATE objects SET ref_count = ref_count + 1 WHERE id = ?1",
        [child_id],
    )?;
    Ok(())
}

pub fn tx_remove_temp_object(tx: &Transaction, temp_id: i64) -> Result<()> {
    tx.execute("DELETE FROM temp_objects WHERE id = ?1", [temp_id])?;
    Ok(())
}
