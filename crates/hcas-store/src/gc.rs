//! Incremental garbage collection.
//!
//! Collection runs in bounded batches so callers can interleave it with
//! other work. Three phases per pass: drop dead objects into the temp set,
//! reap temp reservations (and their data files), then sweep orphaned
//! spill files out of `temp/`.

use std::fs;
use std::io;

use fs2::FileExt;
use tracing::{info, warn};

use crate::meta::tx_find_object_id;
use crate::name::Name;
use crate::{now_millis, Result, StoreInner};

const MAX_WORK_PER_BATCH: u64 = 1000;

pub(crate) fn garbage_collect(store: &StoreInner, budget: Option<u64>) -> Result<bool> {
    let phases: [fn(&StoreInner, usize) -> Result<usize>; 3] =
        [collect_objects, collect_temp_objects, collect_orphan_temp_files];

    let mut complete = true;
    for phase in phases {
        let mut remaining = budget;
        loop {
            let chunk = match remaining {
                Some(0) => {
                    complete = false;
                    break;
                }
                Some(left) => left.min(MAX_WORK_PER_BATCH),
                None => MAX_WORK_PER_BATCH,
            };

            let done = phase(store, chunk as usize)? as u64;
            if let Some(left) = &mut remaining {
                *left -= done.min(*left);
            }
            if done == 0 {
                break;
            }
        }
    }
    Ok(complete)
}

/// Delete up to `limit` objects with zero references and expired leases.
///
/// Their dependency edges are unwound (each edge decrements its child once)
/// and their names move into `temp_objects`, handing the data files to the
/// next phase.
fn collect_objects(store: &StoreInner, limit: usize) -> Result<usize> {
    let now = now_millis();
    let collected = store.meta().with_immediate_tx(|tx| {
        let victims = {
            let mut stmt = tx.prepare(
                "SELECT id, name FROM objects
                     WHERE ref_count = 0 AND lease_time < ?1
                     ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![now, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        for (id, name) in &victims {
            let children = {
                let mut stmt =
                    tx.prepare("SELECT child_id FROM object_deps WHERE parent_id = ?1")?;
                let rows = stmt.query_map([id], |row| row.get::<_, i64>(0))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };
            for child_id in children {
                tx.execute(
                    "UPDATE objects SET ref_count = ref_count - 1 WHERE id = ?1",
                    [child_id],
                )?;
            }
            tx.execute("DELETE FROM object_deps WHERE parent_id = ?1", [id])?;
            tx.execute("DELETE FROM objects WHERE id = ?1", [id])?;
            tx.execute(
                "INSERT INTO temp_objects (name) VALUES (?1)",
                [name.as_slice()],
            )?;
        }
        Ok(victims.len())
    })?;

    if collected > 0 {
        info!(count = collected, "collected objects");
    }
    Ok(collected)
}

/// Reap up to `limit` temp reservations.
///
/// A name that has since been (re)published keeps its data file; otherwise
/// the file is unlinked while the exclusive transaction is held. Missing
/// files are fine: the reservation may predate any data reaching disk.
fn collect_temp_objects(store: &StoreInner, limit: usize) -> Result<usize> {
    let collected = store.meta().with_immediate_tx(|tx| {
        let entries = {
            let mut stmt =
                tx.prepare("SELECT id, name FROM temp_objects ORDER BY id LIMIT ?1")?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        for (temp_id, raw_name) in &entries {
            let name = Name::from_bytes(raw_name)?;
            if tx_find_object_id(tx, &name)?.is_none() {
                let (_, object_path) = store.data_file_path(&name);
                match fs::remove_file(&object_path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            tx.execute("DELETE FROM temp_objects WHERE id = ?1", [temp_id])?;
        }
        Ok(entries.len())
    })?;

    if collected > 0 {
        info!(count = collected, "collected temp objects");
    }
    Ok(collected)
}

/// Remove up to `limit` orphaned spill files from `temp/`.
///
/// A live writer holds an exclusive advisory lock on its spill file for the
/// whole write; anything we can lock has no owner left.
fn collect_orphan_temp_files(store: &StoreInner, limit: usize) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(store.temp_dir())? {
        if removed >= limit {
            break;
        }
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }

        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            // Lock held: a writer still owns this file.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unlockable temp file");
                continue;
            }
        }
    }

    if removed > 0 {
        info!(count = removed, "collected orphan temp files");
    }
    Ok(removed)
}
