//! Durable record of thunks and their completed runs, kept in SQLite.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, DatabaseName, OpenFlags, OptionalExtension, params};

use crate::cid::Cid;

pub fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Open the store at `path`, creating it with the schema if it is absent.
pub fn open_store(path: &Path) -> Result<Connection> {
    ensure_parent_dirs(path)?;
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_READ_WRITE,
    )
    .with_context(|| format!("failed to open {}", path.display()))?;
    configure_pragmas(&conn)?;
    install_schema(&conn)?;
    Ok(conn)
}

pub fn configure_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(Some(DatabaseName::Main), "journal_mode", "WAL")?;
    conn.pragma_update(Some(DatabaseName::Main), "synchronous", "NORMAL")?;
    conn.pragma_update(Some(DatabaseName::Main), "temp_store", "MEMORY")?;
    conn.pragma_update(Some(DatabaseName::Main), "busy_timeout", 5_000i64)?;
    Ok(())
}

pub fn install_schema(conn: &Connection) -> Result<()> {
    const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS thunk (
  cid   BLOB PRIMARY KEY,
  cbor  BLOB NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS result (
  cid        BLOB PRIMARY KEY REFERENCES thunk(cid),
  exit_code  INTEGER NOT NULL,
  outputs    TEXT NOT NULL
) WITHOUT ROWID;
"#;

    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Record a thunk's canonical encoding. Returns false if it was already known.
pub fn put_thunk(conn: &Connection, cid: &Cid, cbor: &[u8]) -> Result<bool> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO thunk (cid, cbor) VALUES (?1, ?2)",
        params![&cid.as_bytes()[..], cbor],
    )?;
    Ok(rows > 0)
}

pub fn load_thunk_cbor(conn: &Connection, cid: &Cid) -> Result<Option<Vec<u8>>> {
    let cbor = conn
        .query_row(
            "SELECT cbor FROM thunk WHERE cid = ?1",
            params![&cid.as_bytes()[..]],
            |row| row.get(0),
        )
        .optional()?;
    Ok(cbor)
}

/// A run that completed and whose outputs are still on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredResult {
    pub exit_code: i32,
    pub outputs: Vec<String>,
}

pub fn put_result(conn: &Connection, cid: &Cid, result: &StoredResult) -> Result<()> {
    let outputs = serde_json::to_string(&result.outputs)?;
    conn.execute(
        "INSERT OR REPLACE INTO result (cid, exit_code, outputs) VALUES (?1, ?2, ?3)",
        params![&cid.as_bytes()[..], result.exit_code, outputs],
    )?;
    Ok(())
}

pub fn get_result(conn: &Connection, cid: &Cid) -> Result<Option<StoredResult>> {
    let row: Option<(i32, String)> = conn
        .query_row(
            "SELECT exit_code, outputs FROM result WHERE cid = ?1",
            params![&cid.as_bytes()[..]],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((exit_code, outputs)) => Ok(Some(StoredResult {
            exit_code,
            outputs: serde_json::from_str(&outputs)
                .with_context(|| format!("corrupt outputs for {cid}"))?,
        })),
        None => Ok(None),
    }
}

/// Drop a completion record, e.g. when its work directory has gone missing.
pub fn forget_result(conn: &Connection, cid: &Cid) -> Result<()> {
    conn.execute("DELETE FROM result WHERE cid = ?1", params![&cid.as_bytes()[..]])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn records_thunks_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let conn = open_store(&dir.path().join("nested/kiln.db"))?;
        let cid = Cid::compute(b"thunk");
        assert!(put_thunk(&conn, &cid, b"cbor")?);
        assert!(!put_thunk(&conn, &cid, b"cbor")?);
        assert_eq!(load_thunk_cbor(&conn, &cid)?, Some(b"cbor".to_vec()));
        assert_eq!(load_thunk_cbor(&conn, &Cid::compute(b"other"))?, None);
        Ok(())
    }

    #[test]
    fn results_round_trip_and_can_be_forgotten() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("kiln.db");
        let cid = Cid::compute(b"thunk");
        {
            let conn = open_store(&path)?;
            put_thunk(&conn, &cid, b"cbor")?;
            put_result(
                &conn,
                &cid,
                &StoredResult {
                    exit_code: 0,
                    outputs: vec!["bin/".into(), "log.txt".into()],
                },
            )?;
        }
        let conn = open_store(&path)?;
        let stored = get_result(&conn, &cid)?;
        assert_eq!(stored.map(|r| r.outputs), Some(vec!["bin/".to_string(), "log.txt".to_string()]));
        forget_result(&conn, &cid)?;
        assert_eq!(get_result(&conn, &cid)?, None);
        Ok(())
    }
}
