use super::DirectoriesIndex;
use crate::digest::Digest;
use crate::errors::DirectoriesIndexError;
use crate::key::BlobKey;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;

/// `directories.sqlite` (or a caller-supplied name), deleted and rebuilt on
/// each [DirectoriesIndex::start]. Schema:
/// `entries(path TEXT, directory BLOB)`, `directories(directory BLOB
/// PRIMARY KEY, entries TEXT)`. `directory` is the digest's textual form
/// (`{hash}_{size}`); `entries` is the ordered blob-keys, newline-joined,
/// matching [super::file::FileDirectoriesIndex]'s on-disk encoding so the
/// two backends are trivially cross-checked in tests.
pub struct SqliteDirectoriesIndex {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

fn digest_key(digest: &Digest) -> String {
    format!("{}_{}", digest.hash(), digest.size())
}

fn parse_digest_key(s: &str) -> Option<Digest> {
    let (hash, size) = s.rsplit_once('_')?;
    Digest::build(hash, size.parse().ok()?).ok()
}

impl SqliteDirectoriesIndex {
    /// Opens a fresh SQLite database at `path`, deleted and rebuilt on each
    /// start. Any pre-existing file of the same name is removed first so a
    /// crashed process's stale index never gets consulted; the startup
    /// rescan is what repopulates it, not whatever was left on disk.
    pub fn new(path: PathBuf) -> Result<Self, DirectoriesIndexError> {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let conn = Connection::open(&path)?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Opens an ephemeral, process-private `:memory:` database.
    pub fn new_in_memory() -> Result<Self, DirectoriesIndexError> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entries (path TEXT NOT NULL, directory BLOB NOT NULL);
         CREATE INDEX IF NOT EXISTS entries_directory_idx ON entries(directory);
         CREATE INDEX IF NOT EXISTS entries_path_idx ON entries(path);
         CREATE TABLE IF NOT EXISTS directories (directory BLOB PRIMARY KEY, entries TEXT NOT NULL);",
    )
}

#[async_trait]
impl DirectoriesIndex for SqliteDirectoriesIndex {
    async fn put(
        &self,
        directory_digest: Digest,
        blob_keys: Vec<BlobKey>,
    ) -> Result<(), DirectoriesIndexError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let dir_key = digest_key(&directory_digest);
            let entries = blob_keys
                .iter()
                .map(|k| k.to_string())
                .collect::<Vec<_>>()
                .join("\n");

            let mut conn = conn.lock();
            let txn = conn.transaction()?;
            txn.execute(
                "DELETE FROM entries WHERE directory = ?1",
                rusqlite::params![dir_key],
            )?;
            for blob_key in &blob_keys {
                txn.execute(
                    "INSERT INTO entries (path, directory) VALUES (?1, ?2)",
                    rusqlite::params![blob_key.to_string(), dir_key],
                )?;
            }
            txn.execute(
                "INSERT INTO directories (directory, entries) VALUES (?1, ?2)
                 ON CONFLICT(directory) DO UPDATE SET entries = excluded.entries",
                rusqlite::params![dir_key, entries],
            )?;
            txn.commit()
        })
        .await
        .map_err(join_err)??;
        Ok(())
    }

    async fn directory_entries(
        &self,
        directory_digest: &Digest,
    ) -> Result<Vec<BlobKey>, DirectoriesIndexError> {
        let conn = self.conn.clone();
        let dir_key = digest_key(directory_digest);
        let entries = tokio::task::spawn_blocking(move || -> rusqlite::Result<Option<String>> {
            let conn = conn.lock();
            conn.query_row(
                "SELECT entries FROM directories WHERE directory = ?1",
                rusqlite::params![dir_key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
        .map_err(join_err)??;

        Ok(match entries {
            Some(s) => s.lines().filter_map(BlobKey::parse).collect(),
            None => Vec::new(),
        })
    }

    async fn remove(&self, directory_digest: &Digest) -> Result<(), DirectoriesIndexError> {
        let conn = self.conn.clone();
        let dir_key = digest_key(directory_digest);
        tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let mut conn = conn.lock();
            let txn = conn.transaction()?;
            txn.execute(
                "DELETE FROM entries WHERE directory = ?1",
                rusqlite::params![dir_key],
            )?;
            txn.execute(
                "DELETE FROM directories WHERE directory = ?1",
                rusqlite::params![dir_key],
            )?;
            txn.commit()
        })
        .await
        .map_err(join_err)??;
        Ok(())
    }

    /// Issues one `DELETE ... RETURNING directory`.
    async fn remove_entry(&self, blob_key: &BlobKey) -> Result<Vec<Digest>, DirectoriesIndexError> {
        let conn = self.conn.clone();
        let path = blob_key.to_string();
        let digests = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<String>> {
            let conn = conn.lock();
            let mut stmt =
                conn.prepare("DELETE FROM entries WHERE path = ?1 RETURNING directory")?;
            let rows = stmt.query_map(rusqlite::params![path], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
        .await
        .map_err(join_err)??;

        Ok(digests.into_iter().filter_map(|s| parse_digest_key(&s)).collect())
    }

    async fn start(&self) -> Result<(), DirectoriesIndexError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), DirectoriesIndexError> {
        // The per-start ephemeral database is deleted on close: next start
        // rebuilds it entirely from the cache's on-disk rescan.
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    fn owns_path(&self, file_name: &str) -> bool {
        self.path
            .as_ref()
            .and_then(|p| p.file_name())
            .is_some_and(|n| n == file_name)
    }
}

fn join_err(e: tokio::task::JoinError) -> DirectoriesIndexError {
    DirectoriesIndexError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}
