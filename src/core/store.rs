//! Embedded ordered key-value store with namespaced buckets.
//!
//! Buckets are addressed by a path of byte components (`jobs`,
//! `logs/<job id>`, `aliases/<user>`). Entries inside a bucket are kept in
//! byte order of their keys, so numeric keys must be written with
//! [`u64_key`] for forward and backward scans to follow numeric order.
//!
//! Every operation runs inside a SQLite transaction on one shared connection.
//! The connection is opened lazily on first use.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use crate::error::{Error, Result};

pub const JOBS_BUCKET: &[u8] = b"jobs";
pub const LOGS_BUCKET: &[u8] = b"logs";
pub const TOKENS_BUCKET: &[u8] = b"tokens";
pub const ALIASES_BUCKET: &[u8] = b"aliases";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS buckets (
        path TEXT PRIMARY KEY,
        sequence INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS entries (
        bucket TEXT NOT NULL,
        key BLOB NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY (bucket, key)
    ) WITHOUT ROWID;
";

/// Encodes a sequence number so that byte order equals numeric order.
pub fn u64_key(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Inverse of [`u64_key`]. Returns `None` for keys that are not 8 bytes.
pub fn key_u64(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

struct StoreInner {
    location: Option<Location>,
    conn: OnceCell<Mutex<Connection>>,
}

/// Cheaply cloneable handle to the shared database.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// A store backed by the file at `path`. Nothing is opened until the
    /// first transaction.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self::with_location(Some(Location::File(path.as_ref().to_path_buf())))
    }

    pub fn in_memory() -> Self {
        Self::with_location(Some(Location::Memory))
    }

    /// A store with no database behind it. Every operation fails with
    /// [`Error::NotConfigured`].
    pub fn unconfigured() -> Self {
        Self::with_location(None)
    }

    fn with_location(location: Option<Location>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                location,
                conn: OnceCell::new(),
            }),
        }
    }

    async fn connection(&self) -> Result<&Mutex<Connection>> {
        let location = self.inner.location.as_ref().ok_or(Error::NotConfigured)?;
        self.inner
            .conn
            .get_or_try_init(|| async move { open_connection(location).map(Mutex::new) })
            .await
    }

    /// Runs `f` in a read transaction. Mutations inside `f` fail with
    /// [`Error::ReadOnly`].
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T>,
    {
        let conn = self.connection().await?;
        let mut guard = conn.lock().await;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(|e| Error::store("<begin>", e))?;
        let tx = Tx {
            tx,
            writable: false,
        };
        f(&tx)
    }

    /// Runs `f` in a write transaction. The transaction commits only if `f`
    /// returns `Ok`; any error rolls back every change `f` made.
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T>,
    {
        let conn = self.connection().await?;
        let mut guard = conn.lock().await;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::store("<begin>", e))?;
        let tx = Tx { tx, writable: true };
        let out = f(&tx)?;
        tx.tx.commit().map_err(|e| Error::store("<commit>", e))?;
        Ok(out)
    }
}

fn open_connection(location: &Location) -> Result<Connection> {
    let conn = match location {
        Location::File(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            info!("Opening job store at {:?}", path);
            Connection::open(path)
        }
        Location::Memory => Connection::open_in_memory(),
    }
    .map_err(|e| Error::store("<open>", e))?;

    conn.execute_batch(SCHEMA)
        .map_err(|e| Error::store("<schema>", e))?;
    Ok(conn)
}

/// Renders a bucket path. Printable components are kept as-is, anything else
/// (big-endian ids, odd user names) is hex encoded. Printable components that
/// could pass for hex get a `~` prefix so the two forms never meet.
pub fn bucket_name(path: &[&[u8]]) -> String {
    path.iter()
        .map(|component| match std::str::from_utf8(component) {
            Ok(s) if is_plain(s) && looks_like_hex(s) => format!("~{}", s),
            Ok(s) if is_plain(s) => s.to_string(),
            _ => hex::encode(component),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_plain(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

fn looks_like_hex(s: &str) -> bool {
    s.len() % 2 == 0 && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// A transaction handed to [`Store::read`] and [`Store::write`] closures.
pub struct Tx<'c> {
    tx: rusqlite::Transaction<'c>,
    writable: bool,
}

impl Tx<'_> {
    fn ensure_writable(&self, bucket: &str) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly(bucket.to_string()))
        }
    }

    pub fn bucket_exists(&self, path: &[&[u8]]) -> Result<bool> {
        let name = bucket_name(path);
        let found = self
            .tx
            .query_row(
                "SELECT 1 FROM buckets WHERE path = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| Error::store(&name, e))?;
        Ok(found.is_some())
    }

    fn require_bucket(&self, path: &[&[u8]]) -> Result<String> {
        if self.bucket_exists(path)? {
            Ok(bucket_name(path))
        } else {
            Err(Error::BucketNotFound(bucket_name(path)))
        }
    }

    /// Creates the bucket and every parent along its path.
    pub fn create_bucket_if_missing(&self, path: &[&[u8]]) -> Result<()> {
        let name = bucket_name(path);
        self.ensure_writable(&name)?;
        for depth in 1..=path.len() {
            let prefix = bucket_name(&path[..depth]);
            self.tx
                .execute(
                    "INSERT OR IGNORE INTO buckets (path) VALUES (?1)",
                    params![prefix],
                )
                .map_err(|e| Error::store(&prefix, e))?;
        }
        Ok(())
    }

    /// Returns the next value of the bucket's sequence. The first call on a
    /// fresh bucket returns 1.
    pub fn next_sequence(&self, path: &[&[u8]]) -> Result<u64> {
        let name = bucket_name(path);
        self.ensure_writable(&name)?;
        let next: Option<i64> = self
            .tx
            .query_row(
                "UPDATE buckets SET sequence = sequence + 1 WHERE path = ?1 RETURNING sequence",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::store(&name, e))?;
        match next {
            Some(seq) => Ok(seq as u64),
            None => Err(Error::BucketNotFound(name)),
        }
    }

    pub fn get(&self, path: &[&[u8]], key: &[u8]) -> Result<Option<Vec<u8>>> {
        let name = bucket_name(path);
        self.tx
            .query_row(
                "SELECT value FROM entries WHERE bucket = ?1 AND key = ?2",
                params![name, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::store(&name, e))
    }

    pub fn put(&self, path: &[&[u8]], key: &[u8], value: &[u8]) -> Result<()> {
        let name = self.require_bucket(path)?;
        self.ensure_writable(&name)?;
        self.tx
            .execute(
                "INSERT OR REPLACE INTO entries (bucket, key, value) VALUES (?1, ?2, ?3)",
                params![name, key, value],
            )
            .map_err(|e| Error::store(&name, e))?;
        Ok(())
    }

    /// Removes a key. Returns whether it existed.
    pub fn delete(&self, path: &[&[u8]], key: &[u8]) -> Result<bool> {
        let name = bucket_name(path);
        self.ensure_writable(&name)?;
        let rows = self
            .tx
            .execute(
                "DELETE FROM entries WHERE bucket = ?1 AND key = ?2",
                params![name, key],
            )
            .map_err(|e| Error::store(&name, e))?;
        Ok(rows > 0)
    }

    /// Walks the bucket in key order. Rows are pulled from the cursor one at
    /// a time, so returning `Break` stops without reading the rest.
    pub fn scan<F>(&self, path: &[&[u8]], direction: Direction, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<ControlFlow<()>>,
    {
        let name = self.require_bucket(path)?;
        let sql = match direction {
            Direction::Forward => {
                "SELECT key, value FROM entries WHERE bucket = ?1 ORDER BY key ASC"
            }
            Direction::Backward => {
                "SELECT key, value FROM entries WHERE bucket = ?1 ORDER BY key DESC"
            }
        };
        let mut stmt = self
            .tx
            .prepare_cached(sql)
            .map_err(|e| Error::store(&name, e))?;
        let mut rows = stmt
            .query(params![name])
            .map_err(|e| Error::store(&name, e))?;
        while let Some(row) = rows.next().map_err(|e| Error::store(&name, e))? {
            let key: Vec<u8> = row.get(0).map_err(|e| Error::store(&name, e))?;
            let value: Vec<u8> = row.get(1).map_err(|e| Error::store(&name, e))?;
            if f(&key, &value)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_store_fails_immediately() {
        let store = Store::unconfigured();
        let err = store.read(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, Error::NotConfigured));
        let err = store.write(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, Error::NotConfigured));
    }

    #[tokio::test]
    async fn sequences_are_per_bucket() {
        let store = Store::in_memory();
        let seqs = store
            .write(|tx| {
                tx.create_bucket_if_missing(&[b"a"])?;
                tx.create_bucket_if_missing(&[b"b"])?;
                Ok((
                    tx.next_sequence(&[b"a"])?,
                    tx.next_sequence(&[b"a"])?,
                    tx.next_sequence(&[b"b"])?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(seqs, (1, 2, 1));
    }

    #[tokio::test]
    async fn next_sequence_on_missing_bucket_fails() {
        let store = Store::in_memory();
        let err = store
            .write(|tx| tx.next_sequence(&[b"nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BucketNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn nested_buckets_create_parents() {
        let store = Store::in_memory();
        let id = u64_key(7);
        store
            .write(|tx| tx.create_bucket_if_missing(&[LOGS_BUCKET, &id]))
            .await
            .unwrap();
        let (parent, child) = store
            .read(|tx| {
                Ok((
                    tx.bucket_exists(&[LOGS_BUCKET])?,
                    tx.bucket_exists(&[LOGS_BUCKET, &id])?,
                ))
            })
            .await
            .unwrap();
        assert!(parent && child);
        assert_eq!(bucket_name(&[LOGS_BUCKET, &id]), "logs/0000000000000007");
    }

    #[test]
    fn bucket_names_do_not_collide() {
        // "a b" hex encodes to the text of the second name
        let spaced = bucket_name(&[b"aliases", b"a b"]);
        let hexish = bucket_name(&[b"aliases", b"612062"]);
        assert_eq!(spaced, "aliases/612062");
        assert_eq!(hexish, "aliases/~612062");
        assert_eq!(bucket_name(&[b"aliases", b"alice"]), "aliases/alice");
        assert_ne!(bucket_name(&[b"a/b"]), bucket_name(&[b"a", b"b"]));
    }

    #[tokio::test]
    async fn colliding_names_get_separate_buckets() {
        let store = Store::in_memory();
        store
            .write(|tx| {
                tx.create_bucket_if_missing(&[b"users", b"a b"])?;
                tx.put(&[b"users", b"a b"], b"k", b"secret")
            })
            .await
            .unwrap();
        let (exists, value) = store
            .read(|tx| {
                let exists = tx.bucket_exists(&[b"users", b"612062"])?;
                let value = if exists {
                    tx.get(&[b"users", b"612062"], b"k")?
                } else {
                    None
                };
                Ok((exists, value))
            })
            .await
            .unwrap();
        assert!(!exists);
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn failed_write_rolls_back() {
        let store = Store::in_memory();
        let res: Result<()> = store
            .write(|tx| {
                tx.create_bucket_if_missing(&[b"x"])?;
                tx.put(&[b"x"], b"k", b"v")?;
                Err(Error::Config("boom".into()))
            })
            .await;
        assert!(res.is_err());
        let exists = store
            .read(|tx| tx.bucket_exists(&[b"x"]))
            .await
            .unwrap();
        assert!(!exists);
    }

    #[tokio::test]
    async fn read_transaction_rejects_writes() {
        let store = Store::in_memory();
        let err = store
            .read(|tx| tx.create_bucket_if_missing(&[b"x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
    }

    #[tokio::test]
    async fn big_endian_keys_scan_in_numeric_order() {
        let store = Store::in_memory();
        store
            .write(|tx| {
                tx.create_bucket_if_missing(&[b"n"])?;
                for n in [255u64, 1, 256, 65536, 2] {
                    tx.put(&[b"n"], &u64_key(n), b"")?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let mut forward = Vec::new();
        let mut backward = Vec::new();
        store
            .read(|tx| {
                tx.scan(&[b"n"], Direction::Forward, |k, _| {
                    forward.push(key_u64(k).unwrap());
                    Ok(ControlFlow::Continue(()))
                })?;
                tx.scan(&[b"n"], Direction::Backward, |k, _| {
                    backward.push(key_u64(k).unwrap());
                    if backward.len() == 2 {
                        Ok(ControlFlow::Break(()))
                    } else {
                        Ok(ControlFlow::Continue(()))
                    }
                })
            })
            .await
            .unwrap();
        assert_eq!(forward, vec![1, 2, 255, 256, 65536]);
        assert_eq!(backward, vec![65536, 256]);
    }

    #[tokio::test]
    async fn file_store_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bot.db");
        {
            let store = Store::open(&path);
            store
                .write(|tx| {
                    tx.create_bucket_if_missing(&[b"k"])?;
                    tx.put(&[b"k"], b"a", b"1")
                })
                .await
                .unwrap();
        }
        let store = Store::open(&path);
        let value = store.read(|tx| tx.get(&[b"k"], b"a")).await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"1"[..]));
    }
}
