//! TTL key-value store abstraction and implementations.
//!
//! The trait mirrors what a shared cache (Redis-like) offers: get, set with
//! expiry, an atomic conditional set, and delete. `set_if_absent` is the
//! primitive the refresh lock depends on, so implementations must make it
//! atomic (never read-then-write across operations).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableDatabase, TableDefinition};
use tokio::sync::Mutex;

const TTL_TABLE: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("ttl_store");

/// Shared key-value store with per-key expiry.
///
/// No operation may block indefinitely; callers treat any `Err` as a cache
/// miss (reads) or a busy lock (conditional sets).
#[async_trait]
pub trait TtlStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Atomic conditional set. Returns `true` iff the write was performed.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store with lazy expiry. Used in tests and single-node setups.
#[derive(Default)]
pub struct MemoryTtlStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryTtlStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TtlStore for MemoryTtlStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, deadline)) if *deadline > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let live = entries
            .get(key)
            .map(|(_, deadline)| *deadline > Instant::now())
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Embedded redb-backed store.
///
/// Value layout: 8-byte big-endian unix-millis expiry followed by the
/// payload. Expiry is enforced on read; expired entries are removed lazily.
pub struct RedbTtlStore {
    db: Arc<Database>,
}

impl RedbTtlStore {
    pub fn new(path: &str) -> Result<Self> {
        let db = Arc::new(Database::create(path)?);
        let write_txn = db.begin_write()?;
        write_txn.open_table(TTL_TABLE)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn with_db(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(TTL_TABLE)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    fn encode(value: &[u8], ttl: Duration) -> Vec<u8> {
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        let mut framed = Vec::with_capacity(8 + value.len());
        framed.extend_from_slice(&expires_at.to_be_bytes());
        framed.extend_from_slice(value);
        framed
    }

    fn decode(framed: &[u8]) -> Result<(i64, Vec<u8>)> {
        if framed.len() < 8 {
            bail!("corrupt ttl_store entry: {} bytes", framed.len());
        }
        let mut header = [0u8; 8];
        header.copy_from_slice(&framed[..8]);
        Ok((i64::from_be_bytes(header), framed[8..].to_vec()))
    }

    /// Read within a write transaction so expired entries can be reaped and
    /// `set_if_absent` stays atomic.
    fn live_value_locked(
        table: &impl redb::ReadableTable<&'static str, &'static [u8]>,
        key: &str,
    ) -> Result<Option<Vec<u8>>> {
        let Some(raw) = table.get(key)? else {
            return Ok(None);
        };
        let (expires_at, payload) = Self::decode(raw.value())?;
        if expires_at <= Utc::now().timestamp_millis() {
            return Ok(None);
        }
        Ok(Some(payload))
    }
}

#[async_trait]
impl TtlStore for RedbTtlStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TTL_TABLE)?;
        Self::live_value_locked(&table, key)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let framed = Self::encode(value, ttl);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TTL_TABLE)?;
            table.insert(key, framed.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let framed = Self::encode(value, ttl);
        let write_txn = self.db.begin_write()?;
        let written = {
            let mut table = write_txn.open_table(TTL_TABLE)?;
            if Self::live_value_locked(&table, key)?.is_some() {
                false
            } else {
                table.insert(key, framed.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(written)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TTL_TABLE)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
