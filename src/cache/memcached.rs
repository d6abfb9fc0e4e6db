//! Shared cache on memcached servers (text protocol).
//!
//! Keys are hashed onto servers; each server gets one lazily opened
//! connection that is dropped and reopened after any failure. Every failure
//! is logged and reported as a miss, so tile reads keep working when the
//! servers go away.
//!
//! Servers started with `-Y` (ASCII authentication) expect a `set` of
//! `"<username> <password>"` as the first command; this is sent on connect
//! when credentials are configured.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CacheBackend, CacheKey, CacheStats, KeyPredicate};
use crate::array::PixelArray;
use crate::error::CacheError;
use crate::source::{Encoding, TilePayload};

/// Largest value memcached accepts by default.
const MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Keys remembered for predicate invalidation.
const TRACKED_KEYS: usize = 200_000;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct MemcachedOptions {
    /// `host:port` entries
    pub servers: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Per-operation timeout
    pub timeout: Duration,
}

impl MemcachedOptions {
    /// Parse a comma-separated server list; a missing port means 11211.
    pub fn from_url_list(list: &str) -> Self {
        let servers = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.contains(':') {
                    s.to_string()
                } else {
                    format!("{s}:11211")
                }
            })
            .collect();
        Self {
            servers,
            username: None,
            password: None,
            timeout: Duration::from_secs(2),
        }
    }
}

/// What goes over the wire.
#[derive(Serialize, Deserialize)]
enum WirePayload {
    Pixels(PixelArray),
    Encoded { data: Vec<u8>, encoding: Encoding },
}

impl WirePayload {
    fn encode(payload: &TilePayload) -> Result<Vec<u8>, CacheError> {
        let wire = match payload {
            TilePayload::Pixels(array) => WirePayload::Pixels(array.as_ref().clone()),
            TilePayload::Encoded { data, encoding } => WirePayload::Encoded {
                data: data.to_vec(),
                encoding: *encoding,
            },
        };
        bincode::serialize(&wire).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<TilePayload, CacheError> {
        let wire: WirePayload =
            bincode::deserialize(bytes).map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(match wire {
            WirePayload::Pixels(array) => TilePayload::Pixels(array.into()),
            WirePayload::Encoded { data, encoding } => TilePayload::Encoded {
                data: Bytes::from(data),
                encoding,
            },
        })
    }
}

// =============================================================================
// Connection
// =============================================================================

struct Connection {
    stream: BufStream<TcpStream>,
}

fn protocol_error(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

impl Connection {
    async fn open(address: &str, options: &MemcachedOptions) -> io::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let mut conn = Self {
            stream: BufStream::new(stream),
        };
        if let (Some(user), Some(pass)) = (&options.username, &options.password) {
            let credentials = format!("{user} {pass}");
            conn.store("auth", credentials.as_bytes()).await?;
        }
        Ok(conn)
    }

    async fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(line.trim_end().to_string())
    }

    async fn get(&mut self, key: &str) -> io::Result<Option<Vec<u8>>> {
        self.stream
            .write_all(format!("get {key}\r\n").as_bytes())
            .await?;
        self.stream.flush().await?;

        let header = self.read_line().await?;
        if header == "END" {
            return Ok(None);
        }
        let mut parts = header.split_whitespace();
        let (Some("VALUE"), Some(_key), Some(_flags), Some(len)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(protocol_error(format!("unexpected reply {header:?}")));
        };
        let len: usize = len
            .parse()
            .map_err(|_| protocol_error(format!("bad length in {header:?}")))?;

        let mut data = vec![0u8; len + 2];
        self.stream.read_exact(&mut data).await?;
        data.truncate(len);

        let end = self.read_line().await?;
        if end != "END" {
            return Err(protocol_error(format!("expected END, got {end:?}")));
        }
        Ok(Some(data))
    }

    async fn store(&mut self, key: &str, value: &[u8]) -> io::Result<()> {
        self.stream
            .write_all(format!("set {key} 0 0 {}\r\n", value.len()).as_bytes())
            .await?;
        self.stream.write_all(value).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;

        let reply = self.read_line().await?;
        if reply == "STORED" {
            Ok(())
        } else {
            Err(protocol_error(format!("set failed: {reply:?}")))
        }
    }

    async fn delete(&mut self, key: &str) -> io::Result<bool> {
        self.stream
            .write_all(format!("delete {key}\r\n").as_bytes())
            .await?;
        self.stream.flush().await?;
        match self.read_line().await?.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            other => Err(protocol_error(format!("delete failed: {other:?}"))),
        }
    }

    async fn flush_all(&mut self) -> io::Result<()> {
        self.stream.write_all(b"flush_all\r\n").await?;
        self.stream.flush().await?;
        let reply = self.read_line().await?;
        if reply == "OK" {
            Ok(())
        } else {
            Err(protocol_error(format!("flush_all failed: {reply:?}")))
        }
    }

    async fn stats(&mut self) -> io::Result<Vec<(String, String)>> {
        self.stream.write_all(b"stats\r\n").await?;
        self.stream.flush().await?;
        let mut out = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "END" {
                return Ok(out);
            }
            let mut parts = line.splitn(3, ' ');
            if let (Some("STAT"), Some(name), Some(value)) = (parts.next(), parts.next(), parts.next())
            {
                out.push((name.to_string(), value.to_string()));
            }
        }
    }
}

// =============================================================================
// Backend
// =============================================================================

struct Server {
    address: String,
    conn: Mutex<Option<Connection>>,
}

/// Memcached-backed payload store.
pub struct MemcachedBackend {
    servers: Vec<Server>,
    options: MemcachedOptions,
    /// Wire keys this process stored, for predicate invalidation
    known: Mutex<LruCache<String, CacheKey>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemcachedBackend {
    /// Create a backend; connections are opened on first use.
    pub fn new(options: MemcachedOptions) -> Self {
        let servers = options
            .servers
            .iter()
            .map(|address| Server {
                address: address.clone(),
                conn: Mutex::new(None),
            })
            .collect();
        let tracked = NonZeroUsize::new(TRACKED_KEYS).unwrap_or(NonZeroUsize::MIN);
        Self {
            servers,
            options,
            known: Mutex::new(LruCache::new(tracked)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn server_for(&self, wire_key: &str) -> Option<&Server> {
        if self.servers.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        wire_key.hash(&mut hasher);
        let index = (hasher.finish() % self.servers.len() as u64) as usize;
        self.servers.get(index)
    }

    /// Run one operation on a server, reconnecting as needed.
    ///
    /// Any error or timeout drops the connection and yields `None`.
    async fn with_conn<T, F>(&self, server: &Server, op: &'static str, f: F) -> Option<T>
    where
        T: Send,
        F: Send
            + for<'c> FnOnce(
            &'c mut Connection,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<T>> + Send + 'c>>,
    {
        let mut guard = server.conn.lock().await;
        let result = tokio::time::timeout(self.options.timeout, async {
            if guard.is_none() {
                *guard = Some(Connection::open(&server.address, &self.options).await?);
            }
            match guard.as_mut() {
                Some(conn) => f(conn).await,
                None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            }
        })
        .await;

        match result {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(server = %server.address, op, error = %e, "memcached operation failed");
                *guard = None;
                None
            }
            Err(_) => {
                warn!(server = %server.address, op, "memcached operation timed out");
                *guard = None;
                None
            }
        }
    }
}

#[async_trait]
impl CacheBackend for MemcachedBackend {
    fn name(&self) -> &'static str {
        "memcached"
    }

    async fn get(&self, key: &CacheKey) -> Option<TilePayload> {
        let wire_key = key.wire_key();
        let server = self.server_for(&wire_key)?;
        let k = wire_key.clone();
        let raw = self
            .with_conn(server, "get", move |c| Box::pin(async move { c.get(&k).await }))
            .await
            .flatten();

        let payload = raw.and_then(|bytes| match WirePayload::decode(&bytes) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(error = %e, "discarding undecodable memcached value");
                None
            }
        });
        match payload {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        payload
    }

    async fn set(&self, key: CacheKey, value: TilePayload, _cost: usize) {
        let wire_key = key.wire_key();
        let Some(server) = self.server_for(&wire_key) else {
            return;
        };
        let bytes = match WirePayload::encode(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cannot serialize tile for memcached");
                return;
            }
        };
        if bytes.len() > MAX_ITEM_SIZE {
            debug!(size = bytes.len(), "tile too large for memcached, not stored");
            return;
        }
        let k = wire_key.clone();
        let stored = self
            .with_conn(server, "set", move |c| {
                Box::pin(async move { c.store(&k, &bytes).await })
            })
            .await;
        if stored.is_some() {
            self.known.lock().await.put(wire_key, key);
        }
    }

    async fn invalidate(&self, predicate: KeyPredicate<'_>) -> usize {
        let doomed: Vec<String> = {
            let known = self.known.lock().await;
            known
                .iter()
                .filter(|(_, k)| predicate(k))
                .map(|(w, _)| w.clone())
                .collect()
        };

        let mut removed = 0;
        for wire_key in doomed {
            self.known.lock().await.pop(&wire_key);
            let Some(server) = self.server_for(&wire_key) else {
                continue;
            };
            let deleted = self
                .with_conn(server, "delete", move |c| {
                    Box::pin(async move { c.delete(&wire_key).await })
                })
                .await;
            if deleted == Some(true) {
                removed += 1;
            }
        }
        removed
    }

    async fn clear(&self) {
        for server in &self.servers {
            self.with_conn(server, "flush_all", |c| Box::pin(c.flush_all()))
                .await;
        }
        self.known.lock().await.clear();
    }

    async fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ..Default::default()
        };
        for server in &self.servers {
            let Some(values) = self
                .with_conn(server, "stats", |c| Box::pin(c.stats()))
                .await
            else {
                continue;
            };
            for (name, value) in values {
                let value: usize = value.parse().unwrap_or(0);
                match name.as_str() {
                    "curr_items" => stats.entries += value,
                    "bytes" => stats.bytes += value,
                    "limit_maxbytes" => stats.capacity += value,
                    _ => {}
                }
            }
        }
        stats
    }
}

// =============================================================================
// Tests
// =============================================================================
