use crate::entity::{Permission, Session};
use crate::memory::MemoryPressure;
use anyhow::anyhow;
use app_error::AppError;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

/// Namespace for tier-2 entries so a shared redis can host other keyspaces.
const SHARED_CACHE_PREFIX: &str = "ac:perm:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  /// Lifetime of a tier-1 entry.
  pub entry_ttl: Duration,
  /// Lifetime of a tier-2 entry.
  pub shared_entry_ttl: Duration,
  /// Interval between GC passes while memory is healthy.
  pub gc_interval: Duration,
  /// Interval between GC passes while under memory pressure.
  pub gc_interval_aggressive: Duration,
  /// Used/max ratio above which the aggressive GC mode engages.
  pub memory_pressure_threshold: f64,
  /// How long shutdown waits for the GC task before aborting it.
  pub shutdown_timeout: Duration,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      entry_ttl: Duration::from_secs(30 * 60),
      shared_entry_ttl: Duration::from_secs(30 * 60),
      gc_interval: Duration::from_secs(5 * 60),
      gc_interval_aggressive: Duration::from_secs(60),
      memory_pressure_threshold: 0.85,
      shutdown_timeout: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone)]
struct CachedEntry {
  granted: bool,
  cached_at: Instant,
  ttl: Duration,
}

impl CachedEntry {
  fn is_expired(&self) -> bool {
    self.cached_at.elapsed() > self.ttl
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
  pub total_entries: usize,
  pub expired_entries: usize,
}

/// Tier-2 port: a shared cache visible to every instance of the service.
/// Implementations must expire entries on their own (the core never purges
/// tier-2 on session invalidation).
#[async_trait]
pub trait SharedPermissionCache: Send + Sync + 'static {
  async fn get(&self, key: &str) -> Result<Option<bool>, AppError>;
  async fn put(&self, key: &str, granted: bool, ttl: Duration) -> Result<(), AppError>;
}

/// Tier-2 backed by redis, entries expiring via `SET .. EX`.
#[derive(Clone)]
pub struct RedisPermissionCache {
  conn: redis::aio::ConnectionManager,
}

impl RedisPermissionCache {
  pub async fn new(client: redis::Client) -> Result<Self, AppError> {
    let conn = client
      .get_connection_manager()
      .await
      .map_err(|e| AppError::Internal(anyhow!("connect to redis: {}", e)))?;
    Ok(Self { conn })
  }
}

#[async_trait]
impl SharedPermissionCache for RedisPermissionCache {
  async fn get(&self, key: &str) -> Result<Option<bool>, AppError> {
    let mut conn = self.conn.clone();
    conn
      .get::<String, Option<bool>>(format!("{}{}", SHARED_CACHE_PREFIX, key))
      .await
      .map_err(|e| AppError::Internal(anyhow!("get permission from redis: {}", e)))
  }

  async fn put(&self, key: &str, granted: bool, ttl: Duration) -> Result<(), AppError> {
    let mut conn = self.conn.clone();
    conn
      .set_ex::<String, bool, ()>(
        format!("{}{}", SHARED_CACHE_PREFIX, key),
        granted,
        ttl.as_secs().max(1),
      )
      .await
      .map_err(|e| AppError::Internal(anyhow!("set permission in redis: {}", e)))
  }
}

/// Tier-2 stand-in for deployments without a shared cache: every lookup
/// misses and writes vanish.
#[derive(Debug, Default, Clone)]
pub struct NoSharedCache;

#[async_trait]
impl SharedPermissionCache for NoSharedCache {
  async fn get(&self, _key: &str) -> Result<Option<bool>, AppError> {
    Ok(None)
  }

  async fn put(&self, _key: &str, _granted: bool, _ttl: Duration) -> Result<(), AppError> {
    Ok(())
  }
}

/// Two-tier cache of permission-check results keyed by session and
/// permission set. Tier-1 is an in-process map maintained by a background
/// GC task; tier-2 is the shared cache behind [`SharedPermissionCache`].
///
/// The cache is an optimization, never a correctness mechanism: every
/// failure path degrades to a miss and the caller re-checks against the
/// backend.
pub struct PermissionCache {
  tier1: Arc<DashMap<String, CachedEntry>>,
  shared: Arc<dyn SharedPermissionCache>,
  settings: CacheSettings,
  gc_token: CancellationToken,
  gc_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PermissionCache {
  pub fn new(
    shared: Arc<dyn SharedPermissionCache>,
    pressure: Arc<dyn MemoryPressure>,
    settings: CacheSettings,
  ) -> Self {
    let tier1: Arc<DashMap<String, CachedEntry>> = Arc::new(DashMap::new());
    let gc_token = CancellationToken::new();
    let gc_handle = tokio::spawn(run_gc(
      tier1.clone(),
      pressure,
      settings.clone(),
      gc_token.clone(),
    ));
    Self {
      tier1,
      shared,
      settings,
      gc_token,
      gc_handle: Mutex::new(Some(gc_handle)),
    }
  }

  /// Composite key: `session_id + ":"` then each permission's policy key
  /// terminated by `"|"`, preserving argument order.
  pub fn cache_key(session: &Session, permissions: &[Permission]) -> String {
    let mut key = String::with_capacity(permissions.len() * 24 + session.session_id.len() + 1);
    key.push_str(&session.session_id);
    key.push(':');
    for permission in permissions {
      key.push_str(&permission.policy_key());
      key.push('|');
    }
    key
  }

  /// Look up a cached decision for the permission set. Tier-1 is consulted
  /// first; a fresh tier-2 hit repopulates tier-1. `None` means the caller
  /// must perform a real check.
  pub async fn get_permissions(&self, session: &Session, permissions: &[Permission]) -> Option<bool> {
    let key = Self::cache_key(session, permissions);

    // The read guard must be released before removing an expired entry.
    let mut expired = false;
    if let Some(entry) = self.tier1.get(&key) {
      if !entry.is_expired() {
        trace!("[access control]: cache hit (tier-1) key={}", key);
        return Some(entry.granted);
      }
      expired = true;
    }
    if expired {
      self.tier1.remove(&key);
    }

    match self.shared.get(&key).await {
      Ok(Some(granted)) => {
        trace!("[access control]: cache hit (tier-2) key={}", key);
        self.insert_tier1(key, granted);
        Some(granted)
      },
      Ok(None) => None,
      Err(err) => {
        // Fail-open as a miss: the caller falls through to the backend.
        error!("[access control]: shared cache read failed: {}", err);
        None
      },
    }
  }

  /// Record a decision in both tiers. Last write wins.
  pub async fn put_permissions(&self, session: &Session, permissions: &[Permission], granted: bool) {
    let key = Self::cache_key(session, permissions);
    self.insert_tier1(key.clone(), granted);

    if let Err(err) = self
      .shared
      .put(&key, granted, self.settings.shared_entry_ttl)
      .await
    {
      error!("[access control]: shared cache write failed: {}", err);
    }
  }

  /// Drop every tier-1 entry cached under the session. Tier-2 entries are
  /// left to expire on their TTL, which trades staleness on other instances
  /// for not fanning deletes out across the shared cache.
  pub fn invalidate_session(&self, session: &Session) {
    let prefix = format!("{}:", session.session_id);
    let before = self.tier1.len();
    self.tier1.retain(|key, _| !key.starts_with(&prefix));
    trace!(
      "[access control]: invalidated {} cached entries for session {}",
      before.saturating_sub(self.tier1.len()),
      session.session_id
    );
  }

  pub fn stats(&self) -> CacheStats {
    let total_entries = self.tier1.len();
    let expired_entries = self
      .tier1
      .iter()
      .filter(|entry| entry.value().is_expired())
      .count();
    CacheStats {
      total_entries,
      expired_entries,
    }
  }

  /// Stop the GC task, wait for it to drain, then drop tier-1 state. The
  /// task must be gone before the clear so a late GC pass cannot touch a
  /// map being torn down.
  pub async fn shutdown(&self) {
    self.gc_token.cancel();
    let handle = self.gc_handle.lock().unwrap().take();
    if let Some(handle) = handle {
      let abort = handle.abort_handle();
      if timeout(self.settings.shutdown_timeout, handle).await.is_err() {
        warn!("[access control]: cache GC task did not stop in time, aborting");
        abort.abort();
      }
    }
    self.tier1.clear();
  }

  fn insert_tier1(&self, key: String, granted: bool) {
    self.tier1.insert(
      key,
      CachedEntry {
        granted,
        cached_at: Instant::now(),
        ttl: self.settings.entry_ttl,
      },
    );
  }
}

/// Background GC: a two-state loop re-evaluated each tick. While memory is
/// healthy it removes expired entries on the normal interval; under
/// pressure it clears the whole tier and reschedules on the aggressive
/// interval until pressure subsides.
async fn run_gc(
  tier1: Arc<DashMap<String, CachedEntry>>,
  pressure: Arc<dyn MemoryPressure>,
  settings: CacheSettings,
  token: CancellationToken,
) {
  let mut aggressive = false;
  loop {
    let wait = if aggressive {
      settings.gc_interval_aggressive
    } else {
      settings.gc_interval
    };
    tokio::select! {
      _ = token.cancelled() => break,
      _ = sleep(wait) => {},
    }

    let ratio = pressure.usage_ratio();
    if ratio > settings.memory_pressure_threshold {
      let dropped = tier1.len();
      tier1.clear();
      warn!(
        "[access control]: memory pressure {:.2}, cleared {} cached permission entries",
        ratio, dropped
      );
      aggressive = true;
    } else {
      let before = tier1.len();
      tier1.retain(|_, entry| !entry.is_expired());
      trace!(
        "[access control]: cache GC removed {} expired entries",
        before.saturating_sub(tier1.len())
      );
      aggressive = false;
    }
  }
}
