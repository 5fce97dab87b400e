//! Cluster identity resolution with a time-bounded cache.
//!
//! Entries are advisory: expiry or a miss always falls back to live backend
//! queries, and a failing cluster is skipped rather than aborting the whole
//! resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fabricfs_connect::ClusterConnector;
use tracing::debug;

use crate::error::{ControllerError, Result};

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum CacheKey {
    Name(String),
    Id(String),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    id: String,
    name: String,
    last_updated: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.last_updated.elapsed() >= self.ttl
    }
}

/// Name/id keyed cache of cluster identities, scoped to one driver
/// instance.
pub struct ClusterIdentityCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
}

impl Default for ClusterIdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterIdentityCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn store(&self, id: &str, name: &str) {
        let entry = CacheEntry {
            id: id.to_string(),
            name: name.to_string(),
            last_updated: Instant::now(),
            ttl: self.ttl,
        };
        self.entries
            .insert(CacheKey::Name(name.to_string()), entry.clone());
        self.entries.insert(CacheKey::Id(id.to_string()), entry);
    }

    fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Queries a cluster's live summary and refreshes both cache entries.
    /// Returns the live cluster name, or `None` when the cluster cannot be
    /// reached (the caller moves on to the next candidate).
    async fn refresh(
        &self,
        cluster_id: &str,
        connectors: &HashMap<String, Arc<dyn ClusterConnector>>,
    ) -> Option<String> {
        let conn = connectors.get(cluster_id)?;
        match conn.cluster_summary().await {
            Ok(summary) => {
                self.store(cluster_id, &summary.cluster_name);
                debug!(cluster_id, name = %summary.cluster_name, "cluster cache updated");
                Some(summary.cluster_name)
            }
            Err(err) => {
                debug!(cluster_id, %err, "unable to get cluster summary, skipping");
                None
            }
        }
    }

    /// Resolves a cluster name to its cluster id.
    ///
    /// Fresh cache hits answer directly. An expired name entry is
    /// re-validated against the live summary of the cached id; if the name
    /// moved, resolution falls through to a sweep over every configured
    /// cluster. Only after the sweep exhausts all clusters is the name
    /// reported unknown.
    pub async fn resolve(
        &self,
        cluster_name: &str,
        configured_ids: &[String],
        connectors: &HashMap<String, Arc<dyn ClusterConnector>>,
    ) -> Result<String> {
        if let Some(cached) = self.lookup(&CacheKey::Name(cluster_name.to_string())) {
            if !cached.expired() {
                return Ok(cached.id);
            }
            debug!(cluster = cluster_name, "cached cluster details expired, re-validating");
            if let Some(live_name) = self.refresh(&cached.id, connectors).await {
                if live_name == cluster_name {
                    return Ok(cached.id);
                }
            }
        }

        for cluster_id in configured_ids {
            if let Some(cached) = self.lookup(&CacheKey::Id(cluster_id.clone())) {
                if !cached.expired() {
                    if cached.name == cluster_name {
                        return Ok(cluster_id.clone());
                    }
                    continue;
                }
            }
            if let Some(live_name) = self.refresh(cluster_id, connectors).await {
                if live_name == cluster_name {
                    return Ok(cluster_id.clone());
                }
            }
        }

        Err(ControllerError::Internal(format!(
            "unable to get cluster ID for cluster {cluster_name}"
        )))
    }
}
