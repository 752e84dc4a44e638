//! Packet cache with TTL enforcement and LRU eviction
//!
//! One packet per exact key. Reads check expiry and integrity before serving;
//! expired entries are misses and corrupt entries are purged. When the cache
//! is full the least-recently-used key is evicted.

use crate::cache::packet::{AdvisoryPacket, PacketKey};
use crate::config::CacheConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outcome feedback applied to a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFeedback {
    /// Linked positive outcome
    Positive,
    /// Linked negative outcome
    Negative,
    /// Delivery expired without any outcome
    Unused,
}

/// How a lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMatch {
    Exact,
    Relaxed,
}

/// Cache counters exposed in the status snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub exact_hits: u64,
    pub relaxed_hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub corrupt: u64,
    pub evictions: u64,
    pub invalidated: u64,
    pub writes: u64,
    pub rejected_writes: u64,
}

/// Shared packet cache
pub struct PacketCache {
    inner: Arc<RwLock<CacheInner>>,
}

struct CacheInner {
    /// Exact key string -> packet
    packets: HashMap<String, AdvisoryPacket>,
    /// packet_id -> exact key string
    ids: HashMap<String, String>,
    /// LRU order: front = oldest
    order: VecDeque<String>,
    capacity: usize,
    stats: CacheStats,
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) -> Option<AdvisoryPacket> {
        let packet = self.packets.remove(key)?;
        self.ids.remove(&packet.packet_id);
        self.order.retain(|k| k != key);
        Some(packet)
    }

    fn evict_lru(&mut self) {
        if let Some(key) = self.order.pop_front() {
            if let Some(packet) = self.packets.remove(&key) {
                self.ids.remove(&packet.packet_id);
                self.stats.evictions += 1;
                tracing::debug!(packet_id = %packet.packet_id, "Evicted LRU packet");
            }
        }
    }
}

/// Similarity of a stored key to a requested key, or `None` when projects differ.
pub fn relaxed_score(
    requested: &PacketKey,
    packet: &AdvisoryPacket,
    config: &CacheConfig,
    now: DateTime<Utc>,
) -> Option<f64> {
    if requested.project_id != packet.key.project_id {
        return None;
    }
    let matches = |a: &str, b: &str| if a == b { 1.0 } else { 0.0 };
    let ttl = packet.ttl_secs.max(1) as f64;
    let age = (now - packet.created_at).num_milliseconds().max(0) as f64 / 1000.0;
    let recency = (1.0 - age / ttl).clamp(0.0, 1.0);

    Some(
        matches(&requested.tool, &packet.key.tool) * config.tool_weight
            + matches(&requested.intent_cluster, &packet.key.intent_cluster) * config.intent_weight
            + matches(&requested.domain_category, &packet.key.domain_category)
                * config.domain_weight
            + recency * config.recency_weight,
    )
}

fn file_scopes_intersect(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Whether a packet falls inside an invalidation scope
pub fn scope_matches(packet: &AdvisoryPacket, scope: &str) -> bool {
    let scope = scope.trim();
    if scope.is_empty() {
        return false;
    }
    if let Some(path) = scope.strip_prefix("file:") {
        return packet
            .scope_keys
            .iter()
            .filter_map(|k| k.strip_prefix("file:"))
            .any(|p| file_scopes_intersect(p, path));
    }
    if let Some(project) = scope.strip_prefix("project:") {
        return packet.key.project_id == project;
    }
    if let Some(tool) = scope.strip_prefix("tool:") {
        return packet.key.tool == tool;
    }
    packet.key.has_component(scope)
        || packet.scope_keys.iter().any(|k| {
            k == scope || k.split_once(':').map(|(_, v)| v == scope).unwrap_or(false)
        })
}

impl PacketCache {
    /// Create an empty cache holding at most `capacity` packets
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                packets: HashMap::new(),
                ids: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
                stats: CacheStats {
                    capacity: capacity.max(1),
                    ..Default::default()
                },
            })),
        }
    }

    /// Store a packet. Returns `false` when an existing packet under the same
    /// key supersedes it.
    pub async fn put(&self, packet: AdvisoryPacket) -> bool {
        let key = packet.key.to_string();
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.packets.get(&key) {
            if !existing.is_corrupt() && !packet.supersedes(existing) {
                inner.stats.rejected_writes += 1;
                return false;
            }
            inner.remove(&key);
        } else if inner.packets.len() >= inner.capacity {
            inner.evict_lru();
        }

        tracing::debug!(packet_id = %packet.packet_id, key = %key, "Stored packet");
        inner.ids.insert(packet.packet_id.clone(), key.clone());
        inner.packets.insert(key.clone(), packet);
        inner.order.push_back(key);
        inner.stats.writes += 1;
        true
    }

    /// Exact lookup. Expired and corrupt packets are misses.
    pub async fn get_exact(&self, key: &PacketKey, now: DateTime<Utc>) -> Option<AdvisoryPacket> {
        let key = key.to_string();
        let mut inner = self.inner.write().await;

        let packet = match inner.packets.get(&key) {
            Some(p) => p.clone(),
            None => return None,
        };

        if packet.is_corrupt() {
            tracing::warn!(packet_id = %packet.packet_id, "Purging corrupt packet");
            inner.remove(&key);
            inner.stats.corrupt += 1;
            return None;
        }
        if packet.is_expired(now) {
            inner.remove(&key);
            inner.stats.expired += 1;
            return None;
        }

        inner.touch(&key);
        Some(packet)
    }

    /// Best packet by similarity, above `relaxed_min_score` and `min_effectiveness`.
    pub async fn get_relaxed(
        &self,
        key: &PacketKey,
        config: &CacheConfig,
        now: DateTime<Utc>,
    ) -> Option<(AdvisoryPacket, f64)> {
        let mut inner = self.inner.write().await;

        let corrupt: Vec<String> = inner
            .packets
            .iter()
            .filter(|(_, p)| p.is_corrupt())
            .map(|(k, _)| k.clone())
            .collect();
        for k in &corrupt {
            inner.remove(k);
            inner.stats.corrupt += 1;
        }

        let best = inner
            .packets
            .iter()
            .filter(|(_, p)| !p.is_expired(now))
            .filter(|(_, p)| p.effectiveness_score >= config.min_effectiveness)
            .filter_map(|(k, p)| relaxed_score(key, p, config, now).map(|s| (k, p, s)))
            .filter(|(_, _, s)| *s >= config.relaxed_min_score)
            .max_by(|a, b| {
                a.2.partial_cmp(&b.2)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.created_at.cmp(&b.1.created_at))
            })
            .map(|(k, p, s)| (k.clone(), p.clone(), s));

        let (k, packet, score) = best?;
        inner.touch(&k);
        Some((packet, score))
    }

    /// Exact lookup first, then relaxed. Updates hit/miss counters.
    pub async fn lookup(
        &self,
        key: &PacketKey,
        config: &CacheConfig,
        now: DateTime<Utc>,
    ) -> Option<(AdvisoryPacket, CacheMatch)> {
        if let Some(packet) = self
            .get_exact(key, now)
            .await
            .filter(|p| p.effectiveness_score >= config.min_effectiveness)
        {
            self.inner.write().await.stats.exact_hits += 1;
            return Some((packet, CacheMatch::Exact));
        }
        if let Some((packet, score)) = self.get_relaxed(key, config, now).await {
            tracing::debug!(packet_id = %packet.packet_id, score, "Relaxed packet match");
            self.inner.write().await.stats.relaxed_hits += 1;
            return Some((packet, CacheMatch::Relaxed));
        }
        self.inner.write().await.stats.misses += 1;
        None
    }

    /// Whether a servable packet exists for the exact key
    pub async fn has_fresh(&self, key: &PacketKey, now: DateTime<Utc>) -> bool {
        self.inner
            .read()
            .await
            .packets
            .get(&key.to_string())
            .map(|p| !p.is_corrupt() && !p.is_expired(now))
            .unwrap_or(false)
    }

    /// Remove every packet intersecting `scope`. Returns the number removed.
    pub async fn invalidate(&self, scope: &str) -> usize {
        let mut inner = self.inner.write().await;
        let doomed: Vec<String> = inner
            .packets
            .iter()
            .filter(|(_, p)| scope_matches(p, scope))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            inner.remove(k);
        }
        inner.stats.invalidated += doomed.len() as u64;
        if !doomed.is_empty() {
            tracing::info!(scope = %scope, count = doomed.len(), "Invalidated packets");
        }
        doomed.len()
    }

    /// Apply outcome feedback. Returns the new effectiveness score.
    pub async fn apply_feedback(
        &self,
        packet_id: &str,
        feedback: PacketFeedback,
        config: &CacheConfig,
    ) -> Option<f64> {
        let mut inner = self.inner.write().await;
        let key = inner.ids.get(packet_id)?.clone();
        let packet = inner.packets.get_mut(&key)?;

        let delta = match feedback {
            PacketFeedback::Positive => {
                packet.usage_count += 1;
                config.positive_boost
            }
            PacketFeedback::Negative => {
                packet.usage_count += 1;
                -config.negative_decay
            }
            PacketFeedback::Unused => -config.unused_decay,
        };
        packet.effectiveness_score = (packet.effectiveness_score + delta).clamp(0.0, 1.0);
        Some(packet.effectiveness_score)
    }

    /// Get a packet by id without touching LRU order
    pub async fn peek(&self, packet_id: &str) -> Option<AdvisoryPacket> {
        let inner = self.inner.read().await;
        let key = inner.ids.get(packet_id)?;
        inner.packets.get(key).cloned()
    }

    /// Drop expired packets. Returns the number removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .packets
            .iter()
            .filter(|(_, p)| p.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            inner.remove(k);
        }
        inner.stats.expired += expired.len() as u64;
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.packets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.packets.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            entries: inner.packets.len(),
            ..inner.stats.clone()
        }
    }

    /// Export packets for persistence, oldest first
    pub async fn export(&self) -> Vec<AdvisoryPacket> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|k| inner.packets.get(k).cloned())
            .collect()
    }

    /// Load persisted packets, skipping corrupt and expired ones
    pub async fn import(&self, packets: Vec<AdvisoryPacket>, now: DateTime<Utc>) -> usize {
        let mut loaded = 0;
        for packet in packets {
            if let Err(e) = packet.validate() {
                tracing::warn!(error = %e, "Skipping persisted packet");
                continue;
            }
            if packet.is_expired(now) {
                continue;
            }
            if self.put(packet).await {
                loaded += 1;
            }
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::types::AuthorityTier;
    use chrono::Duration;

    fn key(tool: &str, intent: &str) -> PacketKey {
        PacketKey::new("proj", "implementation", "backend", tool, intent)
    }

    fn packet(key: PacketKey, text: &str, now: DateTime<Utc>) -> AdvisoryPacket {
        AdvisoryPacket::new(key, text, AuthorityTier::Note, 0.6, 900, 0.5, now)
    }

    #[tokio::test]
    async fn test_exact_returns_last_written_until_ttl() {
        let cache = PacketCache::new(10);
        let now = Utc::now();
        let k = key("Edit", "auth_security");

        cache.put(packet(k.clone(), "first", now)).await;
        cache
            .put(packet(k.clone(), "second", now + Duration::seconds(1)))
            .await;

        let hit = cache.get_exact(&k, now + Duration::seconds(2)).await.unwrap();
        assert_eq!(hit.synthesized_text, "second");

        assert!(cache.get_exact(&k, now + Duration::seconds(901)).await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_write_resolution() {
        let cache = PacketCache::new(10);
        let now = Utc::now();
        let k = key("Edit", "auth_security");

        let mut strong = packet(k.clone(), "strong", now);
        strong.confidence = 0.9;
        let mut weak = packet(k.clone(), "weak", now);
        weak.confidence = 0.4;

        assert!(cache.put(strong).await);
        assert!(!cache.put(weak).await);
        assert_eq!(cache.get_exact(&k, now).await.unwrap().synthesized_text, "strong");

        let older = packet(k.clone(), "older", now - Duration::seconds(5));
        assert!(!cache.put(older).await);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_miss_and_purged() {
        let cache = PacketCache::new(10);
        let now = Utc::now();
        let k = key("Edit", "auth_security");

        let mut bad = packet(k.clone(), "text", now);
        bad.effectiveness_score = f64::NAN;
        cache.put(bad).await;

        assert!(cache.get_exact(&k, now).await.is_none());
        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.stats().await.corrupt, 1);
    }

    #[tokio::test]
    async fn test_relaxed_lookup() {
        let cache = PacketCache::new(10);
        let config = CacheConfig::default();
        let now = Utc::now();

        cache
            .put(packet(key("Edit", "auth_security"), "auth advice", now))
            .await;

        // Same tool and intent, different phase: relaxed hit
        let other_phase = PacketKey::new("proj", "testing", "backend", "Edit", "auth_security");
        let (hit, m) = cache.lookup(&other_phase, &config, now).await.unwrap();
        assert_eq!(m, CacheMatch::Relaxed);
        assert_eq!(hit.synthesized_text, "auth advice");

        // Different project never matches
        let other_project = PacketKey::new("other", "implementation", "backend", "Edit", "auth_security");
        assert!(cache.lookup(&other_project, &config, now).await.is_none());

        // Different tool and intent falls below the minimum
        let unrelated = key("Bash", "deployment_ops");
        assert!(cache.lookup(&unrelated, &config, now).await.is_none());
    }

    #[tokio::test]
    async fn test_relaxed_skips_ineffective() {
        let cache = PacketCache::new(10);
        let config = CacheConfig::default();
        let now = Utc::now();

        let mut p = packet(key("Edit", "auth_security"), "stale advice", now);
        p.effectiveness_score = 0.1;
        cache.put(p).await;

        let other_phase = PacketKey::new("proj", "testing", "backend", "Edit", "auth_security");
        assert!(cache.get_relaxed(&other_phase, &config, now).await.is_none());
        // Exact key is not served either
        assert!(cache
            .lookup(&key("Edit", "auth_security"), &config, now)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = PacketCache::new(2);
        let now = Utc::now();
        let a = key("A", "x");
        let b = key("B", "x");
        let c = key("C", "x");

        cache.put(packet(a.clone(), "a", now)).await;
        cache.put(packet(b.clone(), "b", now)).await;
        // Touch a so b becomes LRU
        cache.get_exact(&a, now).await;
        cache.put(packet(c.clone(), "c", now)).await;

        assert!(cache.get_exact(&a, now).await.is_some());
        assert!(cache.get_exact(&b, now).await.is_none());
        assert!(cache.get_exact(&c, now).await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_invalidate_scopes() {
        let cache = PacketCache::new(10);
        let now = Utc::now();

        cache
            .put(packet(key("Edit", "auth_security"), "a", now).with_file_scope(Some("src/auth/jwt.rs")))
            .await;
        cache
            .put(packet(key("Bash", "testing_validation"), "b", now).with_file_scope(Some("tests/it.rs")))
            .await;
        cache
            .put(packet(
                PacketKey::new("other", "unknown", "docs", "Write", "emergent_other"),
                "c",
                now,
            ))
            .await;

        assert_eq!(cache.invalidate("file:src/auth").await, 1);
        assert_eq!(cache.invalidate("tool:Bash").await, 1);
        assert_eq!(cache.invalidate("nothing").await, 0);
        assert_eq!(cache.invalidate("project:other").await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalidate_bare_component() {
        let cache = PacketCache::new(10);
        let now = Utc::now();
        cache.put(packet(key("Edit", "auth_security"), "a", now)).await;
        cache.put(packet(key("Edit", "refactor_cleanup"), "b", now)).await;

        assert_eq!(cache.invalidate("auth_security").await, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_feedback_adjusts_effectiveness() {
        let cache = PacketCache::new(10);
        let config = CacheConfig::default();
        let now = Utc::now();
        let p = packet(key("Edit", "auth_security"), "a", now);
        let id = p.packet_id.clone();
        cache.put(p).await;

        let up = cache.apply_feedback(&id, PacketFeedback::Positive, &config).await.unwrap();
        assert!((up - 0.6).abs() < 1e-9);
        let down = cache.apply_feedback(&id, PacketFeedback::Negative, &config).await.unwrap();
        assert!((down - 0.45).abs() < 1e-9);
        let unused = cache.apply_feedback(&id, PacketFeedback::Unused, &config).await.unwrap();
        assert!((unused - 0.40).abs() < 1e-9);

        assert_eq!(cache.peek(&id).await.unwrap().usage_count, 2);
        assert!(cache.apply_feedback("missing", PacketFeedback::Positive, &config).await.is_none());
    }

    #[tokio::test]
    async fn test_import_skips_expired() {
        let cache = PacketCache::new(10);
        let now = Utc::now();
        let fresh = packet(key("Edit", "a"), "fresh", now);
        let old = packet(key("Edit", "b"), "old", now - Duration::hours(1));

        assert_eq!(cache.import(vec![fresh, old], now).await, 1);
        assert_eq!(cache.export().await.len(), 1);
    }
}
