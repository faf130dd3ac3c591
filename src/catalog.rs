//! Service catalog: canonical professions, their synonyms and the city
//! synonym table.
//!
//! The profession map lives in the `service_synonyms` table and is cached
//! two levels deep: a shared K/V snapshot under a fixed key (so several
//! instances reload at most once per TTL) and a process-local snapshot
//! behind an `RwLock`. The reverse (normalized synonym → canonical) map is
//! rebuilt whole on every load and swapped atomically; readers see either
//! the old or the new snapshot, never a half-built one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::kv::{self, KvStore};
use crate::text::normalize;

/// Fixed K/V key of the shared catalog snapshot.
pub const CATALOG_CACHE_KEY: &str = "service_synonyms:catalog";

/// Ecuadorian cities and their accepted variants.
///
/// The first element is the canonical name; the rest are misspellings and
/// accent-free forms seen in real traffic.
const CITY_SYNONYMS: &[(&str, &[&str])] = &[
    ("Quito", &["quito"]),
    ("Guayaquil", &["guayaquil"]),
    ("Cuenca", &["cuenca", "cueca"]),
    ("Santo Domingo", &["santo domingo", "santo domingo de los tsachilas"]),
    ("Manta", &["manta"]),
    ("Portoviejo", &["portoviejo"]),
    ("Machala", &["machala"]),
    ("Durán", &["duran"]),
    ("Loja", &["loja"]),
    ("Ambato", &["ambato"]),
    ("Riobamba", &["riobamba"]),
    ("Esmeraldas", &["esmeraldas"]),
    ("Quevedo", &["quevedo"]),
    ("Babahoyo", &["babahoyo", "baba hoyo"]),
    ("Milagro", &["milagro"]),
    ("Ibarra", &["ibarra"]),
    ("Tulcán", &["tulcan"]),
    ("Latacunga", &["latacunga"]),
    ("Salinas", &["salinas"]),
];

/// Resolve text to a canonical city by normalized equality against the
/// canonical names and their synonyms.
pub fn resolve_city(text: &str) -> Option<String> {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return None;
    }
    for (canonical, synonyms) in CITY_SYNONYMS {
        if normalize(canonical) == normalized {
            return Some((*canonical).to_owned());
        }
        for synonym in *synonyms {
            if normalize(synonym) == normalized {
                return Some((*canonical).to_owned());
            }
        }
    }
    None
}

/// Canonical city names in table order.
pub fn all_cities() -> Vec<&'static str> {
    CITY_SYNONYMS.iter().map(|(canonical, _)| *canonical).collect()
}

type SynonymMap = BTreeMap<String, BTreeSet<String>>;

/// An immutable catalog snapshot: forward map plus precomputed reverse map.
struct Snapshot {
    forward: SynonymMap,
    /// normalized synonym → canonical, including each canonical itself.
    reverse: Vec<(String, String)>,
    loaded_at: Instant,
}

impl Snapshot {
    fn build(forward: SynonymMap) -> Self {
        let mut reverse = Vec::new();
        for (canonical, synonyms) in &forward {
            let normalized = normalize(canonical);
            if !normalized.is_empty() {
                reverse.push((normalized, canonical.clone()));
            }
            for synonym in synonyms {
                let normalized = normalize(synonym);
                if !normalized.is_empty() {
                    reverse.push((normalized, canonical.clone()));
                }
            }
        }
        Self {
            forward,
            reverse,
            loaded_at: Instant::now(),
        }
    }
}

/// Profession catalog with TTL-cached snapshots.
pub struct ServiceCatalog {
    pool: SqlitePool,
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl ServiceCatalog {
    /// Create a catalog reading from `pool` and caching through `kv` with
    /// the given snapshot `ttl`.
    pub fn new(pool: SqlitePool, kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            pool,
            kv,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    /// Resolve free text to a canonical profession.
    ///
    /// Exact normalized lookup first; on miss, containment in either
    /// direction. Returns `None` when the catalog is empty or nothing
    /// matches (the caller falls through to the LLM).
    pub async fn resolve_profession(&self, text: &str) -> Option<String> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }
        let snapshot = self.current().await?;

        for (synonym, canonical) in &snapshot.reverse {
            if *synonym == normalized {
                return Some(canonical.clone());
            }
        }
        for (synonym, canonical) in &snapshot.reverse {
            if synonym.contains(&normalized) || normalized.contains(synonym.as_str()) {
                return Some(canonical.clone());
            }
        }
        None
    }

    /// The synonym set of a canonical profession, the canonical included.
    /// Used to expand search terms.
    pub async fn expand_profession(&self, canonical: &str) -> Vec<String> {
        let mut terms = vec![canonical.to_owned()];
        if let Some(snapshot) = self.current().await {
            if let Some(synonyms) = snapshot.forward.get(canonical) {
                for synonym in synonyms {
                    if !terms.iter().any(|t| t == synonym) {
                        terms.push(synonym.clone());
                    }
                }
            }
        }
        terms
    }

    /// All canonical professions, sorted.
    pub async fn all_canonical_professions(&self) -> Vec<String> {
        match self.current().await {
            Some(snapshot) => snapshot.forward.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Force a reload from the relational store, replacing both the shared
    /// and the local snapshot.
    pub async fn refresh(&self) {
        match self.load_from_store().await {
            Ok(forward) => self.install(forward).await,
            Err(e) => warn!(error = %e, "catalog refresh failed, keeping current snapshot"),
        }
    }

    /// Current snapshot, loading through the cache hierarchy when the local
    /// one is missing or stale. Falls back to the stale local snapshot when
    /// both the shared cache and the store are unreachable.
    async fn current(&self) -> Option<Arc<Snapshot>> {
        if let Some(snapshot) = self.fresh_local().await {
            return Some(snapshot);
        }

        // Shared snapshot first, then the store.
        if let Ok(Some(forward)) = kv::get_record::<SynonymMap>(self.kv.as_ref(), CATALOG_CACHE_KEY).await {
            if !forward.is_empty() {
                let snapshot = Arc::new(Snapshot::build(forward));
                *self.snapshot.write().await = Some(Arc::clone(&snapshot));
                return Some(snapshot);
            }
        }

        match self.load_from_store().await {
            Ok(forward) if !forward.is_empty() => {
                self.install(forward).await;
                self.snapshot.read().await.clone()
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "catalog load failed, serving stale snapshot");
                self.snapshot.read().await.clone()
            }
        }
    }

    async fn fresh_local(&self) -> Option<Arc<Snapshot>> {
        let guard = self.snapshot.read().await;
        let snapshot = guard.as_ref()?;
        (snapshot.loaded_at.elapsed() < self.ttl).then(|| Arc::clone(snapshot))
    }

    async fn install(&self, forward: SynonymMap) {
        let professions = forward.len();
        let synonyms: usize = forward.values().map(BTreeSet::len).sum();

        if let Err(e) = kv::set_record(
            self.kv.as_ref(),
            CATALOG_CACHE_KEY,
            &forward,
            Some(self.ttl),
        )
        .await
        {
            warn!(error = %e, "failed to publish catalog snapshot to kv");
        }

        let snapshot = Arc::new(Snapshot::build(forward));
        *self.snapshot.write().await = Some(snapshot);
        info!(professions, synonyms, "service catalog loaded");
    }

    async fn load_from_store(&self) -> Result<SynonymMap, sqlx::Error> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT canonical_profession, synonym FROM service_synonyms WHERE active = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut forward: SynonymMap = BTreeMap::new();
        for (canonical, synonym) in rows {
            forward.entry(canonical).or_default().insert(synonym);
        }
        Ok(forward)
    }
}
