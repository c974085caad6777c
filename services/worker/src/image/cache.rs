//! Image cache with reference counting and opportunistic eviction.
//!
//! Every container holds a reference on its image. Images nobody references
//! stay on disk until admitting a new image would push the number of distinct
//! cached images past the cap; then the least recently used unreferenced
//! images are removed first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::normalize_image;
use crate::config::RegistryAuth;
use crate::error::WorkerError;
use crate::keyed_lock::KeyedLocks;
use crate::runtime::ContainerRuntime;

/// Configuration for the image cache.
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    /// Distinct images kept before unreferenced ones are evicted.
    pub max_images: usize,
    /// Credentials used for pulls.
    pub registry: Option<RegistryAuth>,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            max_images: 3,
            registry: None,
        }
    }
}

/// A cached image entry.
#[derive(Debug)]
struct CacheEntry {
    /// Number of containers using this image.
    ref_count: u32,
    /// A pull for this image is in progress.
    pending_pull: bool,
    /// Last acquire or release.
    last_used: Instant,
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub pulls: AtomicU64,
}

/// Image cache manager.
pub struct ImageCache {
    config: ImageCacheConfig,
    runtime: Arc<dyn ContainerRuntime>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// Serializes admission of the same image.
    admissions: KeyedLocks,
    stats: CacheStats,
}

impl ImageCache {
    /// Create a new image cache over `runtime`.
    pub fn new(config: ImageCacheConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            entries: RwLock::new(HashMap::new()),
            admissions: KeyedLocks::new(),
            stats: CacheStats::default(),
        }
    }

    /// Make the image available and take a reference on it.
    ///
    /// Returns the normalized image reference.
    pub async fn acquire(&self, image: &str) -> Result<String, WorkerError> {
        self.admit(image, true).await
    }

    /// Make the image available without referencing it.
    ///
    /// A second pull of a cached image is a no-op.
    pub async fn pull(&self, image: &str) -> Result<String, WorkerError> {
        self.admit(image, false).await
    }

    async fn admit(&self, image: &str, reference: bool) -> Result<String, WorkerError> {
        let image = normalize_image(image);
        let _guard = self.admissions.lock(&image).await;

        // The hit check, the eviction choice and the pending entry share one
        // write lock, so concurrent admissions of different images each see
        // the others' reserved slots.
        let victims = {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(&image) {
                if reference {
                    entry.ref_count += 1;
                }
                entry.last_used = Instant::now();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(image);
            }

            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            let victims = self.make_room(&mut entries, &image);
            entries.insert(
                image.clone(),
                CacheEntry {
                    ref_count: 0,
                    pending_pull: true,
                    last_used: Instant::now(),
                },
            );
            victims
        };

        for (victim, _victim_guard) in victims {
            if let Err(e) = self.runtime.remove_image(&victim).await {
                warn!(image = %victim, error = %e, "failed to remove evicted image");
            }
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            info!(image = %victim, "evicted image");
        }

        let fetched = self.fetch(&image).await;

        let mut entries = self.entries.write().await;
        match fetched {
            Ok(()) => {
                if let Some(entry) = entries.get_mut(&image) {
                    entry.pending_pull = false;
                    entry.ref_count = u32::from(reference);
                    entry.last_used = Instant::now();
                }
                Ok(image)
            }
            Err(message) => {
                entries.remove(&image);
                warn!(image = %image, error = %message, "image pull failed");
                Err(WorkerError::ImagePullFailed { image, message })
            }
        }
    }

    async fn fetch(&self, image: &str) -> Result<(), String> {
        match self.runtime.image_exists(image).await {
            Ok(true) => {
                debug!(image = %image, "image already present");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => debug!(image = %image, error = %e, "image lookup failed, pulling"),
        }

        self.stats.pulls.fetch_add(1, Ordering::Relaxed);
        self.runtime
            .pull_image(image, self.config.registry.as_ref())
            .await
            .map_err(|e| e.to_string())?;
        info!(image = %image, "pulled image");
        Ok(())
    }

    /// Drop unreferenced entries until `incoming` fits under the cap.
    ///
    /// Returns the dropped images with their admission locks held, so nobody
    /// admits them again until they are gone from the runtime.
    fn make_room(
        &self,
        entries: &mut HashMap<String, CacheEntry>,
        incoming: &str,
    ) -> Vec<(String, OwnedMutexGuard<()>)> {
        let mut skipped: HashSet<String> = HashSet::new();
        let mut victims = Vec::new();

        while entries.len() >= self.config.max_images {
            let victim = entries
                .iter()
                .filter(|(name, e)| {
                    e.ref_count == 0
                        && !e.pending_pull
                        && name.as_str() != incoming
                        && !skipped.contains(name.as_str())
                })
                .min_by_key(|(_, e)| e.last_used)
                .map(|(name, _)| name.clone());

            let Some(victim) = victim else {
                warn!(
                    image = %incoming,
                    max_images = self.config.max_images,
                    "image cache over capacity, every cached image is referenced"
                );
                break;
            };

            // Someone is admitting the victim right now; leave it alone.
            match self.admissions.try_lock(&victim) {
                Some(guard) => {
                    entries.remove(&victim);
                    victims.push((victim, guard));
                }
                None => {
                    skipped.insert(victim);
                }
            }
        }

        victims
    }

    /// Drop a reference. Never evicts.
    pub async fn release(&self, image: &str) {
        let image = normalize_image(image);
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&image) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.last_used = Instant::now();
            debug!(image = %image, ref_count = entry.ref_count, "released image reference");
        }
    }

    /// Reference an image already present, e.g. for a recovered container.
    pub async fn restore(&self, image: &str) {
        let image = normalize_image(image);
        let mut entries = self.entries.write().await;
        let entry = entries.entry(image).or_insert_with(|| CacheEntry {
            ref_count: 0,
            pending_pull: false,
            last_used: Instant::now(),
        });
        entry.ref_count += 1;
    }

    /// Current reference count, if cached.
    pub async fn ref_count(&self, image: &str) -> Option<u32> {
        let image = normalize_image(image);
        self.entries.read().await.get(&image).map(|e| e.ref_count)
    }

    /// Cached images and their reference counts.
    pub async fn snapshot(&self) -> BTreeMap<String, u32> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(name, e)| (name.clone(), e.ref_count))
            .collect()
    }

    /// Get cache statistics: hits, misses, evictions, pulls.
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
            self.stats.evictions.load(Ordering::Relaxed),
            self.stats.pulls.load(Ordering::Relaxed),
        )
    }
}
