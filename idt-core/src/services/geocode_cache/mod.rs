//! Geocode cache
//!
//! Memoizes reverse-geocoding results keyed by coordinates rounded to four
//! decimal places. Concurrent misses for the same key share one external lookup;
//! lookups for different keys are serialized and spaced by a minimum interval.
//! Every new entry is written through to the shared cache file before `resolve`
//! returns.

pub mod nominatim;
mod store;

pub use nominatim::NominatimGeocoder;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use idt_common::Coordinate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use store::StoreWriter;

/// Decimal places kept in a cache key (~11 m)
pub const KEY_PRECISION: i32 = 4;

/// Geocoding failure
///
/// Never fatal to an item; the caller simply has no place name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Reverse geocoding failed: {0}")]
    Lookup(String),

    #[error("No place found at {0}")]
    NoResult(String),

    #[error("Geocode cache storage error: {0}")]
    Storage(String),

    #[error("Geocode cache writer is closed")]
    Closed,
}

/// External reverse geocoding service
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse(&self, coordinate: Coordinate) -> Result<String, CacheError>;
}

/// Rounded coordinate used as the cache key, e.g. `"30.2672,-97.7431"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordKey(String);

impl CoordKey {
    pub fn new(coordinate: Coordinate) -> Result<Self, CacheError> {
        if !coordinate.is_valid() {
            return Err(CacheError::InvalidCoordinate(format!(
                "{}, {}",
                coordinate.lat, coordinate.lon
            )));
        }
        let rounded = Self::round(coordinate);
        Ok(Self(format!("{:.4},{:.4}", rounded.lat, rounded.lon)))
    }

    /// Coordinate snapped to key precision; `-0.0` normalizes to `0.0`
    pub fn round(coordinate: Coordinate) -> Coordinate {
        let scale = 10f64.powi(KEY_PRECISION);
        let snap = |v: f64| (v * scale).round() / scale + 0.0;
        Coordinate::new(snap(coordinate.lat), snap(coordinate.lon))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cached lookup result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeEntry {
    pub place: String,
    pub looked_up_at: DateTime<Utc>,
}

type SharedLookup = Shared<BoxFuture<'static, Result<String, CacheError>>>;

struct Inner {
    path: PathBuf,
    entries: RwLock<HashMap<CoordKey, GeocodeEntry>>,
    in_flight: Mutex<HashMap<CoordKey, SharedLookup>>,
    /// Held across one external call so lookups never overlap
    lookup_gate: Mutex<()>,
    limiter: Option<DefaultDirectRateLimiter>,
    geocoder: Arc<dyn ReverseGeocoder>,
    writer: StoreWriter,
    external_lookups: AtomicUsize,
}

/// Process-wide handle to the shared geocode cache; clones share state
#[derive(Clone)]
pub struct GeocodeCache {
    inner: Arc<Inner>,
}

impl GeocodeCache {
    /// Load the cache file and start its writer task
    pub async fn open(
        path: impl Into<PathBuf>,
        geocoder: Arc<dyn ReverseGeocoder>,
        min_interval: Duration,
    ) -> Result<Self, CacheError> {
        let path = path.into();
        let load_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || store::load(&load_path))
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))??;

        let entries: HashMap<CoordKey, GeocodeEntry> = loaded
            .into_iter()
            .map(|(key, entry)| (CoordKey(key), entry))
            .collect();

        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            min_interval_ms = min_interval.as_millis() as u64,
            "Geocode cache loaded"
        );

        let limiter = Quota::with_period(min_interval).map(RateLimiter::direct);

        Ok(Self {
            inner: Arc::new(Inner {
                writer: StoreWriter::spawn(path.clone()),
                path,
                entries: RwLock::new(entries),
                in_flight: Mutex::new(HashMap::new()),
                lookup_gate: Mutex::new(()),
                limiter,
                geocoder,
                external_lookups: AtomicUsize::new(0),
            }),
        })
    }

    /// Place name for a coordinate, from the cache or the external service
    pub async fn resolve(&self, coordinate: Coordinate) -> Result<String, CacheError> {
        let key = CoordKey::new(coordinate)?;

        if let Some(place) = self.cached(&key).await {
            tracing::trace!(key = %key, "Geocode cache hit");
            return Ok(place);
        }

        let lookup = {
            let mut in_flight = self.inner.in_flight.lock().await;
            // A lookup may have finished between the hit check and taking the lock
            if let Some(place) = self.cached(&key).await {
                return Ok(place);
            }
            match in_flight.get(&key) {
                Some(existing) => {
                    tracing::debug!(key = %key, "Joining in-flight geocode lookup");
                    existing.clone()
                }
                None => {
                    // Runs on its own task so it finishes (and persists) even if
                    // every waiter is dropped
                    let handle = tokio::spawn(Self::lookup(Arc::clone(&self.inner), key.clone()));
                    let lookup = async move {
                        handle
                            .await
                            .map_err(|e| CacheError::Lookup(format!("lookup task failed: {}", e)))?
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key.clone(), lookup.clone());
                    lookup
                }
            }
        };

        lookup.await
    }

    /// Cached entry for a coordinate, without any lookup
    pub async fn get(&self, coordinate: Coordinate) -> Option<GeocodeEntry> {
        let key = CoordKey::new(coordinate).ok()?;
        self.inner.entries.read().await.get(&key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// External calls made by this process
    pub fn external_lookups(&self) -> usize {
        self.inner.external_lookups.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn cached(&self, key: &CoordKey) -> Option<String> {
        self.inner
            .entries
            .read()
            .await
            .get(key)
            .map(|entry| entry.place.clone())
    }

    /// One external lookup plus write-through; failures are never cached
    async fn lookup(inner: Arc<Inner>, key: CoordKey) -> Result<String, CacheError> {
        let result = Self::fetch_and_store(&inner, &key).await;
        inner.in_flight.lock().await.remove(&key);
        result
    }

    async fn fetch_and_store(inner: &Inner, key: &CoordKey) -> Result<String, CacheError> {
        let place = {
            let _gate = inner.lookup_gate.lock().await;
            if let Some(limiter) = &inner.limiter {
                limiter.until_ready().await;
            }
            inner.external_lookups.fetch_add(1, Ordering::Relaxed);

            let center = parse_key(key)?;
            tracing::debug!(key = %key, "Reverse geocoding");
            inner.geocoder.reverse(center).await?
        };

        let entry = GeocodeEntry {
            place: place.clone(),
            looked_up_at: Utc::now(),
        };
        inner.writer.put(key.as_str().to_string(), entry.clone()).await?;
        inner.entries.write().await.insert(key.clone(), entry);

        tracing::debug!(key = %key, place = %place, "Geocode entry stored");
        Ok(place)
    }
}

fn parse_key(key: &CoordKey) -> Result<Coordinate, CacheError> {
    let invalid = || CacheError::InvalidCoordinate(key.as_str().to_string());
    let (lat, lon) = key.as_str().split_once(',').ok_or_else(invalid)?;
    let lat: f64 = lat.parse().map_err(|_| invalid())?;
    let lon: f64 = lon.parse().map_err(|_| invalid())?;
    Ok(Coordinate::new(lat, lon))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_rounding() {
        let a = CoordKey::new(Coordinate::new(30.267_23, -97.743_14)).unwrap();
        let b = CoordKey::new(Coordinate::new(30.267_18, -97.743_06)).unwrap();
        assert_eq!(a.as_str(), "30.2672,-97.7431");
        assert_eq!(a, b);
    }

    #[test]
    fn test_negative_zero_normalized() {
        let key = CoordKey::new(Coordinate::new(-0.000_01, 0.000_01)).unwrap();
        assert_eq!(key.as_str(), "0.0000,0.0000");
    }

    #[test]
    fn test_invalid_coordinate_rejected() {
        assert!(matches!(
            CoordKey::new(Coordinate::new(120.0, 0.0)),
            Err(CacheError::InvalidCoordinate(_))
        ));
    }

    #[test]
    fn test_parse_key_roundtrip() {
        let key = CoordKey::new(Coordinate::new(48.8584, 2.2945)).unwrap();
        let center = parse_key(&key).unwrap();
        assert_eq!(center, Coordinate::new(48.8584, 2.2945));
    }
}
