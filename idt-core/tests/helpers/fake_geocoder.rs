//! Counting reverse geocoder

use async_trait::async_trait;
use idt_common::Coordinate;
use idt_core::services::{CacheError, ReverseGeocoder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct FakeGeocoder {
    delay: Duration,
    fail_next: AtomicUsize,
    fail_southern: bool,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The next `n` lookups fail
    pub fn failing_times(self, n: usize) -> Self {
        self.fail_next.store(n, Ordering::SeqCst);
        self
    }

    /// Lookups for negative latitudes always fail
    pub fn failing_southern(mut self) -> Self {
        self.fail_southern = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of lookups seen running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseGeocoder for FakeGeocoder {
    async fn reverse(&self, coordinate: Coordinate) -> Result<String, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let scripted_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || (self.fail_southern && coordinate.lat < 0.0) {
            return Err(CacheError::Lookup("service unavailable".to_string()));
        }

        Ok(format!("Place {:.2},{:.2}", coordinate.lat, coordinate.lon))
    }
}
