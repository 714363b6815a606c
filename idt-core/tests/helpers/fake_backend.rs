//! Scripted vision backend
//!
//! Fixture images carry their name after the JPEG signature, so the backend can
//! tell which image a request is for and replay a per-image failure script.

use async_trait::async_trait;
use base64::Engine;
use idt_common::TokenUsage;
use idt_core::services::{BackendReply, ProviderError, ProviderErrorKind, VisionBackend, VisionRequest};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct FakeBackend {
    scripts: Mutex<HashMap<String, VecDeque<ProviderErrorKind>>>,
    always: HashMap<String, ProviderErrorKind>,
    fail_all: Option<ProviderErrorKind>,
    delay: Duration,
    calls: AtomicUsize,
    per_image: Mutex<HashMap<String, usize>>,
    panics: Vec<String>,
    cancel_at: Option<(usize, CancellationToken)>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first calls for `name` with `kinds`, in order, then succeed
    pub fn fail_first(mut self, name: &str, kinds: &[ProviderErrorKind]) -> Self {
        self.scripts
            .get_mut()
            .unwrap()
            .insert(name.to_string(), kinds.iter().copied().collect());
        self
    }

    /// Every call for `name` fails with `kind`
    pub fn fail_always(mut self, name: &str, kind: ProviderErrorKind) -> Self {
        self.always.insert(name.to_string(), kind);
        self
    }

    /// Every call fails with `kind`
    pub fn fail_all(mut self, kind: ProviderErrorKind) -> Self {
        self.fail_all = Some(kind);
        self
    }

    /// Calls for `name` panic inside the backend
    pub fn panic_on(mut self, name: &str) -> Self {
        self.panics.push(name.to_string());
        self
    }

    /// Cancel `token` when call number `call` (1-based) arrives; that call still succeeds
    pub fn cancel_after(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_at = Some((call, token));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.per_image.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn image_name(request: &VisionRequest) -> String {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&request.image_base64)
            .unwrap();
        String::from_utf8_lossy(&bytes[4..]).to_string()
    }
}

#[async_trait]
impl VisionBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn describe(&self, request: &VisionRequest) -> Result<BackendReply, ProviderError> {
        let name = Self::image_name(request);
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.per_image.lock().unwrap().entry(name.clone()).or_insert(0) += 1;

        if let Some((at, token)) = &self.cancel_at {
            if call == *at {
                token.cancel();
            }
        }
        if self.panics.contains(&name) {
            panic!("backend blew up on {}", name);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(kind) = self.fail_all.or_else(|| self.always.get(&name).copied()) {
            return Err(ProviderError::new(kind, format!("scripted failure for {}", name)));
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&name)
            .and_then(|script| script.pop_front());
        if let Some(kind) = scripted {
            return Err(ProviderError::new(kind, format!("scripted failure for {}", name)));
        }

        Ok(BackendReply {
            text: format!("A photo named {}.", name),
            usage: TokenUsage {
                input_tokens: Some(100),
                output_tokens: Some(20),
            },
        })
    }
}
