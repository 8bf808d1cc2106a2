//! In-memory fetcher shared by the plugin tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::fetcher::{FetchError, SourceFetcher};

#[derive(Default)]
pub struct MemoryFetcher {
    documents: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, locator: &str, text: &str) -> Self {
        self.put(locator, text);
        self
    }

    pub fn put(&self, locator: &str, text: &str) {
        self.documents
            .lock()
            .unwrap()
            .insert(locator.to_string(), text.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceFetcher for MemoryFetcher {
    async fn fetch_text(&self, locator: &str) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network {
                url: locator.to_string(),
                message: "offline".to_string(),
            });
        }

        self.documents
            .lock()
            .unwrap()
            .get(locator)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: locator.to_string(),
                status: 404,
            })
    }
}
