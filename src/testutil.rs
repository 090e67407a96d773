//! Canned-response CRM API for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::CrmApi;
use crate::error::CrmError;

/// Serves fixed JSON bodies by path; unknown paths answer 404. Optionally
/// counts every request so tests can assert that siblings still ran.
#[derive(Default)]
pub struct FakeApi {
    responses: BTreeMap<String, Value>,
    calls: Option<Arc<AtomicUsize>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: &str, body: Value) -> Self {
        self.responses.insert(path.to_string(), body);
        self
    }

    pub fn without(mut self, path: &str) -> Self {
        self.responses.remove(path);
        self
    }

    pub fn on_call(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.calls = Some(counter);
        self
    }
}

#[async_trait]
impl CrmApi for FakeApi {
    async fn get(&self, path: &str) -> Result<Value, CrmError> {
        if let Some(counter) = &self.calls {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        self.responses
            .get(path)
            .cloned()
            .ok_or_else(|| CrmError::Api {
                status: 404,
                url: path.to_string(),
                message: "no fixture for path".to_string(),
            })
    }
}
