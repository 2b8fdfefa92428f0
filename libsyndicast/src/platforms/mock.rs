//! Mock platform for tests
//!
//! Available in all builds so integration tests can drive the worker
//! without network access. Results are scripted per call; every publish
//! is recorded for later inspection.

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::PublishError;
use crate::platforms::{PlatformPublisher, PublishRequest};

/// One recorded publish call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub job_id: String,
    pub target: String,
    pub content_text: String,
}

pub struct MockPlatform {
    name: String,
    character_limit: Option<usize>,
    author_id: Option<String>,
    results: Mutex<VecDeque<Result<String, PublishError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockPlatform {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            character_limit: None,
            author_id: Some("mock:author".to_string()),
            results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.character_limit = Some(limit);
        self
    }

    pub fn without_author(mut self) -> Self {
        self.author_id = None;
        self
    }

    /// Queue the result for the next publish call. When the queue runs
    /// dry, publishes succeed with generated ids.
    pub fn push_result(&self, result: Result<String, PublishError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformPublisher for MockPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn character_limit(&self) -> Option<usize> {
        self.character_limit
    }

    async fn resolve_author(
        &self,
        _access_token: &SecretString,
    ) -> Result<Option<String>, PublishError> {
        Ok(self.author_id.clone())
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> Result<String, PublishError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(RecordedCall {
                job_id: request.job.id.clone(),
                target: request.target.to_string(),
                content_text: request.job.content_text.clone(),
            });
            calls.len()
        };

        match self.results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(format!("mock:{}:{}", self.name, call_number)),
        }
    }
}
