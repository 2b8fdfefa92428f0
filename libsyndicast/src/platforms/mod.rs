//! Platform publish abstraction
//!
//! Each social network is wrapped in a [`PlatformPublisher`] with a narrow
//! contract: given normalized post data and a valid access token, one
//! publish call yields the created post's identifier, a structured
//! duplicate indicator carrying the existing identifier, or a failure the
//! caller can classify as retryable or fatal. New platforms are added by
//! registering an implementation, never by branching on the platform name.

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PublishError;
use crate::types::ScheduledJob;

pub mod linkedin;
pub mod mock;
pub mod webhook;

/// One publish destination within a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    /// The account's own feed.
    Feed,
    /// A group/community container, by platform-side id.
    Group(String),
}

impl std::fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishTarget::Feed => write!(f, "feed"),
            PublishTarget::Group(id) => write!(f, "group {}", id),
        }
    }
}

/// Everything a platform client needs for one publish call.
pub struct PublishRequest<'a> {
    pub job: &'a ScheduledJob,
    pub author_id: &'a str,
    pub access_token: &'a SecretString,
    pub thumbnail_url: Option<&'a str>,
    pub target: PublishTarget,
}

#[async_trait]
pub trait PlatformPublisher: Send + Sync {
    /// Lowercase platform identifier used as the registry key.
    fn name(&self) -> &str;

    /// Maximum post length, if the platform enforces one.
    fn character_limit(&self) -> Option<usize> {
        None
    }

    /// Whether a cached author identifier is usable as-is.
    ///
    /// Platforms with structured identifiers override this so malformed
    /// cache entries get re-resolved instead of sent to the API.
    fn is_valid_author_id(&self, author_id: &str) -> bool {
        !author_id.is_empty()
    }

    /// Resolve the author identifier for the authenticated account.
    ///
    /// Returns `None` for platforms without an author concept; the result
    /// is cached on the account record by the caller.
    async fn resolve_author(
        &self,
        access_token: &SecretString,
    ) -> std::result::Result<Option<String>, PublishError> {
        let _ = access_token;
        Ok(None)
    }

    /// Publish to a single target, returning the external post id.
    async fn publish(
        &self,
        request: &PublishRequest<'_>,
    ) -> std::result::Result<String, PublishError>;
}

/// Platform lookup by name.
#[derive(Default)]
pub struct PublisherRegistry {
    publishers: HashMap<String, Arc<dyn PlatformPublisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, publisher: Arc<dyn PlatformPublisher>) {
        self.publishers
            .insert(publisher.name().to_lowercase(), publisher);
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn PlatformPublisher>> {
        self.publishers.get(&platform.to_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.publishers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockPlatform;

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let mut registry = PublisherRegistry::new();
        registry.register(Arc::new(MockPlatform::new("linkedin")));

        assert!(registry.get("linkedin").is_some());
        assert!(registry.get("LinkedIn").is_some());
        assert!(registry.get("medium").is_none());
    }

    #[test]
    fn test_registry_last_registration_wins() {
        let mut registry = PublisherRegistry::new();
        registry.register(Arc::new(MockPlatform::new("linkedin").with_limit(100)));
        registry.register(Arc::new(MockPlatform::new("linkedin").with_limit(200)));

        let publisher = registry.get("linkedin").unwrap();
        assert_eq!(publisher.character_limit(), Some(200));
    }

    #[test]
    fn test_registry_names_sorted() {
        let mut registry = PublisherRegistry::new();
        registry.register(Arc::new(MockPlatform::new("webhook")));
        registry.register(Arc::new(MockPlatform::new("linkedin")));

        assert_eq!(registry.names(), vec!["linkedin", "webhook"]);
    }

    #[test]
    fn test_target_display() {
        assert_eq!(PublishTarget::Feed.to_string(), "feed");
        assert_eq!(PublishTarget::Group("123".to_string()).to_string(), "group 123");
    }
}
