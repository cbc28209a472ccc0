//! Generation cache: store trait, in-memory backend and the coordinator
//! that splits a batch into hits and misses.
//!
//! Entries are keyed by `(prompt, fingerprint)`. The prompt is the
//! [`buffer_string`] rendering of the conversation; the fingerprint is a
//! canonical serialization of every invocation parameter, so entries are
//! never shared between incompatible configurations.
//!
//! Concurrent identical requests are not deduplicated: two misses for the
//! same key both reach the provider, and the last write wins.

use crate::error::KilnError;
use crate::message::buffer_string;
use crate::provider::ChatProvider;
use crate::types::*;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Pluggable cache backend.
///
/// Must be safe to call concurrently for distinct keys.
#[async_trait]
pub trait CacheStore: Send + Sync + Debug + 'static {
    /// `Ok(None)` is a miss. Any `Some`, including an empty list, is a hit.
    async fn lookup(&self, prompt: &str, fingerprint: &str) -> Result<Option<Vec<Generation>>, KilnError>;

    async fn update(&self, prompt: &str, fingerprint: &str, generations: Vec<Generation>) -> Result<(), KilnError>;
}

/// In-memory cache backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<(String, String), Vec<Generation>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn lookup(&self, prompt: &str, fingerprint: &str) -> Result<Option<Vec<Generation>>, KilnError> {
        Ok(self
            .entries
            .get(&(prompt.to_string(), fingerprint.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn update(&self, prompt: &str, fingerprint: &str, generations: Vec<Generation>) -> Result<(), KilnError> {
        self.entries
            .insert((prompt.to_string(), fingerprint.to_string()), generations);
        Ok(())
    }
}

/// Canonical fingerprint of everything that shapes a completion.
///
/// Object keys are sorted recursively, so the result does not depend on
/// map insertion order.
pub fn fingerprint(provider: &dyn ChatProvider, options: &CallOptions) -> Result<String, KilnError> {
    let value = serde_json::json!({
        "_type": provider.info().id,
        "params": provider.invocation_params(options),
        "options": serde_json::to_value(options)?,
    });
    Ok(serde_json::to_string(&canonicalize(value))?)
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Outcome of a cache split
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSplit {
    pub hits: BTreeMap<usize, Vec<Generation>>,
    /// Indices to execute, ascending
    pub misses: Vec<usize>,
}

/// Cache-aware dispatch for one batch call
#[derive(Debug, Clone)]
pub struct CacheCoordinator {
    store: Arc<dyn CacheStore>,
    fingerprint: String,
}

impl CacheCoordinator {
    pub fn new(store: Arc<dyn CacheStore>, fingerprint: impl Into<String>) -> Self {
        Self {
            store,
            fingerprint: fingerprint.into(),
        }
    }

    /// Look up every conversation concurrently. Read errors count as misses.
    pub async fn split(&self, conversations: &[Vec<Message>]) -> CacheSplit {
        let lookups = join_all(conversations.iter().map(|messages| {
            let prompt = buffer_string(messages);
            async move { self.store.lookup(&prompt, &self.fingerprint).await }
        }))
        .await;

        let mut split = CacheSplit::default();
        for (index, lookup) in lookups.into_iter().enumerate() {
            match lookup {
                Ok(Some(generations)) => {
                    split.hits.insert(index, generations);
                }
                Ok(None) => split.misses.push(index),
                Err(err) => {
                    tracing::warn!(index, error = %err, "cache lookup failed, treating as miss");
                    split.misses.push(index);
                }
            }
        }
        split
    }

    /// Store the generations produced for one conversation
    pub async fn write_back(&self, messages: &[Message], generations: Vec<Generation>) -> Result<(), KilnError> {
        let prompt = buffer_string(messages);
        self.store.update(&prompt, &self.fingerprint, generations).await
    }
}

/// Zero the token usage of generations served from the cache
pub(crate) fn mark_cached(generations: &mut [Generation]) {
    for generation in generations {
        if generation.message.role == Role::Ai {
            generation.message.usage = Some(Usage::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChatProvider;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Fails every lookup for prompts containing "boom"
    #[derive(Debug, Default)]
    struct FlakyCache {
        inner: InMemoryCache,
        failed: AtomicBool,
    }

    #[async_trait]
    impl CacheStore for FlakyCache {
        async fn lookup(&self, prompt: &str, fingerprint: &str) -> Result<Option<Vec<Generation>>, KilnError> {
            if prompt.contains("boom") {
                self.failed.store(true, Ordering::SeqCst);
                return Err(KilnError::cache_read("connection reset"));
            }
            self.inner.lookup(prompt, fingerprint).await
        }

        async fn update(&self, prompt: &str, fingerprint: &str, generations: Vec<Generation>) -> Result<(), KilnError> {
            self.inner.update(prompt, fingerprint, generations).await
        }
    }

    fn conversation(text: &str) -> Vec<Message> {
        vec![Message::human(text)]
    }

    #[tokio::test]
    async fn test_split_hits_and_misses() {
        let store = Arc::new(InMemoryCache::new());
        let coordinator = CacheCoordinator::new(store.clone(), "fp");
        let answer = vec![Generation::new(Message::ai("4"))];
        coordinator
            .write_back(&conversation("2+2"), answer.clone())
            .await
            .unwrap();
        coordinator
            .write_back(&conversation("empty"), Vec::new())
            .await
            .unwrap();

        let split = coordinator
            .split(&[
                conversation("a"),
                conversation("2+2"),
                conversation("b"),
                conversation("empty"),
            ])
            .await;

        assert_eq!(split.misses, vec![0, 2]);
        assert_eq!(split.hits.get(&1), Some(&answer));
        // An empty list is still a hit
        assert_eq!(split.hits.get(&3), Some(&Vec::new()));
    }

    #[tokio::test]
    async fn test_fingerprint_isolates_entries() {
        let store = Arc::new(InMemoryCache::new());
        CacheCoordinator::new(store.clone(), "fp-a")
            .write_back(&conversation("q"), vec![Generation::new(Message::ai("a"))])
            .await
            .unwrap();

        let split = CacheCoordinator::new(store, "fp-b")
            .split(&[conversation("q")])
            .await;
        assert_eq!(split.misses, vec![0]);
    }

    #[tokio::test]
    async fn test_read_error_is_a_miss() {
        let store = Arc::new(FlakyCache::default());
        let coordinator = CacheCoordinator::new(store.clone(), "fp");
        coordinator
            .write_back(&conversation("fine"), vec![Generation::new(Message::ai("ok"))])
            .await
            .unwrap();

        let split = coordinator
            .split(&[conversation("boom"), conversation("fine")])
            .await;
        assert!(store.failed.load(Ordering::SeqCst));
        assert_eq!(split.misses, vec![0]);
        assert!(split.hits.contains_key(&1));
    }

    #[test]
    fn test_fingerprint_is_key_order_independent() {
        let provider = FakeChatProvider::new();
        let a = CallOptions::new()
            .with_extra("alpha", serde_json::json!({"z": 1, "a": 2}))
            .with_extra("beta", serde_json::json!(true));
        let b = CallOptions::new()
            .with_extra("beta", serde_json::json!(true))
            .with_extra("alpha", serde_json::json!({"a": 2, "z": 1}));

        assert_eq!(
            fingerprint(&provider, &a).unwrap(),
            fingerprint(&provider, &b).unwrap()
        );
        assert_ne!(
            fingerprint(&provider, &a).unwrap(),
            fingerprint(&provider, &a.clone().with_temperature(0.5)).unwrap()
        );
    }
}
