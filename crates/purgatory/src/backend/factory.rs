//! Backend selection by identifier
//!
//! Backends are chosen from configuration by name. The factory maps each
//! name to a constructor registered at compile time; applications can add
//! their own constructors next to the built-in `memory` and `redis`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::kv::KvBackend;
use super::memory::InMemoryBackend;
use super::redis::RedisKeyValueStore;
use super::store::{BackendError, BreakerBackend};
use crate::error::BreakerError;

/// Which backend a registry should use
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local map
    #[default]
    Memory,

    /// Shared Redis server
    Redis { url: String },

    /// A constructor registered on the factory under `id`
    Custom { id: String, url: Option<String> },
}

impl BackendKind {
    /// Factory identifier for this kind
    pub fn id(&self) -> &str {
        match self {
            Self::Memory => "memory",
            Self::Redis { .. } => "redis",
            Self::Custom { id, .. } => id,
        }
    }

    /// Connection string handed to the constructor, if any
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Memory => None,
            Self::Redis { url } => Some(url.as_str()),
            Self::Custom { url, .. } => url.as_deref(),
        }
    }
}

/// Async constructor producing a backend from an optional connection string
pub type BackendConstructor = Box<
    dyn Fn(Option<String>) -> BoxFuture<'static, Result<Arc<dyn BreakerBackend>, BackendError>>
        + Send
        + Sync,
>;

/// Map of backend identifiers to constructors
pub struct BackendFactory {
    constructors: HashMap<String, BackendConstructor>,
}

impl Default for BackendFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendFactory {
    /// Create a factory with the built-in `memory` and `redis` constructors
    pub fn new() -> Self {
        let mut factory = Self::empty();
        factory.register("memory", |_| {
            async {
                Ok::<_, BackendError>(Arc::new(InMemoryBackend::new()) as Arc<dyn BreakerBackend>)
            }
            .boxed()
        });
        factory.register("redis", |url| {
            async move {
                let url = url.ok_or_else(|| {
                    BackendError::InvalidConfig("redis backend requires a url".to_string())
                })?;
                let store = RedisKeyValueStore::connect(&url).await?;
                Ok::<_, BackendError>(Arc::new(KvBackend::new(store)) as Arc<dyn BreakerBackend>)
            }
            .boxed()
        });
        factory
    }

    /// Create a factory with no constructors
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register (or replace) the constructor for `id`
    ///
    /// # Example
    ///
    /// ```ignore
    /// factory.register("sharded", |url| {
    ///     async move {
    ///         let backend = ShardedBackend::connect(url).await?;
    ///         Ok(Arc::new(backend) as Arc<dyn BreakerBackend>)
    ///     }
    ///     .boxed()
    /// });
    /// ```
    pub fn register<F>(&mut self, id: impl Into<String>, constructor: F)
    where
        F: Fn(Option<String>) -> BoxFuture<'static, Result<Arc<dyn BreakerBackend>, BackendError>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(id.into(), Box::new(constructor));
    }

    /// Check if a backend identifier is registered
    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    /// Get all registered identifiers
    pub fn backend_ids(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(|s| s.as_str())
    }

    /// Build the backend described by `kind`
    ///
    /// Constructors report bad settings with [`BackendError::InvalidConfig`];
    /// those surface as [`BreakerError::Configuration`], not as an outage.
    pub async fn create(
        &self,
        kind: &BackendKind,
    ) -> Result<Arc<dyn BreakerBackend>, BreakerError> {
        let constructor = self.constructors.get(kind.id()).ok_or_else(|| {
            BreakerError::Configuration(format!("unknown breaker backend: {}", kind.id()))
        })?;
        let backend = constructor(kind.url().map(str::to_string))
            .await
            .map_err(|e| match e {
                BackendError::InvalidConfig(reason) => {
                    BreakerError::Configuration(format!("{} backend: {reason}", kind.id()))
                }
                other => BreakerError::Backend(other),
            })?;
        info!(backend = backend.kind(), "breaker backend ready");
        Ok(backend)
    }
}

impl fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendFactory")
            .field("backend_ids", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}
