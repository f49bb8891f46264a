//! Connection registry.
//!
//! Maps dispatch keys to connection providers. A lookup miss falls back to the
//! default registration; with no default registered every lookup fails with a
//! configuration error.

use crate::db::dispatch::DispatchKey;
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Produces a connection descriptor (pool handle) on demand.
///
/// Implemented for any `Fn() -> impl Future<Output = DbResult<P>>` closure.
pub trait ConnectionProvider<P>: Send + Sync {
    fn connection(&self) -> BoxFuture<'static, DbResult<P>>;
}

impl<P, F, Fut> ConnectionProvider<P> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = DbResult<P>> + Send + 'static,
{
    fn connection(&self) -> BoxFuture<'static, DbResult<P>> {
        Box::pin(self())
    }
}

type SharedProvider<P> = Arc<dyn ConnectionProvider<P>>;

pub struct ConnectionRegistry<P> {
    providers: Arc<RwLock<HashMap<DispatchKey, SharedProvider<P>>>>,
}

impl<P> Clone for ConnectionRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            providers: Arc::clone(&self.providers),
        }
    }
}

impl<P> std::fmt::Debug for ConnectionRegistry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry").finish_non_exhaustive()
    }
}

impl<P: Clone + Send + Sync + 'static> ConnectionRegistry<P> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Install or replace the provider for `key`. Last registration wins.
    pub async fn register<K, C>(&self, key: K, provider: C)
    where
        K: Into<DispatchKey>,
        C: ConnectionProvider<P> + 'static,
    {
        let key = key.into();
        let replaced = {
            let mut providers = self.providers.write().await;
            providers.insert(key.clone(), Arc::new(provider)).is_some()
        };
        info!(key = %key, replaced = replaced, "Registered connection provider");
    }

    /// Install the provider used when no key-specific registration exists.
    pub async fn register_default<C>(&self, provider: C)
    where
        C: ConnectionProvider<P> + 'static,
    {
        self.register(DispatchKey::default_key(), provider).await;
    }

    /// Register a fixed descriptor, such as an already-built pool.
    pub async fn register_pool<K: Into<DispatchKey>>(&self, key: K, pool: P) {
        self.register(key, move || {
            let pool = pool.clone();
            async move { Ok::<_, DbError>(pool) }
        })
        .await;
    }

    /// Remove the provider for `key`. Returns whether one was registered.
    pub async fn unregister(&self, key: &DispatchKey) -> bool {
        let mut providers = self.providers.write().await;
        providers.remove(key).is_some()
    }

    /// Check if a provider is registered under exactly `key`.
    pub async fn contains(&self, key: &DispatchKey) -> bool {
        let providers = self.providers.read().await;
        providers.contains_key(key)
    }

    /// List registered keys, sorted.
    pub async fn keys(&self) -> Vec<DispatchKey> {
        let providers = self.providers.read().await;
        let mut keys: Vec<DispatchKey> = providers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolve the descriptor for `key`, falling back to the default registration.
    pub async fn resolve(&self, key: &DispatchKey) -> DbResult<P> {
        let provider = {
            let providers = self.providers.read().await;
            providers
                .get(key)
                .or_else(|| providers.get(&DispatchKey::default_key()))
                .cloned()
        }; // Read lock released before invoking the provider

        match provider {
            Some(provider) => {
                debug!(key = %key, "Resolving connection");
                provider.connection().await
            }
            None => Err(DbError::configuration(
                key.to_string(),
                format!(
                    "No connection provider registered for '{}' and no '{}' registration to fall back to",
                    key,
                    DispatchKey::default_key()
                ),
            )),
        }
    }

    /// Fail unless a default provider is registered.
    pub async fn validate(&self) -> DbResult<()> {
        if self.contains(&DispatchKey::default_key()).await {
            Ok(())
        } else {
            Err(DbError::configuration(
                DispatchKey::default_key().to_string(),
                "A default connection provider must be registered before use",
            ))
        }
    }
}

impl<P: Clone + Send + Sync + 'static> Default for ConnectionRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_resolve_without_registration_fails() {
        let registry: ConnectionRegistry<&'static str> = ConnectionRegistry::new();
        let result = registry.resolve(&DispatchKey::new("users")).await;
        assert!(matches!(result, Err(DbError::Configuration { key, .. }) if key == "users"));
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_default() {
        let registry = ConnectionRegistry::new();
        registry.register_pool(DispatchKey::default_key(), "A").await;
        registry.register_pool("audit", "B").await;

        assert_eq!(registry.resolve(&DispatchKey::new("users")).await.unwrap(), "A");
        assert_eq!(registry.resolve(&DispatchKey::new("audit")).await.unwrap(), "B");
        assert_eq!(registry.resolve(&DispatchKey::default_key()).await.unwrap(), "A");
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = ConnectionRegistry::new();
        registry.register_pool("users", "old").await;
        registry.register_pool("users", "new").await;
        assert_eq!(registry.resolve(&DispatchKey::new("users")).await.unwrap(), "new");
    }

    #[tokio::test]
    async fn test_unregister_default_breaks_keyless_resolution() {
        let registry = ConnectionRegistry::new();
        registry.register_pool(DispatchKey::default_key(), "A").await;
        assert!(registry.validate().await.is_ok());

        assert!(registry.unregister(&DispatchKey::default_key()).await);
        assert!(matches!(
            registry.resolve(&DispatchKey::default_key()).await,
            Err(DbError::Configuration { .. })
        ));
        assert!(registry.validate().await.is_err());
    }

    #[tokio::test]
    async fn test_provider_invoked_per_resolution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ConnectionRegistry::new();
        let counter = Arc::clone(&calls);
        registry
            .register_default(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, DbError>(n) }
            })
            .await;

        assert_eq!(registry.resolve(&DispatchKey::new("x")).await.unwrap(), 0);
        assert_eq!(registry.resolve(&DispatchKey::new("y")).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.keys().await, vec![DispatchKey::default_key()]);
    }
}
