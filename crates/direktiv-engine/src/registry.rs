use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;

/// A named asynchronous callback.
pub type Callback<A> = Arc<dyn Fn(A) -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry of named callbacks, built once at startup and shared by
/// reference with the components that dispatch to it.
pub struct Registry<A> {
    entries: Arc<RwLock<HashMap<String, Callback<A>>>>,
}

impl<A: Send + 'static> Registry<A> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a callback, replacing any previous one of the same name.
    pub fn register<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback<A> = Arc::new(move |arg| callback(arg).boxed());
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(name.into(), callback);
        }
    }

    /// Get a callback by name.
    pub fn get(&self, name: &str) -> Option<Callback<A>> {
        self.entries.read().ok()?.get(name).cloned()
    }

    /// Check if a callback is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Get all registered names.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl<A: Send + 'static> Default for Registry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for Registry<A> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}
