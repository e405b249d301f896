//! Simulated Object Store with Fault Injection
//!
//! Wraps another [`ObjectStore`] and injects latency or failures according
//! to deterministic rules, counting every call. Used to test deadlines,
//! per-partition failure isolation and "never downloaded twice" properties.
//!
//! ```text
//! let store = SimulatedObjectStore::new(InMemoryObjectStore::new());
//! store.add_rule(FaultRule::delay(StoreOp::Put, "g2_", Duration::from_secs(5)));
//! ```

use crate::archive::object_store::{ListResult, ObjectMeta, ObjectStore, ObjectStoreError, StoreFuture};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Put,
    Get,
    Exists,
    Delete,
    List,
    Head,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Sleep before forwarding to the inner store
    Delay(Duration),
    /// Fail without touching the inner store
    Fail(String),
}

/// Applies `fault` to calls of `op` whose key (or list prefix) contains
/// `key_contains`.
#[derive(Debug, Clone)]
pub struct FaultRule {
    pub op: StoreOp,
    pub key_contains: String,
    pub fault: Fault,
    /// How many more calls the rule applies to; `None` = unlimited
    pub remaining: Option<u32>,
}

impl FaultRule {
    pub fn delay(op: StoreOp, key_contains: &str, delay: Duration) -> Self {
        FaultRule {
            op,
            key_contains: key_contains.to_string(),
            fault: Fault::Delay(delay),
            remaining: None,
        }
    }

    pub fn fail(op: StoreOp, key_contains: &str, message: &str) -> Self {
        FaultRule {
            op,
            key_contains: key_contains.to_string(),
            fault: Fault::Fail(message.to_string()),
            remaining: None,
        }
    }

    /// Limit the rule to the next `n` matching calls
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }
}

/// Call counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_completed: u64,
    /// Puts whose future was dropped before finishing (deadline expiry)
    pub aborted_puts: u64,
    pub get_attempts: u64,
    pub exists_attempts: u64,
    pub delete_attempts: u64,
    pub list_attempts: u64,
    pub head_attempts: u64,
    pub injected_failures: u64,
}

#[derive(Default)]
struct SimulatedState {
    rules: Vec<FaultRule>,
    stats: SimulatedStoreStats,
}

/// Simulated object store that wraps another store and injects faults
#[derive(Clone)]
pub struct SimulatedObjectStore<S: ObjectStore> {
    inner: S,
    state: Arc<Mutex<SimulatedState>>,
}

/// Counts the put as aborted unless disarmed before drop
struct AbortGuard<'a> {
    state: &'a Mutex<SimulatedState>,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().stats.aborted_puts += 1;
        }
    }
}

impl<S: ObjectStore> SimulatedObjectStore<S> {
    pub fn new(inner: S) -> Self {
        SimulatedObjectStore {
            inner,
            state: Arc::new(Mutex::new(SimulatedState::default())),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn add_rule(&self, rule: FaultRule) {
        self.state.lock().rules.push(rule);
    }

    pub fn clear_rules(&self) {
        self.state.lock().rules.clear();
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }

    /// Count the call and pick the first live rule matching it
    fn record(&self, op: StoreOp, key: &str) -> Option<Fault> {
        let mut state = self.state.lock();
        let stats = &mut state.stats;
        match op {
            StoreOp::Put => stats.put_attempts += 1,
            StoreOp::Get => stats.get_attempts += 1,
            StoreOp::Exists => stats.exists_attempts += 1,
            StoreOp::Delete => stats.delete_attempts += 1,
            StoreOp::List => stats.list_attempts += 1,
            StoreOp::Head => stats.head_attempts += 1,
        }

        let rule = state.rules.iter_mut().find(|rule| {
            rule.op == op && key.contains(&rule.key_contains) && rule.remaining != Some(0)
        })?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.fault.clone())
    }

    async fn inject(&self, fault: Option<Fault>) -> Result<(), ObjectStoreError> {
        match fault {
            None => Ok(()),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(Fault::Fail(message)) => {
                self.state.lock().stats.injected_failures += 1;
                Err(ObjectStoreError::Backend(format!("simulated failure: {}", message)))
            }
        }
    }
}

impl<S: ObjectStore> ObjectStore for SimulatedObjectStore<S> {
    fn put<'a>(&'a self, key: &'a str, data: Bytes, content_type: Option<&'a str>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let fault = self.record(StoreOp::Put, key);
            let mut guard = AbortGuard {
                state: &self.state,
                armed: true,
            };
            let result = match self.inject(fault).await {
                Ok(()) => self.inner.put(key, data, content_type).await,
                Err(e) => Err(e),
            };
            guard.armed = false;
            if result.is_ok() {
                self.state.lock().stats.put_completed += 1;
            }
            result
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Bytes> {
        Box::pin(async move {
            let fault = self.record(StoreOp::Get, key);
            self.inject(fault).await?;
            self.inner.get(key).await
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let fault = self.record(StoreOp::Exists, key);
            self.inject(fault).await?;
            self.inner.exists(key).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let fault = self.record(StoreOp::Delete, key);
            self.inject(fault).await?;
            self.inner.delete(key).await
        })
    }

    fn list<'a>(&'a self, prefix: &'a str, continuation_token: Option<&'a str>) -> StoreFuture<'a, ListResult> {
        Box::pin(async move {
            let fault = self.record(StoreOp::List, prefix);
            self.inject(fault).await?;
            self.inner.list(prefix, continuation_token).await
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            let fault = self.record(StoreOp::Head, key);
            self.inject(fault).await?;
            self.inner.head(key).await
        })
    }

    fn base_url(&self) -> String {
        self.inner.base_url()
    }
}
