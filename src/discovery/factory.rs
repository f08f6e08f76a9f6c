//! The process-wide resolver→balancer factory cache.
//!
//! Factories are shared globally, keyed by resolver name, balancer name,
//! and the two intervals — callers configuring the same combination get the
//! same factory, and with it the same discovery cache. Inside a factory,
//! concurrent first-time resolutions of one target collapse into a single
//! flight, a refresh loop re-resolves every cached target, and a watcher
//! loop expires entries in two phases so an entry read between ticks always
//! survives the next sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

use crate::request::Request;

use super::{Balancer, DiscoveryResult, Instance, Resolver};

#[derive(Clone, Debug)]
pub struct DiscoveryOptions {
    pub refresh_interval: Duration,
    pub expire_interval: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> DiscoveryOptions {
        DiscoveryOptions {
            refresh_interval: Duration::from_secs(60),
            expire_interval: Duration::from_secs(120),
        }
    }
}

const EXPIRE_LIVE: u32 = 0;
const EXPIRE_MARKED: u32 = 1;

struct CacheEntry {
    result: ArcSwap<DiscoveryResult>,
    /// Two-phase expiration flag: 0 live, 1 marked for collection.
    expire: AtomicU32,
    /// Unprefixed target description handed back to the resolver on
    /// refresh.
    service_name: String,
    cache_key: String,
}

type EntryCell = Arc<OnceCell<Arc<CacheEntry>>>;

/// One resolver+balancer pairing with its target cache.
pub struct BalancerFactory {
    resolver: Arc<dyn Resolver>,
    balancer: Arc<dyn Balancer>,
    options: DiscoveryOptions,
    entries: Mutex<HashMap<String, EntryCell>>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct FactoryKey {
    resolver: String,
    balancer: String,
    refresh_interval: Duration,
    expire_interval: Duration,
}

static FACTORIES: OnceLock<Mutex<HashMap<FactoryKey, Arc<BalancerFactory>>>> = OnceLock::new();

/// Fetches or creates the shared factory for this configuration.
///
/// First creation starts the factory's refresh and expiry loops.
pub fn balancer_factory(
    resolver: Arc<dyn Resolver>,
    balancer: Arc<dyn Balancer>,
    options: DiscoveryOptions,
) -> Arc<BalancerFactory> {
    let key = FactoryKey {
        resolver: resolver.name().to_owned(),
        balancer: balancer.name().to_owned(),
        refresh_interval: options.refresh_interval,
        expire_interval: options.expire_interval,
    };
    let factories = FACTORIES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut factories = factories.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = factories.get(&key) {
        return existing.clone();
    }
    let factory = Arc::new(BalancerFactory {
        resolver,
        balancer,
        options,
        entries: Mutex::new(HashMap::new()),
    });
    factory.start_refresh_loop();
    factory.start_watcher_loop();
    factories.insert(key, factory.clone());
    factory
}

impl BalancerFactory {
    /// Resolves an instance for the request's target.
    ///
    /// The first caller for a target does the resolution; concurrent
    /// callers wait on the same flight and see its result. A successful
    /// lookup clears the entry's expiration mark.
    pub async fn get_instance(&self, req: &Request) -> crate::Result<Arc<Instance>> {
        let desc = self.resolver.target(req);
        let cache_key = format!("{}:{}", self.resolver.name(), desc);

        let cell: EntryCell = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .entry(cache_key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let entry = cell
            .get_or_try_init(|| async {
                debug!("resolving {:?}", desc);
                let resolved = self.resolver.resolve(&desc).await?;
                let result = DiscoveryResult {
                    cache_key: cache_key.clone(),
                    instances: resolved.instances,
                };
                Ok::<_, crate::Error>(Arc::new(CacheEntry {
                    result: ArcSwap::from_pointee(result),
                    expire: AtomicU32::new(EXPIRE_LIVE),
                    service_name: desc.clone(),
                    cache_key: cache_key.clone(),
                }))
            })
            .await?
            .clone();

        // Any use keeps the entry alive across the next sweep.
        entry.expire.store(EXPIRE_LIVE, Ordering::Release);

        let result = entry.result.load_full();
        self.balancer
            .pick(&result)
            .ok_or_else(crate::Error::new_no_instance)
    }

    fn snapshot_entries(&self) -> Vec<(String, Arc<CacheEntry>)> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter_map(|(k, cell)| cell.get().map(|e| (k.clone(), e.clone())))
            .collect()
    }

    /// Re-resolves every cached target, swapping in fresh results.
    async fn refresh_all(&self) {
        for (_, entry) in self.snapshot_entries() {
            match self.resolver.resolve(&entry.service_name).await {
                Ok(resolved) => {
                    let result = Arc::new(DiscoveryResult {
                        cache_key: entry.cache_key.clone(),
                        instances: resolved.instances,
                    });
                    entry.result.store(result.clone());
                    entry.expire.store(EXPIRE_LIVE, Ordering::Release);
                    self.balancer.rebalance(&result);
                    trace!("refreshed {:?}", entry.service_name);
                }
                Err(err) => {
                    // Keep serving the previous result.
                    warn!("refresh of {:?} failed: {}", entry.service_name, err);
                }
            }
        }
    }

    /// One expiry tick: entries already marked are evicted, live entries
    /// are marked for the next tick.
    fn sweep(&self) {
        let mut evict = Vec::new();
        for (key, entry) in self.snapshot_entries() {
            let was = entry.expire.compare_exchange(
                EXPIRE_LIVE,
                EXPIRE_MARKED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if was.is_err() {
                // Still marked from last tick: nobody touched it since.
                evict.push((key, entry));
            }
        }
        if evict.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (key, entry) in evict {
            debug!("expiring discovery cache entry {:?}", key);
            entries.remove(&key);
            self.balancer.delete(&entry.cache_key);
        }
    }

    fn start_refresh_loop(self: &Arc<Self>) {
        let weak: Weak<BalancerFactory> = Arc::downgrade(self);
        let interval = self.options.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(factory) => factory.refresh_all().await,
                    None => return,
                }
            }
        });
    }

    fn start_watcher_loop(self: &Arc<Self>) {
        let weak: Weak<BalancerFactory> = Arc::downgrade(self);
        let interval = self.options.expire_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(factory) => factory.sweep(),
                    None => return,
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn cached_targets(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{StaticResolver, WeightedRandomBalancer};
    use std::sync::atomic::AtomicUsize;

    struct CountingResolver {
        inner: StaticResolver,
        calls: AtomicUsize,
        name: &'static str,
    }

    impl Resolver for CountingResolver {
        fn name(&self) -> &str {
            self.name
        }

        fn target(&self, req: &Request) -> String {
            self.inner.target(req)
        }

        fn resolve<'a>(
            &'a self,
            desc: &'a str,
        ) -> crate::common::BoxFuture<'a, crate::Result<DiscoveryResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(desc)
        }
    }

    fn svc_request() -> Request {
        let mut req = Request::new(http::Method::GET, "/ping".parse().unwrap());
        req.set_host("svc1");
        req
    }

    fn counting_factory(name: &'static str) -> (Arc<BalancerFactory>, Arc<CountingResolver>) {
        let resolver = Arc::new(CountingResolver {
            inner: StaticResolver::new().add(
                "svc1",
                vec![
                    Instance::new("127.0.0.1:8888", 10),
                    Instance::new("127.0.0.1:8889", 10),
                ],
            ),
            calls: AtomicUsize::new(0),
            name,
        });
        let factory = balancer_factory(
            resolver.clone(),
            Arc::new(WeightedRandomBalancer::new()),
            DiscoveryOptions::default(),
        );
        (factory, resolver)
    }

    #[tokio::test]
    async fn factories_are_shared_by_configuration() {
        let (a, _) = counting_factory("shared-test");
        let (b, _) = counting_factory("shared-test");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn concurrent_lookups_resolve_once() {
        let (factory, resolver) = counting_factory("singleflight-test");
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let factory = factory.clone();
            tasks.push(tokio::spawn(async move {
                factory.get_instance(&svc_request()).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(factory.cached_targets(), 1);
    }

    #[tokio::test]
    async fn unknown_service_is_an_error_and_retries() {
        let (factory, resolver) = counting_factory("unknown-test");
        let mut req = Request::new(http::Method::GET, "/".parse().unwrap());
        req.set_host("missing");
        assert!(factory.get_instance(&req).await.is_err());
        assert!(factory.get_instance(&req).await.is_err());
        // Failed flights do not cache; each call re-resolves.
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn two_phase_expiration_with_access_in_between() {
        let (factory, _) = counting_factory("expire-test");
        factory.get_instance(&svc_request()).await.unwrap();
        assert_eq!(factory.cached_targets(), 1);

        // First sweep marks.
        factory.sweep();
        assert_eq!(factory.cached_targets(), 1);

        // An access between ticks clears the mark, so the entry survives
        // the next sweep too.
        factory.get_instance(&svc_request()).await.unwrap();
        factory.sweep();
        assert_eq!(factory.cached_targets(), 1);

        // Two quiet sweeps in a row evict.
        factory.sweep();
        assert_eq!(factory.cached_targets(), 0);
    }

    #[tokio::test]
    async fn refresh_preserves_entries_on_error() {
        let (factory, resolver) = counting_factory("refresh-test");
        factory.get_instance(&svc_request()).await.unwrap();
        let before = resolver.calls.load(Ordering::SeqCst);
        factory.refresh_all().await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), before + 1);
        assert!(factory.get_instance(&svc_request()).await.is_ok());
    }
}
