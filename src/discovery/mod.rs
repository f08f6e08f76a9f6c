//! Service discovery: resolvers, load balancers, and the shared
//! resolver→balancer factory cache.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::BoxFuture;
use crate::request::Request;

pub mod balance;
pub mod factory;

pub use self::balance::{Balancer, WeightedRandomBalancer};
pub use self::factory::{balancer_factory, BalancerFactory, DiscoveryOptions};

/// One discovered service instance.
#[derive(Clone, Debug)]
pub struct Instance {
    pub network: String,
    pub address: String,
    /// Relative selection weight; non-positive weights exclude the
    /// instance.
    pub weight: i32,
    pub tags: HashMap<String, String>,
}

impl Instance {
    pub fn new(address: impl Into<String>, weight: i32) -> Instance {
        Instance {
            network: "tcp".to_owned(),
            address: address.into(),
            weight,
            tags: HashMap::new(),
        }
    }
}

/// An immutable resolution outcome, shared by reference.
#[derive(Clone, Debug)]
pub struct DiscoveryResult {
    /// Factory cache key, prefixed with the resolver name so distinct
    /// resolvers never collide on identical target descriptions.
    pub cache_key: String,
    pub instances: Vec<Arc<Instance>>,
}

/// Produces service instances for a target description.
pub trait Resolver: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Derives the target description from a request (host plus whatever
    /// tags the resolver understands).
    fn target(&self, req: &Request) -> String;

    fn resolve<'a>(&'a self, desc: &'a str) -> BoxFuture<'a, crate::Result<DiscoveryResult>>;
}

/// A fixed-instance resolver, useful for static endpoint lists and tests.
pub struct StaticResolver {
    instances: HashMap<String, Vec<Arc<Instance>>>,
}

impl StaticResolver {
    pub fn new() -> StaticResolver {
        StaticResolver {
            instances: HashMap::new(),
        }
    }

    pub fn add(mut self, service: impl Into<String>, instances: Vec<Instance>) -> StaticResolver {
        self.instances
            .insert(service.into(), instances.into_iter().map(Arc::new).collect());
        self
    }
}

impl Default for StaticResolver {
    fn default() -> StaticResolver {
        StaticResolver::new()
    }
}

impl Resolver for StaticResolver {
    fn name(&self) -> &str {
        "static"
    }

    fn target(&self, req: &Request) -> String {
        req.host().unwrap_or("").to_owned()
    }

    fn resolve<'a>(&'a self, desc: &'a str) -> BoxFuture<'a, crate::Result<DiscoveryResult>> {
        Box::pin(async move {
            match self.instances.get(desc) {
                Some(instances) => Ok(DiscoveryResult {
                    cache_key: desc.to_owned(),
                    instances: instances.clone(),
                }),
                None => Err(crate::Error::new_user_resolve(format!(
                    "unknown service {:?}",
                    desc
                ))),
            }
        })
    }
}

/// Client middleware that resolves the request host through `factory` and
/// rewrites the target to the picked instance.
pub fn service_discovery_middleware(factory: Arc<BalancerFactory>) -> crate::client::Middleware {
    Arc::new(move |next: crate::client::DynEndpoint| -> crate::client::DynEndpoint {
        Arc::new(DiscoveryEndpoint {
            factory: factory.clone(),
            next,
        })
    })
}

struct DiscoveryEndpoint {
    factory: Arc<BalancerFactory>,
    next: crate::client::DynEndpoint,
}

impl crate::client::Endpoint for DiscoveryEndpoint {
    fn call<'a>(
        &'a self,
        req: &'a mut Request,
        resp: &'a mut crate::response::Response,
    ) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            let instance = self.factory.get_instance(req).await?;
            let service_host = req.host().unwrap_or("").to_owned();
            let mut parts = req.uri().clone().into_parts();
            parts.authority = Some(
                instance
                    .address
                    .parse()
                    .map_err(|_| crate::Error::new_parse(crate::error::Parse::Uri))?,
            );
            if parts.scheme.is_none() {
                parts.scheme = Some(http::uri::Scheme::HTTP);
            }
            if parts.path_and_query.is_none() {
                parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
            }
            let uri = http::Uri::from_parts(parts)
                .map_err(|_| crate::Error::new_parse(crate::error::Parse::Uri))?;
            req.set_uri(uri);
            if !service_host.is_empty() {
                req.set_host(&service_host);
            }
            self.next.call(req, resp).await
        })
    }
}
