//! Client-side middleware: composed endpoints around request execution.

use std::sync::Arc;

use crate::common::BoxFuture;
use crate::request::Request;
use crate::response::Response;

/// One step of client request execution.
pub trait Endpoint: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        req: &'a mut Request,
        resp: &'a mut Response,
    ) -> BoxFuture<'a, crate::Result<()>>;
}

impl<F> Endpoint for F
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, crate::Result<()>>
        + Send
        + Sync
        + 'static,
{
    fn call<'a>(
        &'a self,
        req: &'a mut Request,
        resp: &'a mut Response,
    ) -> BoxFuture<'a, crate::Result<()>> {
        (self)(req, resp)
    }
}

pub type DynEndpoint = Arc<dyn Endpoint>;

/// Wraps an endpoint in another.
pub type Middleware = Arc<dyn Fn(DynEndpoint) -> DynEndpoint + Send + Sync>;

/// Composes `middlewares` around `endpoint`, iterating in reverse so the
/// first registered middleware runs outermost. The dedicated `last`
/// middleware — kept out of the regular list so re-chaining cannot install
/// it twice — sits innermost, right around the endpoint.
pub(crate) fn chain(
    middlewares: &[Middleware],
    last: Option<&Middleware>,
    endpoint: DynEndpoint,
) -> DynEndpoint {
    let mut ep = endpoint;
    if let Some(last) = last {
        ep = last(ep);
    }
    for mw in middlewares.iter().rev() {
        ep = mw(ep);
    }
    ep
}
