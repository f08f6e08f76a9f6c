use std::future::Future;
use std::pin::Pin;

pub(crate) mod buf;

/// An owned, type-erased future, the shape every handler seam in gale uses.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
