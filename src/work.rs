//! Deferred units of work.

use std::future::Future;

use async_trait::async_trait;

use crate::error::BoxError;

/// A unit of work that runs once and produces a value or fails.
///
/// The queue engine only ever sees this trait, so it stays independent of
/// what the work is. Any `FnOnce() -> impl Future<Output = Result<T, BoxError>>`
/// closure implements it.
#[async_trait]
pub trait Work<T>: Send + 'static {
    async fn execute(self: Box<Self>) -> Result<T, BoxError>;
}

#[async_trait]
impl<T, F, Fut> Work<T> for F
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    async fn execute(self: Box<Self>) -> Result<T, BoxError> {
        (*self)().await
    }
}

/// Type-erased work, as stored in queues.
pub type BoxWork<T> = Box<dyn Work<T>>;

/// Box a closure as [`BoxWork`].
pub fn boxed<T, W>(work: W) -> BoxWork<T>
where
    W: Work<T>,
{
    Box::new(work)
}
