use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

use crate::error::BoxError;

/// A remote data-access function wrapped by the cache.
///
/// Arguments are passed positionally as a list of JSON values. The function is expected to already deal with transport
/// problems, retries and the like. Whatever it returns is what the caller of the decorated function gets.
///
/// Any `Fn(Vec<Value>) -> impl Future<Output = Result<Value, BoxError>>` closure implements the trait.
#[async_trait]
pub trait ApiFunction: Send + Sync + 'static {
    async fn call(&self, args: Vec<Value>) -> Result<Value, BoxError>;
}

#[async_trait]
impl<F, Fut> ApiFunction for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value, BoxError> {
        (self)(args).await
    }
}
