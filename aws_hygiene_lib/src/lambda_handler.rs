use anyhow::{Error, format_err};
use lambda_runtime::{Error as LambdaError, LambdaEvent, service_fn};
use log::info;
use serde::{Serialize, de::DeserializeOwned};
use std::{future::Future, sync::Arc};

/// Serve `handler` from the lambda runtime until the runtime shuts down.
/// Each invocation's payload is deserialized into `E`, the handler's output
/// is returned to the invoker.
/// # Errors
/// Returns error if the lambda runtime fails
pub async fn run_lambda<E, R, F, Fut>(handler: F) -> Result<(), Error>
where
    E: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    info!("starting lambda runtime");
    let handler = Arc::new(handler);
    lambda_runtime::run(service_fn(move |event: LambdaEvent<E>| {
        let handler = handler.clone();
        async move { handler(event.payload).await.map_err(LambdaError::from) }
    }))
    .await
    .map_err(|e| format_err!("lambda runtime failed: {e}"))
}
