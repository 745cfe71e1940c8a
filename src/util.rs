use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Best-effort extraction of a human-readable message from a panic
/// payload.
pub(crate) fn panic_message(info: &(dyn Any + Send)) -> String {
    if let Some(message) = info.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = info.downcast_ref::<String>() {
        return message.clone();
    }
    "handler panicked".to_owned()
}

/// Wraps one handler run in a Sentry transaction named after the job's
/// type key.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "automation.execute");
    let transaction = sentry_core::start_transaction(tx_ctx);

    let result = callback().await;

    transaction.set_status(match result {
        Ok(_) => SpanStatus::Ok,
        Err(_) => SpanStatus::UnknownError,
    });
    transaction.finish();

    result
}
