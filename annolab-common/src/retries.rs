use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;

use tracing::warn;

use crate::config::RetryConfig;

/// Runs `action` with the given retry policy, retrying errors for which
/// `is_retriable` returns true. The last error is returned when the
/// attempts are exhausted.
pub async fn with_retries<In, F, R, E>(
    target: &'static str,
    op: &'static str,
    op_details: Option<String>,
    config: &RetryConfig,
    input: &In,
    action: F,
    is_retriable: fn(&E) -> bool,
) -> Result<R, E>
where
    E: Display,
    F: for<'a> Fn(&'a In) -> Pin<Box<dyn Future<Output = Result<R, E>> + Send + 'a>>,
{
    let mut attempt = 1;
    loop {
        match action(input).await {
            Ok(result) => return Ok(result),
            Err(error) if attempt < config.max_attempts && is_retriable(&error) => {
                let delay = config.delay(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    details = op_details.as_deref().unwrap_or(""),
                    "{target}/{op} failed, retrying: {error}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
