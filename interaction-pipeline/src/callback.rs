//! Outbound webhook notifications for persisted interactions.
use std::time;

use interaction_common::kv::FailureCounter;
use interaction_common::retry::RetryPolicy;
use tracing::{debug, info, warn};

use crate::error::CallbackError;

/// Sends one notification per interaction and keeps the owning user's failure counter up to date.
/// Once a user reaches `max_failures` consecutive failures, callers are expected to stop
/// dispatching until a delivery succeeds again.
pub struct CallbackDispatcher {
    /// The client used for HTTP requests.
    client: reqwest::Client,
    /// How many times, and how far apart, a callback is attempted.
    retry_policy: RetryPolicy,
    failures: FailureCounter,
    max_failures: i64,
}

impl CallbackDispatcher {
    pub fn new(
        request_timeout: time::Duration,
        retry_policy: RetryPolicy,
        failures: FailureCounter,
        max_failures: i64,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("Interaction Pipeline Callback")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            retry_policy,
            failures,
            max_failures,
        })
    }

    /// Whether callbacks for `user_id` are currently suppressed by its failure counter.
    /// A counter that cannot be read does not suppress anything.
    pub async fn is_suppressed(&self, user_id: i64) -> bool {
        match self.failures.count(user_id).await {
            Ok(count) => count >= self.max_failures,
            Err(error) => {
                warn!(user_id, "failed to read callback failure counter: {}", error);
                false
            }
        }
    }

    /// Deliver a callback for an interaction of `user_id`, retrying according to the retry policy.
    /// Success clears the user's failure counter, giving up increments it.
    pub async fn deliver(&self, user_id: i64, url: &str) -> Result<(), CallbackError> {
        let now = tokio::time::Instant::now();

        let result = self.send_with_retries(url).await;

        let elapsed = now.elapsed().as_secs_f64();
        metrics::histogram!("callback_delivery_duration_seconds").record(elapsed);

        match &result {
            Ok(()) => {
                metrics::counter!("callback_deliveries_total", "outcome" => "delivered")
                    .increment(1);

                if let Err(error) = self.failures.clear(user_id).await {
                    warn!(user_id, "failed to clear callback failure counter: {}", error);
                }
            }
            Err(error) => {
                metrics::counter!("callback_deliveries_total", "outcome" => "failed").increment(1);

                match self.failures.record_failure(user_id).await {
                    Ok(failures) => info!(user_id, failures, "callback failed: {}", error),
                    Err(kv_error) => warn!(
                        user_id,
                        "callback failed ({}) and the failure could not be counted: {}",
                        error,
                        kv_error
                    ),
                }
            }
        }

        result
    }

    async fn send_with_retries(&self, url: &str) -> Result<(), CallbackError> {
        let url: reqwest::Url = url.parse().map_err(CallbackError::ParseUrlError)?;
        let mut attempt = 1;

        loop {
            metrics::counter!("callback_attempts_total").increment(1);

            match send_callback(&self.client, url.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) if self.retry_policy.should_retry(attempt) => {
                    let retry_interval = self.retry_policy.retry_interval(attempt);
                    debug!(
                        %url,
                        attempt,
                        "callback attempt failed, retrying in {:?}: {}",
                        retry_interval,
                        error
                    );
                    tokio::time::sleep(retry_interval).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(CallbackError::RetriesExhausted {
                        attempts: attempt,
                        error,
                    })
                }
            }
        }
    }
}

/// POST an empty body to `url`.
/// Any response counts as delivered, whatever its status. The body is always read to the end
/// so the connection can go back to the pool.
async fn send_callback(client: &reqwest::Client, url: reqwest::Url) -> Result<(), reqwest::Error> {
    let response = client.post(url).send().await?;
    let status = response.status();

    if let Err(error) = response.bytes().await {
        debug!(%status, "failed to drain callback response body: {}", error);
    }

    Ok(())
}
