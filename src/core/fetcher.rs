use crate::core::models::ImageTask;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("HTTP status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Transport error for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Retrieves the raw bytes behind one URL. One call is one attempt.
pub trait ImageTransport: Send + Sync + 'static {
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// reqwest-backed transport. The client timeout bounds each attempt.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("claimcull/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl ImageTransport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let transport_error = |e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(transport_error)?;
        Ok(body.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(300),
        }
    }
}

/// Bounded-concurrency fetcher with fixed-delay retry.
///
/// A permit is held for the full retry sequence of a URL, so at most
/// `concurrency` URLs are being worked on at any moment. A URL that exhausts
/// its attempts comes back without bytes; it never fails its siblings.
pub struct Fetcher<T: ImageTransport> {
    transport: Arc<T>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl<T: ImageTransport> Fetcher<T> {
    pub fn new(transport: Arc<T>, concurrency: usize, policy: RetryPolicy) -> Self {
        Self {
            transport,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            policy,
        }
    }

    pub async fn fetch(&self, url: &str) -> ImageTask {
        let mut task = ImageTask::new(url);

        let Ok(_permit) = self.permits.acquire().await else {
            log::warn!("Fetch limiter closed, discarding {}", url);
            return task;
        };

        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.get(url).await {
                Ok(bytes) => {
                    log::debug!("Fetched {} ({} bytes, attempt {})", url, bytes.len(), attempt);
                    task.bytes = Some(bytes);
                    return task;
                }
                Err(e) => {
                    log::debug!("Fetch attempt {}/{} failed: {}", attempt, attempts, e);
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
            }
        }

        log::warn!("Giving up on {} after {} attempt(s)", url, attempts);
        task
    }
}
