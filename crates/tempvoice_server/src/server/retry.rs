#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use tempvoice_platform::PlatformError;
use tracing::warn;

/// Bounded exponential backoff for transient platform failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Total attempts, including the first.
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(30),
		}
	}
}

impl RetryPolicy {
	pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
		Self {
			max_attempts: max_attempts.max(1),
			base_delay,
			..Self::default()
		}
	}

	/// Delay before attempt `attempt + 1`. A server-provided retry-after wins.
	pub fn delay_for(&self, attempt: u32, err: &PlatformError) -> Duration {
		if let Some(hint) = err.retry_after() {
			return hint.min(self.max_delay);
		}
		let pow = attempt.saturating_sub(1).min(16);
		let ms = self.base_delay.as_millis().saturating_mul(1u128 << pow);
		Duration::from_millis(ms.min(u64::MAX as u128) as u64).min(self.max_delay)
	}

	/// Run `op`, retrying transient errors.
	pub async fn run<T, F, Fut>(&self, label: &'static str, op: F) -> Result<T, PlatformError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, PlatformError>>,
	{
		self.run_while(label, || true, op).await
	}

	/// Like [`RetryPolicy::run`], but gives up quietly once `still_wanted` turns false
	/// between attempts. The last error is returned in that case.
	pub async fn run_while<T, F, Fut, W>(&self, label: &'static str, still_wanted: W, mut op: F) -> Result<T, PlatformError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, PlatformError>>,
		W: Fn() -> bool,
	{
		let mut attempt: u32 = 1;
		loop {
			match op().await {
				Ok(v) => return Ok(v),
				Err(e) if e.is_transient() && attempt < self.max_attempts => {
					let delay = self.delay_for(attempt, &e);
					warn!(
						label,
						attempt,
						delay_ms = delay.as_millis() as u64,
						error = %e,
						"transient platform failure; retrying"
					);
					metrics::counter!("tempvoice_platform_retries_total", "op" => label).increment(1);
					tokio::time::sleep(delay).await;
					if !still_wanted() {
						return Err(e);
					}
					attempt += 1;
				}
				Err(e) => return Err(e),
			}
		}
	}
}
