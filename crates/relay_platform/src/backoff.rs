#![forbid(unsafe_code)]

use std::time::Duration;

/// Reconnect policy for the primary upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
	pub enabled: bool,
	pub initial_delay: Duration,
	pub max_delay: Duration,
	pub max_attempts: u32,
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self {
			enabled: true,
			initial_delay: Duration::from_millis(1000),
			max_delay: Duration::from_millis(32000),
			max_attempts: 5,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
	Retry { delay: Duration, attempt: u32 },
	GiveUp,
}

/// Doubling backoff with a ceiling. `attempt` counts retries already fired.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
	policy: BackoffPolicy,
	attempt: u32,
	current_delay: Duration,
}

impl ExponentialBackoff {
	pub fn new(policy: BackoffPolicy) -> Self {
		Self {
			policy,
			attempt: 0,
			current_delay: policy.initial_delay,
		}
	}

	pub fn policy(&self) -> &BackoffPolicy {
		&self.policy
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	pub fn current_delay(&self) -> Duration {
		self.current_delay
	}

	/// What to do after a link failure, without consuming the attempt.
	pub fn next_step(&self) -> RetryStep {
		if !self.policy.enabled || self.attempt >= self.policy.max_attempts {
			return RetryStep::GiveUp;
		}
		RetryStep::Retry {
			delay: self.current_delay,
			attempt: self.attempt + 1,
		}
	}

	/// Called when a scheduled retry fires.
	pub fn advance(&mut self) {
		self.attempt = self.attempt.saturating_add(1);
		self.current_delay = self.current_delay.saturating_mul(2).min(self.policy.max_delay);
	}

	/// Called after a link is established.
	pub fn reset(&mut self) {
		self.attempt = 0;
		self.current_delay = self.policy.initial_delay;
	}
}

/// Linear retry used by the fallback link: `base_delay * attempt`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
	base_delay: Duration,
	max_attempts: u32,
	attempt: u32,
}

impl LinearBackoff {
	pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
		Self {
			base_delay,
			max_attempts,
			attempt: 0,
		}
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	/// Consumes one attempt and returns its delay, or `GiveUp` once the budget is spent.
	pub fn next_step(&mut self) -> RetryStep {
		if self.attempt >= self.max_attempts {
			return RetryStep::GiveUp;
		}
		self.attempt += 1;
		RetryStep::Retry {
			delay: self.base_delay.saturating_mul(self.attempt),
			attempt: self.attempt,
		}
	}

	pub fn reset(&mut self) {
		self.attempt = 0;
	}
}
