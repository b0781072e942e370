#![forbid(unsafe_code)]

use relay_domain::{ConnectionOptions, ViewerId};
use relay_platform::{ProviderBinding, ProviderError, ProviderFactory};
use tracing::warn;

/// Provider used when no upstream integration is wired in. Every session fails to initialise.
pub struct NullProvider;

impl ProviderFactory for NullProvider {
	fn name(&self) -> &'static str {
		"null"
	}

	fn create(&self, viewer: &ViewerId, _options: &ConnectionOptions) -> Result<ProviderBinding, ProviderError> {
		warn!(%viewer, "rejecting session: no upstream provider configured");
		Err(ProviderError::Init(
			"no upstream provider SDK configured; enable the demo provider for local runs".to_string(),
		))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_session_fails_to_initialise() {
		let viewer = ViewerId::new("streamer").expect("viewer");
		let result = NullProvider.create(&viewer, &ConnectionOptions::default());
		assert!(matches!(result, Err(ProviderError::Init(_))));
	}
}
