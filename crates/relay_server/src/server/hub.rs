#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_domain::ClientOrigin;
use tracing::{debug, info};
use uuid::Uuid;

use crate::server::outward::{OutwardEvent, OutwardSink};
use crate::server::statistics::{Statistics, StatisticsSink};
use crate::server::supervisor::{ConnectionSupervisor, SupervisorContext};

struct HubEntry {
	supervisor: Arc<ConnectionSupervisor>,
	sink: Arc<dyn OutwardSink>,
}

/// Registry of live client sessions, one supervisor each.
pub struct SessionHub {
	ctx: SupervisorContext,
	trust_forwarded_for: bool,
	sessions: Mutex<HashMap<Uuid, HubEntry>>,
}

impl SessionHub {
	pub fn new(ctx: SupervisorContext, trust_forwarded_for: bool) -> Self {
		Self {
			ctx,
			trust_forwarded_for,
			sessions: Mutex::new(HashMap::new()),
		}
	}

	/// Register a client session arriving from `peer`.
	///
	/// `forwarded_for` is the raw `X-Forwarded-For` header, honoured only when the hub trusts it.
	pub fn open_session(
		&self,
		peer: IpAddr,
		forwarded_for: Option<&str>,
		sink: Arc<dyn OutwardSink>,
	) -> (Uuid, Arc<ConnectionSupervisor>) {
		let origin = ClientOrigin::resolve(peer, forwarded_for, self.trust_forwarded_for);
		let key = Uuid::new_v4();
		let supervisor = Arc::new(ConnectionSupervisor::new(origin.clone(), self.ctx.clone(), sink.clone()));

		let live = {
			let mut sessions = self.sessions.lock();
			sessions.insert(
				key,
				HubEntry {
					supervisor: supervisor.clone(),
					sink,
				},
			);
			sessions.len()
		};
		metrics::gauge!("relay_client_sessions").set(live as f64);
		info!(%key, %origin, "client session opened");
		(key, supervisor)
	}

	pub fn session(&self, key: &Uuid) -> Option<Arc<ConnectionSupervisor>> {
		self.sessions.lock().get(key).map(|e| e.supervisor.clone())
	}

	/// Close and forget one session. Returns false for unknown keys.
	pub fn close_session(&self, key: &Uuid) -> bool {
		let (entry, live) = {
			let mut sessions = self.sessions.lock();
			let entry = sessions.remove(key);
			(entry, sessions.len())
		};
		let Some(entry) = entry else {
			return false;
		};
		entry.supervisor.close();
		metrics::gauge!("relay_client_sessions").set(live as f64);
		info!(%key, origin = %entry.supervisor.origin(), "client session closed");
		true
	}

	pub fn close_all(&self) -> usize {
		let drained: Vec<_> = self.sessions.lock().drain().collect();
		for (_, entry) in &drained {
			entry.supervisor.close();
		}
		metrics::gauge!("relay_client_sessions").set(0.0);
		drained.len()
	}

	pub fn live_sessions(&self) -> usize {
		self.sessions.lock().len()
	}
}

impl StatisticsSink for SessionHub {
	fn broadcast(&self, stats: Statistics) {
		let sinks: Vec<_> = self.sessions.lock().values().map(|e| e.sink.clone()).collect();
		debug!(receivers = sinks.len(), "fanning out statistics");
		for sink in sinks {
			sink.emit(OutwardEvent::Statistic(stats));
		}
	}
}
