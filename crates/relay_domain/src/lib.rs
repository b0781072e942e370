#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Live-stream owner identifier requested by a client (the provider's `uniqueId`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(String);

impl ViewerId {
	/// Create a non-empty `ViewerId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("viewer id contains whitespace: {trimmed}")));
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ViewerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ViewerId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ViewerId::new(s.to_string())
	}
}

/// Network identity used as the rate-limiting key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientOrigin(String);

impl ClientOrigin {
	/// Wrap an already-resolved origin string.
	pub fn new(origin: impl Into<String>) -> Self {
		Self(origin.into())
	}

	/// Resolve the origin of a peer.
	///
	/// Loopback peers are assumed to be a local reverse proxy; when
	/// `trust_forwarded` is set the first `x-forwarded-for` hop is used instead.
	pub fn resolve(peer: IpAddr, forwarded_for: Option<&str>, trust_forwarded: bool) -> Self {
		if trust_forwarded
			&& is_loopback(peer)
			&& let Some(first) = forwarded_for
				.and_then(|v| v.split(',').next())
				.map(str::trim)
				.filter(|v| !v.is_empty())
		{
			return Self(first.to_string());
		}
		Self(peer.to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

fn is_loopback(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => v4.is_loopback(),
		IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
	}
}

impl fmt::Display for ClientOrigin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Per-category live events relayed verbatim to clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventCategory {
	RoomUser,
	Member,
	Chat,
	Gift,
	Social,
	Like,
	QuestionNew,
	LinkMicBattle,
	LinkMicArmies,
	LiveIntro,
	Emote,
	Envelope,
	Subscribe,
	/// Provider-defined event outside the known set; forwarded under its own name.
	Other(String),
}

impl EventCategory {
	/// Every known category, in forwarding order.
	pub const KNOWN: [EventCategory; 13] = [
		EventCategory::RoomUser,
		EventCategory::Member,
		EventCategory::Chat,
		EventCategory::Gift,
		EventCategory::Social,
		EventCategory::Like,
		EventCategory::QuestionNew,
		EventCategory::LinkMicBattle,
		EventCategory::LinkMicArmies,
		EventCategory::LiveIntro,
		EventCategory::Emote,
		EventCategory::Envelope,
		EventCategory::Subscribe,
	];

	/// Stable outward event name.
	pub fn as_str(&self) -> &str {
		match self {
			Self::RoomUser => "roomUser",
			Self::Member => "member",
			Self::Chat => "chat",
			Self::Gift => "gift",
			Self::Social => "social",
			Self::Like => "like",
			Self::QuestionNew => "questionNew",
			Self::LinkMicBattle => "linkMicBattle",
			Self::LinkMicArmies => "linkMicArmies",
			Self::LiveIntro => "liveIntro",
			Self::Emote => "emote",
			Self::Envelope => "envelope",
			Self::Subscribe => "subscribe",
			Self::Other(name) => name,
		}
	}

	/// Map a provider event name; unknown names become `Other`.
	pub fn from_name(name: &str) -> Self {
		Self::KNOWN
			.iter()
			.find(|c| c.as_str() == name)
			.cloned()
			.unwrap_or_else(|| Self::Other(name.to_string()))
	}
}

impl fmt::Display for EventCategory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Which provider tier served a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
	Primary,
	Fallback,
}

impl ProviderKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ProviderKind::Primary => "primary",
			ProviderKind::Fallback => "fallback",
		}
	}

	/// Marker attached to the outward connected payload.
	pub const fn marker(self) -> Option<&'static str> {
		match self {
			ProviderKind::Primary => None,
			ProviderKind::Fallback => Some("tikfinity"),
		}
	}
}

impl fmt::Display for ProviderKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Connected-state payload reported once per logical session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
	pub room_id: String,
	pub upgraded_to_websocket: bool,
	pub is_connected: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub provider_marker: Option<String>,
}

impl ConnectionInfo {
	/// Connected payload for `room_id` served by `kind`.
	pub fn connected(room_id: impl Into<String>, kind: ProviderKind) -> Self {
		Self {
			room_id: room_id.into(),
			upgraded_to_websocket: true,
			is_connected: true,
			provider_marker: kind.marker().map(str::to_string),
		}
	}
}

/// Caller-supplied provider options after sanitization.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionOptions(Map<String, Value>);

impl ConnectionOptions {
	/// Keys that would let a caller steer the relay's own HTTP/websocket transport.
	pub const TRANSPORT_OVERRIDE_KEYS: [&'static str; 2] = ["requestOptions", "websocketOptions"];

	const SESSION_ID_KEY: &'static str = "sessionId";
	const EXTENDED_GIFT_INFO_KEY: &'static str = "enableExtendedGiftInfo";

	/// Accept arbitrary caller JSON; anything but an object yields empty options.
	pub fn sanitize(raw: &Value) -> Self {
		let Value::Object(map) = raw else {
			return Self::default();
		};
		let mut map = map.clone();
		for key in Self::TRANSPORT_OVERRIDE_KEYS {
			map.remove(key);
		}
		Self(map)
	}

	pub fn session_id(&self) -> Option<&str> {
		self.0.get(Self::SESSION_ID_KEY).and_then(Value::as_str)
	}

	pub fn set_session_id(&mut self, session_id: impl Into<String>) {
		self.0
			.insert(Self::SESSION_ID_KEY.to_string(), Value::String(session_id.into()));
	}

	pub fn enable_extended_gift_info(&self) -> bool {
		self.0
			.get(Self::EXTENDED_GIFT_INFO_KEY)
			.and_then(Value::as_bool)
			.unwrap_or(false)
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.0.get(key)
	}

	pub fn as_map(&self) -> &Map<String, Value> {
		&self.0
	}
}

impl fmt::Debug for ConnectionOptions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut dbg = f.debug_map();
		for (k, v) in &self.0 {
			if k == Self::SESSION_ID_KEY {
				dbg.entry(k, &"<redacted>");
			} else {
				dbg.entry(k, v);
			}
		}
		dbg.finish()
	}
}

#[cfg(test)]
mod tests {
	use std::net::{Ipv4Addr, Ipv6Addr};

	use serde_json::json;

	use super::*;

	#[test]
	fn viewer_id_rejects_empty_and_whitespace() {
		assert_eq!(ViewerId::new("   "), Err(ParseIdError::Empty));
		assert!(ViewerId::new("two words").is_err());
		assert_eq!(ViewerId::new(" streamer ").unwrap().as_str(), "streamer");
	}

	#[test]
	fn origin_uses_forwarded_for_only_behind_loopback() {
		let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
		let mapped = IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped());
		let public = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));

		assert_eq!(
			ClientOrigin::resolve(loopback, Some("9.9.9.9, 10.0.0.1"), true).as_str(),
			"9.9.9.9"
		);
		assert_eq!(ClientOrigin::resolve(mapped, Some("8.8.8.8"), true).as_str(), "8.8.8.8");
		assert_eq!(ClientOrigin::resolve(IpAddr::V6(Ipv6Addr::LOCALHOST), None, true).as_str(), "::1");
		assert_eq!(ClientOrigin::resolve(public, Some("9.9.9.9"), true).as_str(), "1.2.3.4");
		assert_eq!(ClientOrigin::resolve(loopback, Some("9.9.9.9"), false).as_str(), "127.0.0.1");
	}

	#[test]
	fn sanitize_strips_transport_overrides() {
		let raw = json!({
			"enableExtendedGiftInfo": true,
			"requestOptions": { "proxy": "http://evil" },
			"websocketOptions": { "headers": {} },
			"processInitialData": false,
		});

		let opts = ConnectionOptions::sanitize(&raw);
		assert!(opts.get("requestOptions").is_none());
		assert!(opts.get("websocketOptions").is_none());
		assert!(opts.enable_extended_gift_info());
		assert_eq!(opts.get("processInitialData"), Some(&json!(false)));
	}

	#[test]
	fn sanitize_non_object_yields_empty() {
		assert!(ConnectionOptions::sanitize(&json!("nope")).as_map().is_empty());
		assert!(ConnectionOptions::sanitize(&Value::Null).as_map().is_empty());
	}

	#[test]
	fn debug_redacts_session_id() {
		let mut opts = ConnectionOptions::default();
		opts.set_session_id("secret-cookie");
		assert_eq!(opts.session_id(), Some("secret-cookie"));
		assert!(!format!("{opts:?}").contains("secret-cookie"));
	}

	#[test]
	fn category_names_roundtrip() {
		for c in EventCategory::KNOWN {
			assert_eq!(EventCategory::from_name(c.as_str()), c);
		}
		assert_eq!(
			EventCategory::from_name("goalUpdate"),
			EventCategory::Other("goalUpdate".to_string())
		);
	}

	#[test]
	fn connected_payload_carries_marker_for_fallback_only() {
		let primary = serde_json::to_value(ConnectionInfo::connected("7", ProviderKind::Primary)).unwrap();
		assert_eq!(primary, json!({"roomId": "7", "upgradedToWebsocket": true, "isConnected": true}));

		let fallback = ConnectionInfo::connected("tikfinity_x", ProviderKind::Fallback);
		assert_eq!(fallback.provider_marker.as_deref(), Some("tikfinity"));
	}
}
