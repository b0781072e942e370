#![forbid(unsafe_code)]

use relay_domain::EventCategory;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct WireMessage {
	event: String,
	#[serde(default)]
	data: Value,
}

/// A decoded fallback frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackFrame {
	StreamEnd,
	Message { category: EventCategory, payload: Value },
}

/// Decode one `{"event": .., "data": ..}` text frame.
pub fn decode_frame(text: &str) -> Result<FallbackFrame, serde_json::Error> {
	let msg: WireMessage = serde_json::from_str(text)?;
	Ok(match msg.event.as_str() {
		"streamEnd" => FallbackFrame::StreamEnd,
		name => FallbackFrame::Message {
			category: map_event_name(name),
			payload: msg.data,
		},
	})
}

fn map_event_name(name: &str) -> EventCategory {
	match name {
		"share" | "follow" => EventCategory::Social,
		other => EventCategory::from_name(other),
	}
}
