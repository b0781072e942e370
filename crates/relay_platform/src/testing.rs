#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use crate::ConnectionCounter;

#[derive(Default)]
pub(crate) struct RecordingCounter {
	pub value: AtomicI64,
	pub increments: AtomicUsize,
	pub decrements: AtomicUsize,
}

impl RecordingCounter {
	pub fn value(&self) -> i64 {
		self.value.load(Ordering::SeqCst)
	}
}

impl ConnectionCounter for RecordingCounter {
	fn increment(&self) {
		self.increments.fetch_add(1, Ordering::SeqCst);
		self.value.fetch_add(1, Ordering::SeqCst);
	}

	fn decrement(&self) {
		self.decrements.fetch_add(1, Ordering::SeqCst);
		self.value.fetch_sub(1, Ordering::SeqCst);
	}
}
