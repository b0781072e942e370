#![forbid(unsafe_code)]

mod protocol;
mod session;


pub use protocol::{FallbackFrame, decode_frame};
pub use session::{FallbackConfig, FallbackSession, fallback_url};
