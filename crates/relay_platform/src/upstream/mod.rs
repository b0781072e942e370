#![forbid(unsafe_code)]

mod session;


pub use session::UpstreamSession;
