#![forbid(unsafe_code)]

mod demo;
mod null;

pub use demo::DemoProvider;
pub use null::NullProvider;
