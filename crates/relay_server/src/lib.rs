#![forbid(unsafe_code)]

pub mod config;
pub mod providers;
pub mod server;
