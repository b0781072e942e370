#![forbid(unsafe_code)]

pub mod health;
pub mod hub;
pub mod outward;
pub mod rate_limiter;
pub mod statistics;
pub mod supervisor;

#[cfg(test)]
mod hub_tests;

#[cfg(test)]
mod rate_limiter_tests;
