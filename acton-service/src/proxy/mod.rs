//! Upstream Client: forwards matched requests to the route's upstream.

pub mod client;

pub use client::{RetryPolicy, UpstreamClient};
