//! Aggregation core for reporting outbound traffic from cluster workloads
//! to destinations outside the cluster.
//!
//! Capture sources feed [`types::Intent`] observations into an
//! [`holder::IntentsHolder`]; [`dispatcher::run_periodic_upload`] drains it
//! on an interval and hands each batch to the registered callbacks.

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod holder;
pub mod source;
pub mod types;
pub mod upload;
