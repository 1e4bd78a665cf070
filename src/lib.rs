//! Computed-attribute aggregation and message-driven metric engine.
//!
//! Two resource kinds are hosted: aggregators, whose attributes are derived
//! from the attributes of other resources, and message-driven resources,
//! whose attributes are metrics fed by measurement notifications.

pub mod agent;
pub mod aggregator;
pub mod attribute;
pub mod cluster;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod export;
pub mod metrics;
pub mod notification;
pub mod resource;
pub mod source;
pub mod value;
