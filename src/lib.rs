//! nats-operator - drive NATS server clusters toward a declarative spec
//!
//! Each `NatsCluster` gets a controller that creates one worker per server,
//! publishes a shared configuration listing every peer route, and keeps both
//! in line with its `spec` block on a fixed interval.

pub mod cli;
pub mod controller;
pub mod logging;
pub mod naming;
pub mod operator;
pub mod orchestration;
pub mod resources;
pub mod server;
pub mod spec;
pub mod topology;
