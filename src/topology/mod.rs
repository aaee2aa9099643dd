//! Cluster topology: worker descriptors, the shared configuration and the
//! materializer that submits both to the orchestration API.

pub mod config;
pub mod materializer;
pub mod worker;

pub use config::{config_digest, parse_routes, render_shared_config, SharedConfig};
pub use materializer::{
    ConfigFailurePolicy, CreateReport, DeleteReport, MaterializeError, Materializer,
};
pub use worker::{
    build_worker, default_nats_container, ConfigVolume, Container, ContainerPort, RestartPolicy,
    VolumeMount, Worker, WorkerPhase,
};
