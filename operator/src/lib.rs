pub use common::{Error, Result};

/// Desired state of every managed native resource
pub mod builders;
pub mod committer;
pub mod config;
pub mod converge;
pub mod discovery;
pub mod driver;
pub mod events;
pub mod mapper;
mod runner;

/// One controller per custom resource kind
pub mod authconfig;
pub mod embedding;
pub mod group;
pub mod mcpserver;
pub mod remoteproxy;
pub mod toolconfig;
pub mod virtualserver;

/// State machinery for kube, as exposeable to actix
pub mod manager;
pub use manager::{Context, Manager};

/// Log and trace integrations
pub mod telemetry;

/// Metrics
pub mod metrics;
pub use metrics::Metrics;
