//! Deployment configuration and the pipeline that applies it.

mod account;
pub mod catalog;
pub mod config;
mod features;
pub mod pipeline;
pub mod runtimes;
pub mod source;
pub mod ssl;

pub use catalog::VersionCatalog;
pub use config::DeploymentConfig;
pub use pipeline::{Deployer, PipelineTiming};
