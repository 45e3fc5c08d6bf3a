// Frame sampling and asynchronous detection pipeline

pub mod batch;
pub mod config;
pub mod detection;
pub mod finalize;
pub mod orchestrator;
pub mod remote;
pub mod sampler;
pub mod types;
