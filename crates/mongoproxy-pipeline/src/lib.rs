//! Stage pipeline and connection handling for mongoproxy.
//!
//! A [`Pipeline`] is an ordered chain of [`Stage`]s built by the
//! [`PipelineBuilder`] from a [`StageRegistry`] and a [`ProxyConfig`]. The
//! [`ProxyServer`] accepts client connections and drives every decoded
//! request through that chain, writing back whatever the stages produced.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod stage;
pub mod trace;

mod last_write;

pub use config::{ProxyConfig, StageConfig, StageSpec, DEFAULT_PORT, DEFAULT_TIMEOUT_SECS};
pub use error::{ConfigError, PipelineError, Result};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use registry::{StageFactory, StageRegistry};
pub use server::{Connection, ConnectionConfig, ProxyServer, ShutdownHandle};
pub use stage::{Next, Stage};
pub use trace::TraceStage;
