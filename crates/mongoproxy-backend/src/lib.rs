//! Backend execution for mongoproxy.
//!
//! The [`BackendStage`] (registered as `mongod`) runs every request against
//! a document-database server through the [`Connector`]/[`Client`]/
//! [`Session`]/[`Cursor`] seam. The shipped implementation of that seam is
//! the `mongodb` driver's blocking client, in [`driver`].

pub mod client;
pub mod driver;
pub mod error;
pub mod options;
pub mod stage;

pub use client::{Client, Connector, Cursor, CursorBatch, FindOptions, Session};
pub use driver::{MongoClient, MongoConnector};
pub use error::{reply_ok, BackendError, Result};
pub use options::{AuthOptions, ConnectOptions, DEFAULT_MAX_POOL_SIZE};
pub use stage::BackendStage;

use mongoproxy_pipeline::{Stage, StageRegistry};

/// Register the `mongod` stage, backed by the `mongodb` driver.
pub fn register(registry: &mut StageRegistry) -> mongoproxy_pipeline::Result<()> {
    registry.register(BackendStage::NAME, || -> Box<dyn Stage> {
        Box::new(BackendStage::new())
    })
}
