//! Document-database wire-protocol proxy.
//!
//! mongoproxy sits between clients and a document-database server, decodes
//! every request frame, runs it through an ordered pipeline of stages and
//! writes the reply back in the client's own framing.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP and Unix-socket listeners and streams
//! - [`wire`]: Frame codec, request model and response carrier
//! - [`pipeline`]: Stage contract, configuration and the connection loop
//! - [`backend`]: The `mongod` execution stage and its `mongodb` driver backend

/// Re-export transport types.
pub mod transport {
    pub use mongoproxy_transport::*;
}

/// Re-export wire types.
pub mod wire {
    pub use mongoproxy_wire::*;
}

/// Re-export pipeline types.
pub mod pipeline {
    pub use mongoproxy_pipeline::*;
}

/// Re-export backend types.
pub mod backend {
    pub use mongoproxy_backend::*;
}

/// A registry holding every stage this distribution ships: `trace` and `mongod`.
pub fn default_registry() -> mongoproxy_pipeline::Result<mongoproxy_pipeline::StageRegistry> {
    let mut registry = mongoproxy_pipeline::StageRegistry::with_builtins();
    mongoproxy_backend::register(&mut registry)?;
    Ok(registry)
}
