use mongoproxy_wire::{Request, Response};

use crate::config::StageConfig;
use crate::error::ConfigError;

/// One unit of the processing pipeline.
///
/// `process` either hands control to the rest of the chain by calling
/// [`Next::run`] exactly once, or stops the chain by not calling it (usually
/// after writing a terminal error). A stage may also run the rest of the
/// chain first and react to the outcome afterwards; observers are written
/// that way.
///
/// Stage instances are shared by every connection worker, so any state they
/// hold (a backend handle, counters) must be internally synchronized.
pub trait Stage: Send + Sync {
    /// Name under which the stage is registered.
    fn name(&self) -> &str;

    /// Apply configuration. Called once, before the pipeline is built.
    fn configure(&mut self, config: &StageConfig) -> Result<(), ConfigError>;

    fn process(&self, request: &Request, response: &mut Response, next: Next<'_>);
}

/// Continuation handed to a stage: the remainder of the chain.
///
/// Consumed by [`Next::run`], so it can be invoked at most once.
pub struct Next<'a> {
    rest: &'a [Box<dyn Stage>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(rest: &'a [Box<dyn Stage>]) -> Self {
        Self { rest }
    }

    /// A continuation with nothing after it.
    pub fn end() -> Next<'static> {
        Next { rest: &[] }
    }

    /// Run the remaining stages. At the end of the chain this does nothing.
    pub fn run(self, request: &Request, response: &mut Response) {
        if let Some((stage, rest)) = self.rest.split_first() {
            stage.process(request, response, Next::new(rest));
        }
    }

    /// Number of stages still to run.
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub fn is_end(&self) -> bool {
        self.rest.is_empty()
    }
}
