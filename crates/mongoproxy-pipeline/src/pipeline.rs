use std::sync::Arc;

use mongoproxy_wire::{Request, Response};
use tracing::debug;

use crate::config::{ProxyConfig, StageConfig};
use crate::error::{PipelineError, Result};
use crate::registry::StageRegistry;
use crate::stage::{Next, Stage};

/// An ordered, immutable chain of configured stages.
///
/// Cloning is cheap; every connection worker holds its own clone.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Box<dyn Stage>]>,
}

impl Pipeline {
    /// Run `request` through every stage, first to last.
    pub fn handle(&self, request: &Request, response: &mut Response) {
        Next::new(&self.stages).run(request, response);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Assembles a [`Pipeline`] from registered stages.
///
/// Any configuration error aborts the build.
pub struct PipelineBuilder<'r> {
    registry: &'r StageRegistry,
    stages: Vec<Box<dyn Stage>>,
}

impl<'r> PipelineBuilder<'r> {
    pub fn new(registry: &'r StageRegistry) -> Self {
        Self {
            registry,
            stages: Vec::new(),
        }
    }

    /// Instantiate `name` from the registry, configure it and append it.
    pub fn stage(mut self, name: &str, config: &StageConfig) -> Result<Self> {
        let mut stage = self.registry.create(name)?;
        stage
            .configure(config)
            .map_err(|source| PipelineError::Configure {
                stage: name.to_string(),
                source,
            })?;
        debug!(stage = name, position = self.stages.len(), "stage configured");
        self.stages.push(stage);
        Ok(self)
    }

    /// Append an already configured stage instance.
    pub fn push(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Add every stage listed in `config`, in order, with shared keys merged in.
    pub fn stages_from(self, config: &ProxyConfig) -> Result<Self> {
        config
            .resolved_stages()
            .iter()
            .try_fold(self, |builder, spec| builder.stage(&spec.name, &spec.config))
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        Ok(Pipeline {
            stages: self.stages.into(),
        })
    }
}
