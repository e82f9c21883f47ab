use std::collections::BTreeMap;

use crate::error::{PipelineError, Result};
use crate::stage::Stage;
use crate::trace::TraceStage;

/// Creates a fresh, unconfigured stage instance.
pub type StageFactory = Box<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Name-keyed stage factories.
///
/// The composition root fills a registry and hands it to the
/// [`PipelineBuilder`](crate::PipelineBuilder); nothing registers itself.
#[derive(Default)]
pub struct StageRegistry {
    factories: BTreeMap<String, StageFactory>,
}

impl StageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the stages this crate ships (`trace`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            TraceStage::NAME.to_string(),
            Box::new(|| -> Box<dyn Stage> { Box::new(TraceStage::default()) }),
        );
        registry
    }

    /// Register a factory under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Stage> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(PipelineError::DuplicateStage(name.to_string()));
        }
        self.factories.insert(name.to_string(), Box::new(factory));
        Ok(())
    }

    /// Instantiate the stage registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn Stage>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
