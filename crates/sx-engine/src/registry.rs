//! Model callbacks registered by name.
//!
//! Samples name their model rather than carrying a closure, so that every
//! rank of a distributed run resolves the same callable from its own registry.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use sx_types::{ConfigError, SxResult};

use crate::context::SampleContext;

/// A model callback: reads parameters, writes results, may suspend.
pub type ModelFn = Arc<dyn Fn(&mut SampleContext<'_>) -> SxResult<()> + Send + Sync>;

#[derive(Default)]
pub struct ModelRegistry {
    models: DashMap<String, ModelFn>,
}

impl ModelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or replace) a model under `name`.
    pub fn register<F>(&self, name: impl Into<String>, model: F)
    where
        F: Fn(&mut SampleContext<'_>) -> SxResult<()> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(model = %name, "registering model");
        self.models.insert(name, Arc::new(model));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> SxResult<ModelFn> {
        self.models
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ConfigError::UnknownModel {
                    component: "Engine".to_string(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sx_types::SxError;

    #[test]
    fn resolves_registered_models() {
        let registry = ModelRegistry::new();
        registry.register("sphere", |ctx| {
            let x = ctx.parameters();
            ctx.set_f64("objective", -x.iter().map(|v| v * v).sum::<f64>())
        });

        assert!(registry.contains("sphere"));
        assert!(registry.resolve("sphere").is_ok());
        assert_eq!(registry.names(), vec!["sphere".to_string()]);
    }

    #[test]
    fn unknown_model_is_configuration_error() {
        let registry = ModelRegistry::new();
        match registry.resolve("missing") {
            Err(SxError::Config(ConfigError::UnknownModel { name, .. })) => {
                assert_eq!(name, "missing")
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("resolved a model that was never registered"),
        }
    }
}
