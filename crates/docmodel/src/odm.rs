//! Model declaration entry point.
//!
//! An [`Odm`] owns the [`Registry`] while models and relations are declared.
//! [`Odm::connect`] freezes it behind an `Arc` and pairs it with a driver;
//! every session made afterwards shares the same declarations.

use docmodel_core::{ModelOptions, OdmConfig, RecordType, Registry, Result, Schema, StorageDriver};
use docmodel_session::Session;
use std::sync::Arc;

/// Builder for the model registry.
#[derive(Debug)]
pub struct Odm {
    registry: Registry,
}

impl Odm {
    #[must_use]
    pub fn new(config: OdmConfig) -> Self {
        Self {
            registry: Registry::new(config),
        }
    }

    /// Build from a JSON configuration object.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(Self::new(OdmConfig::from_json_str(json)?))
    }

    pub fn config(&self) -> &OdmConfig {
        self.registry.config()
    }

    /// Declare a model.
    pub fn create_model(
        &mut self,
        name: impl Into<String>,
        schema: Schema,
        options: ModelOptions,
    ) -> Result<&mut RecordType> {
        self.registry.create_model(name, schema, options)
    }

    /// Access a declared model to add hooks, listeners or methods.
    pub fn model_mut(&mut self, name: &str) -> Result<&mut RecordType> {
        self.registry.model_mut(name)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Mutable access for relation declarations.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Freeze the declarations and open a session on `driver`.
    pub fn connect<D: StorageDriver>(self, driver: D) -> Session<D> {
        tracing::info!(
            models = self.registry.models().count(),
            relations = self.registry.relations().len(),
            "Registry frozen"
        );
        Session::new(Arc::new(self.registry), driver)
    }

    /// Freeze the declarations without a driver.
    pub fn into_registry(self) -> Arc<Registry> {
        Arc::new(self.registry)
    }
}
