use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::PipelineFactory;

/// Registry of named pipeline factories.
///
/// Factories are shared (`Arc`) because every session builds its own pipeline
/// from the same factory.
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn PipelineFactory>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the built-in `stub` backend as default.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(super::backends::StubFactory);
        registry
    }

    /// Register a factory. The first registered factory becomes the default.
    pub fn register<F: PipelineFactory + 'static>(&mut self, factory: F) {
        let name = factory.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.factories.insert(name, Arc::new(factory));
    }

    /// Set default factory by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PipelineFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn default_factory(&self) -> Option<Arc<dyn PipelineFactory>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Look up `name`, or the default when `None`.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn PipelineFactory>> {
        match name {
            Some(name) => self
                .get(name)
                .ok_or_else(|| anyhow!("backend '{}' not registered", name)),
            None => self
                .default_factory()
                .ok_or_else(|| anyhow!("no backends registered")),
        }
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ScriptedFactory;

    #[test]
    fn first_registered_is_default() {
        let mut registry = BackendRegistry::with_builtin();
        registry.register(ScriptedFactory::new());
        assert_eq!(registry.list(), vec!["scripted", "stub"]);
        assert_eq!(registry.resolve(None).unwrap().name(), "stub");
        assert_eq!(registry.resolve(Some("scripted")).unwrap().name(), "scripted");
        assert!(registry.resolve(Some("onnx")).is_err());
    }

    #[test]
    fn set_default_requires_known_name() {
        let mut registry = BackendRegistry::with_builtin();
        registry.register(ScriptedFactory::new());
        assert!(registry.set_default("missing").is_err());
        registry.set_default("scripted").unwrap();
        assert_eq!(registry.default_factory().unwrap().name(), "scripted");
        assert!(BackendRegistry::new().resolve(None).is_err());
    }
}
