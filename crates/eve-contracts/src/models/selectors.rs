use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    /// Resolves `requested` against the catalog, falling back to the first
    /// model with `capability`. Blank requests count as none.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        if let Some(model) = requested
            .as_deref()
            .and_then(|name| self.registry.ensure(name, capability))
        {
            return Ok(ModelSelection {
                model,
                requested,
                fallback_reason: None,
            });
        }

        let fallback_reason = match requested.as_deref() {
            Some(name) => format!("Requested model '{name}' unavailable for {capability}; using default."),
            None => "No model specified; using default.".to_string(),
        };
        let model = self
            .registry
            .by_capability(capability)
            .into_iter()
            .next()
            .ok_or_else(|| format!("No models available for capability '{capability}'."))?;
        Ok(ModelSelection {
            model,
            requested,
            fallback_reason: Some(fallback_reason),
        })
    }

    /// First catalog model for `capability` other than `failed`.
    pub fn alternative_to(&self, failed: &str, capability: &str) -> Option<ModelSpec> {
        self.registry
            .by_capability(capability)
            .into_iter()
            .find(|model| model.name != failed)
    }
}
