use indexmap::IndexMap;

pub const CHAT_CAPABILITY: &str = "chat";
pub const IMAGE_CAPABILITY: &str = "image";

/// Model used by the primary image backend.
pub const PRIMARY_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub display_name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    /// Free-tier allowance as shown to the user.
    pub quota: Option<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        self.get(name)
            .filter(|model| model.supports(capability))
            .cloned()
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, display_name: &str, capabilities: &[&str], quota: Option<&str>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                display_name: display_name.to_string(),
                provider: "gemini".to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                quota: quota.map(str::to_string),
            },
        );
    };

    insert(
        "gemini-3-flash-preview",
        "Gemini 3 Flash",
        &[CHAT_CAPABILITY],
        Some("Generous"),
    );
    insert(
        "gemini-3-pro-preview",
        "Gemini 3 Pro",
        &[CHAT_CAPABILITY],
        Some("Strict"),
    );
    insert(
        "gemini-flash-latest",
        "Gemini Flash 1.5",
        &[CHAT_CAPABILITY],
        Some("Generous"),
    );
    insert(
        "gemini-flash-lite-latest",
        "Gemini Flash Lite",
        &[CHAT_CAPABILITY],
        Some("Best (Lite)"),
    );
    insert(
        "gemini-2.5-flash",
        "Gemini 2.5 Flash",
        &[CHAT_CAPABILITY],
        Some("Generous"),
    );
    insert(
        PRIMARY_IMAGE_MODEL,
        "Gemini 2.5 Flash Image",
        &[IMAGE_CAPABILITY],
        None,
    );

    map
}
