mod registry;
mod selectors;

pub use registry::{
    ModelRegistry, ModelSpec, CHAT_CAPABILITY, IMAGE_CAPABILITY, PRIMARY_IMAGE_MODEL,
};
pub use selectors::{ModelSelection, ModelSelector};
