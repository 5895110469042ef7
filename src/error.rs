use thiserror::Error;

/// Errors raised while reading configuration or task documents.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed task document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task document has no top level 'tasks' array")]
    MissingTasks,

    #[error("could not read value from javascript: {0}")]
    Js(String),
}

impl From<serde_wasm_bindgen::Error> for ConfigError {
    fn from(err: serde_wasm_bindgen::Error) -> Self {
        ConfigError::Js(err.to_string())
    }
}
