use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeskPilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model provider error: {0}")]
    Provider(String),

    #[error("Skills error: {0}")]
    Skills(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl serde::Serialize for DeskPilotError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type DeskPilotResult<T> = Result<T, DeskPilotError>;
