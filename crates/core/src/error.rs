use thiserror::Error;

#[derive(Error, Debug)]
pub enum VistaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Parameter error: {0}")]
    Parameter(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for VistaError {
    fn from(e: serde_json::Error) -> Self {
        VistaError::Serialize(e.to_string())
    }
}
