use thiserror::Error;

#[derive(Error, Debug)]
pub enum RnnError {
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Deserialization error: {message}")]
    Deserialization { message: String },

    #[error("Unknown serializer type: {kind}")]
    UnknownType { kind: String },

    #[error("Expected {expected} encoded components, got {got}")]
    ComponentCount { expected: usize, got: usize },

    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("{component} does not support {capability}")]
    Unsupported {
        component: String,
        capability: &'static str,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error(
        "Back-propagation window of {requested} timesteps reaches past the {retained} retained records"
    )]
    HistoryDiscarded { requested: usize, retained: usize },

    #[error("Checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("Model version {version} is newer than supported version {supported}")]
    UnsupportedVersion { version: u32, supported: u32 },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl RnnError {
    pub(crate) fn unsupported(component: &str, capability: &'static str) -> Self {
        RnnError::Unsupported {
            component: component.to_string(),
            capability,
        }
    }

    pub(crate) fn serialization<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RnnError::Serialization {
            source: Box::new(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, RnnError>;
