use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No valid data for stage '{stage}'")]
    NoValidData { stage: String },

    #[error("Source '{slug}' failed: {message}")]
    Source { slug: String, message: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Command '{program}' failed: {message}")]
    Command { program: String, message: String },

    #[error("Interrupted")]
    Interrupted,
}

impl AggregatorError {
    pub fn no_valid_data(stage: impl Into<String>) -> Self {
        AggregatorError::NoValidData { stage: stage.into() }
    }

    pub fn source(slug: impl Into<String>, message: impl Into<String>) -> Self {
        AggregatorError::Source {
            slug: slug.into(),
            message: message.into(),
        }
    }

    /// Short variant name, recorded as the error type in incident logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AggregatorError::Io(_) => "Io",
            AggregatorError::Csv(_) => "Csv",
            AggregatorError::Parquet(_) => "Parquet",
            AggregatorError::Json(_) => "Json",
            AggregatorError::Toml(_) => "Toml",
            AggregatorError::Http(_) => "Http",
            AggregatorError::Zip(_) => "Zip",
            AggregatorError::Config(_) => "Config",
            AggregatorError::NoValidData { .. } => "NoValidData",
            AggregatorError::Source { .. } => "Source",
            AggregatorError::Archive(_) => "Archive",
            AggregatorError::Command { .. } => "Command",
            AggregatorError::Interrupted => "Interrupted",
        }
    }
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
