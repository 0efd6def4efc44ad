use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowMetricsError>;

#[derive(Error, Debug)]
pub enum FlowMetricsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid filter rule: {0}")]
    InvalidFilter(String),

    #[error("Unknown enricher: {0}")]
    UnknownEnricher(String),

    #[error("Enricher error: {0}")]
    Enricher(String),

    #[error("Geo database error: {0}")]
    GeoDb(#[from] maxminddb::MaxMindDBError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Network error: {0}")]
    Network(String),
}
