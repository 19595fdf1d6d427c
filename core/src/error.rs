use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Concurrency(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
