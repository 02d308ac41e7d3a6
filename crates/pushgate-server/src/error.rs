use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("duplicate service registration: {0}")]
    DuplicateService(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("message conversion failed: {0}")]
    Conversion(String),

    #[error("queue error: {0}")]
    Queue(#[from] pushgate_queue::QueueError),

    #[error("adapter client initialization failed: {0}")]
    ClientInit(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
