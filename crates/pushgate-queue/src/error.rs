use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue shut down")]
    ShutDown,

    #[error("get cancelled")]
    Cancelled,

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
