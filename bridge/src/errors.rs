use crate::model::{CommandId, CommandStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Missing user identity")]
    Unauthorized,

    #[error("Command {command_id} already {status}")]
    AlreadyTerminal {
        command_id: CommandId,
        status: CommandStatus,
    },

    #[error("Dispatch to device channel failed: {0}")]
    Dispatch(String),

    #[error("Command identifier collision: {0}")]
    DuplicateCommand(CommandId),

    #[error("Channel send error")]
    ChannelSend,
}

pub type Result<T> = std::result::Result<T, Error>;
