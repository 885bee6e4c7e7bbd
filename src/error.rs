use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum HeatTransferError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Config entry not found: {0}")]
    EntryNotFound(String),

    #[error("Unknown sensor type: {0}")]
    UnknownSensorType(String),

    #[error("MQTT client error: {0}")]
    Mqtt(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl From<rumqttc::ClientError> for HeatTransferError {
    fn from(e: rumqttc::ClientError) -> Self {
        HeatTransferError::Mqtt(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HeatTransferError>;
