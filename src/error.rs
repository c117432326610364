use thiserror::Error;
use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::segment::SegmentConfigError;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("segment configuration error: {0}")]
    SegmentConfig(#[from] SegmentConfigError),

    #[error("gateway transient error: {0}")]
    GatewayTransient(String),

    #[error("gateway permanent error: {0}")]
    GatewayPermanent(String),

    #[error("device token rejected by gateway")]
    InvalidToken,

    #[error("subscription already exists")]
    DuplicateSubscription,

    #[error("campaign {0} already claimed by another worker")]
    ConcurrencyLostRace(Uuid),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<GatewayError> for DispatchError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidToken => DispatchError::InvalidToken,
            GatewayError::Transient(msg) => DispatchError::GatewayTransient(msg),
            GatewayError::Permanent(msg) => DispatchError::GatewayPermanent(msg),
        }
    }
}
