use actix_web::{http::StatusCode, HttpResponse};
use serde::Serialize;
use thiserror::Error;

/// Every way a `generate-invite` request can end without an invite.
#[derive(Error, Debug)]
pub enum InviteError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Missing userId or channelId")]
    MissingFields,

    #[error("Invalid channel")]
    InvalidChannel,

    #[error("Need {0} more minutes")]
    NotEligible(f64),

    #[error("Already a member!")]
    AlreadyMember,

    #[error("Failed to create invite")]
    InviteCreationFailed,

    #[error("Server error")]
    Server(#[from] anyhow::Error),
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl InviteError {
    /// Stable identifier returned in the `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            InviteError::InvalidJson => "InvalidJson",
            InviteError::MissingFields => "MissingFields",
            InviteError::InvalidChannel => "InvalidChannel",
            InviteError::NotEligible(_) => "NotEligible",
            InviteError::AlreadyMember => "AlreadyMember",
            InviteError::InviteCreationFailed => "InviteCreationFailed",
            InviteError::Server(_) => "ServerError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            InviteError::InvalidJson
            | InviteError::MissingFields
            | InviteError::InvalidChannel => StatusCode::BAD_REQUEST,
            InviteError::NotEligible(_) | InviteError::AlreadyMember => StatusCode::FORBIDDEN,
            InviteError::InviteCreationFailed | InviteError::Server(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Renders the error as a JSON response. The cause behind a `Server`
    /// error stays in the logs; callers only ever see the generic message.
    pub fn to_response(&self) -> HttpResponse {
        HttpResponse::build(self.status()).json(ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        })
    }
}
