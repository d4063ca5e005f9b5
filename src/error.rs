use rocket::http::{Header, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use thiserror::Error;

/// The relay's single error type. Every variant names a distinct wire error
/// kind (§7) and carries enough detail for the caller to act on it;
/// `Responder` turns it into `{error, message}` from one place instead of
/// one per handler.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("missing signature")]
    MissingSignature,
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("algorithm not allowed")]
    AlgorithmNotAllowed,
    #[error("missing required signed header: {0}")]
    MissingRequiredSignedHeader(String),
    #[error("stale date")]
    StaleDate,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("api key required")]
    ApiKeyRequired,
    #[error("api key invalid")]
    ApiKeyInvalid,

    #[error("subject mismatch")]
    SubjectMismatchForbidden,
    #[error("agent not approved")]
    AgentNotApproved,
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("gone")]
    Gone,

    #[error("inbox full")]
    InboxFull,
    #[error("too many requests, retry after {retry_after_secs}s")]
    TooManyRequests { retry_after_secs: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> Status {
        match self {
            AppError::Validation(_) => Status::BadRequest,
            AppError::PayloadTooLarge => Status::PayloadTooLarge,
            AppError::PolicyViolation(_) => Status::BadRequest,

            AppError::MissingSignature
            | AppError::MalformedSignature(_)
            | AppError::AlgorithmNotAllowed
            | AppError::MissingRequiredSignedHeader(_)
            | AppError::StaleDate
            | AppError::SignatureInvalid
            | AppError::ApiKeyRequired
            | AppError::ApiKeyInvalid => Status::Unauthorized,

            AppError::SubjectMismatchForbidden
            | AppError::AgentNotApproved
            | AppError::Forbidden(_) => Status::Forbidden,

            AppError::Conflict(_) => Status::Conflict,
            AppError::NotFound(_) => Status::NotFound,
            AppError::Gone => Status::Gone,

            AppError::InboxFull => Status::InsufficientStorage,
            AppError::TooManyRequests { .. } => Status::TooManyRequests,

            AppError::Internal(_) => Status::InternalServerError,
        }
    }

    /// Stable machine-readable error code, matching spec.md §4.3/§7 naming.
    fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::PayloadTooLarge => "payload_too_large",
            AppError::PolicyViolation(_) => "policy_violation",
            AppError::MissingSignature => "missing_signature",
            AppError::MalformedSignature(_) => "malformed_signature",
            AppError::AlgorithmNotAllowed => "algorithm_not_allowed",
            AppError::MissingRequiredSignedHeader(_) => "missing_required_signed_header",
            AppError::StaleDate => "stale_date",
            AppError::SignatureInvalid => "signature_invalid",
            AppError::ApiKeyRequired => "api_key_required",
            AppError::ApiKeyInvalid => "api_key_invalid",
            AppError::SubjectMismatchForbidden => "subject_mismatch_forbidden",
            AppError::AgentNotApproved => "agent_not_approved",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(_) => "not_found",
            AppError::Gone => "gone",
            AppError::InboxFull => "inbox_full",
            AppError::TooManyRequests { .. } => "too_many_requests",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl<'r> Responder<'r, 'static> for AppError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        if self.status() == Status::InternalServerError {
            tracing::error!(error = %self, "internal error");
        } else {
            tracing::debug!(error = %self, code = self.code(), "request rejected");
        }

        let retry_after = match &self {
            AppError::TooManyRequests { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));

        let mut response = Response::build_from(body.respond_to(req)?)
            .status(self.status())
            .finalize();
        if let Some(secs) = retry_after {
            response.set_header(Header::new("Retry-After", secs.to_string()));
        }
        Ok(response)
    }
}

pub type AppResult<T> = Result<T, AppError>;
