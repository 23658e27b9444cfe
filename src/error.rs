use axum::http::{StatusCode, header};
use axum::response::Response;
use serde::Serialize;

/// Typed service error. Each variant maps to exactly one HTTP status; only
/// the router/handler layer performs that translation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("authentication required")]
    Unauthenticated { message: String },

    #[error("forbidden: {message}")]
    Forbidden { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("method not allowed")]
    MethodNotAllowed { allowed: Vec<String> },

    #[error("not acceptable: {message}")]
    NotAcceptable { message: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("precondition failed: {message}")]
    PreconditionFailed { message: String },

    #[error("batch too large: {message}")]
    PayloadTooLarge { message: String },

    #[error("unsupported media type: {message}")]
    UnsupportedMediaType { message: String },

    #[error("{message}")]
    Validation {
        message: String,
        target: Option<String>,
    },

    #[error("not implemented: {message}")]
    NotImplemented { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    /// Raised by a lifecycle hook; the status is honored verbatim.
    #[error("{message}")]
    Hook {
        status: u16,
        code: String,
        message: String,
    },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            target: None,
        }
    }

    pub fn validation_at(message: impl Into<String>, target: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            target: Some(target.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Error::NotImplemented {
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Error::NotAcceptable { .. } => StatusCode::NOT_ACCEPTABLE,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::PreconditionFailed { .. } => StatusCode::PRECONDITION_FAILED,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Hook { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// The `code` field of the OData error body.
    pub fn code(&self) -> &str {
        match self {
            Error::Unauthenticated { .. } => "Unauthenticated",
            Error::Forbidden { .. } => "Forbidden",
            Error::NotFound { .. } => "NotFound",
            Error::MethodNotAllowed { .. } => "MethodNotAllowed",
            Error::NotAcceptable { .. } => "NotAcceptable",
            Error::Conflict { .. } => "Conflict",
            Error::PreconditionFailed { .. } => "PreconditionFailed",
            Error::PayloadTooLarge { .. } => "PayloadTooLarge",
            Error::UnsupportedMediaType { .. } => "UnsupportedMediaType",
            Error::Validation { .. } => "Validation",
            Error::NotImplemented { .. } => "NotImplemented",
            Error::Internal { .. } => "Internal",
            Error::Hook { code, .. } => code,
        }
    }

    fn message(&self) -> String {
        match self {
            Error::Unauthenticated { message }
            | Error::Forbidden { message }
            | Error::NotFound { message }
            | Error::NotAcceptable { message }
            | Error::Conflict { message }
            | Error::PreconditionFailed { message }
            | Error::PayloadTooLarge { message }
            | Error::UnsupportedMediaType { message }
            | Error::NotImplemented { message }
            | Error::Internal { message }
            | Error::Hook { message, .. } => message.clone(),
            Error::Validation { message, .. } => message.clone(),
            Error::MethodNotAllowed { .. } => "the method is not allowed on this resource".into(),
        }
    }

    /// Render the `{"error":{...}}` body and status. Internal errors are
    /// logged here so no caller can forget.
    pub fn into_response(self, odata_version: &str) -> Response {
        if matches!(self, Error::Internal { .. }) {
            tracing::error!("internal error: {}", self.message());
        }
        let target = match &self {
            Error::Validation { target, .. } => target.clone(),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.message(),
                target,
                details: None,
            },
        };
        let mut builder = Response::builder()
            .status(self.status())
            .header(header::CONTENT_TYPE, "application/json")
            .header("OData-Version", odata_version);
        if let Error::Unauthenticated { .. } = self {
            builder = builder.header(header::WWW_AUTHENTICATE, "Bearer");
        }
        if let Error::MethodNotAllowed { allowed } = &self {
            builder = builder.header(header::ALLOW, allowed.join(", "));
        }
        builder
            .body(axum::body::Body::from(
                serde_json::to_vec(&body).unwrap_or_default(),
            ))
            .unwrap_or_else(|_| Response::new(axum::body::Body::empty()))
    }
}

/// Wire shape of an OData error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<ErrorDetailItem>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetailItem {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;
