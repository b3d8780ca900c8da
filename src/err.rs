#![allow(non_snake_case)]

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;

use serde::Serialize;

pub async fn handler404(path: Uri) -> (StatusCode, Json<Error>) {
    (
        StatusCode::NOT_FOUND,
        Json(Error::NotFound {
            message: format!("Invalid path: {}", path),
        }),
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Error),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(err)
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(err) => err.into_response(),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    Validation { message: String },
    Conflict { message: String },
    Unauthenticated { message: String },
    InvalidCredentials { message: String },
    Forbidden { message: String },
    NotFound { message: String },
    InvalidState { message: String },
    Upstream { kind: &'static str, message: String },
    Internal { kind: &'static str, message: String },
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation { .. } | Error::InvalidState { .. } => StatusCode::BAD_REQUEST,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Unauthenticated { .. } | Error::InvalidCredentials { .. } => {
                StatusCode::UNAUTHORIZED
            }
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Upstream { .. } | Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn validation<S: Into<String>>(msg: S) -> Error {
        Error::Validation {
            message: msg.into(),
        }
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Error {
        Error::Conflict {
            message: msg.into(),
        }
    }

    pub fn unauthenticated<S: Into<String>>(msg: S) -> Error {
        Error::Unauthenticated {
            message: msg.into(),
        }
    }

    pub fn invalid_credentials<S: Into<String>>(msg: S) -> Error {
        Error::InvalidCredentials {
            message: msg.into(),
        }
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Error {
        Error::Forbidden {
            message: msg.into(),
        }
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Error {
        Error::NotFound {
            message: msg.into(),
        }
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Error {
        Error::InvalidState {
            message: msg.into(),
        }
    }

    pub fn upstream<S: Into<String>>(kind: &'static str, msg: S) -> Error {
        Error::Upstream {
            kind,
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Validation { message } => write!(f, "Validation: {}", message),
            Error::Conflict { message } => write!(f, "Conflict: {}", message),
            Error::Unauthenticated { message } => write!(f, "Unauthenticated: {}", message),
            Error::InvalidCredentials { message } => write!(f, "InvalidCredentials: {}", message),
            Error::Forbidden { message } => write!(f, "Forbidden: {}", message),
            Error::NotFound { message } => write!(f, "NotFound: {}", message),
            Error::InvalidState { message } => write!(f, "InvalidState: {}", message),
            Error::Upstream { kind, message } => write!(f, "Upstream({}): {}", kind, message),
            Error::Internal { kind, message } => write!(f, "Internal({}): {}", kind, message),
        }
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal {
            kind: "DatabaseError",
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            kind: "SerializationError",
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream {
            kind: "HttpClient",
            message: err.to_string(),
        }
    }
}

impl From<pbkdf2::password_hash::Error> for Error {
    fn from(err: pbkdf2::password_hash::Error) -> Self {
        Self::Internal {
            kind: "PasswordHashError",
            message: err.to_string(),
        }
    }
}
