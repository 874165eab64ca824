use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;

use crate::expression::{CompileError, EvalError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not use {component} expression: {source}")]
    ExpressionCompile {
        component: &'static str,
        #[source]
        source: CompileError,
    },

    #[error("cannot evaluate {component} expression: {source}")]
    ExpressionEval {
        component: &'static str,
        #[source]
        source: EvalError,
    },

    #[error("can't read body: {0}")]
    BodyRead(String),

    #[error("connection cannot be taken over by this transport")]
    HijackUnsupported,

    #[error("in-flight requests did not finish within {}", humantime::format_duration(*.0))]
    ShutdownTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BodyRead(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Error::HijackUnsupported => tracing::error!(error = %self, "request needed a connection takeover"),
            Error::BodyRead(_) => tracing::debug!(error = %self, "rejecting unreadable body"),
            _ => tracing::warn!(error = %self, "request failed"),
        }

        (status, format!("{}\n", self)).into_response()
    }
}
