use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::connection;
use crate::error::{Error, Result};
use crate::expression::{ContextSource, EvalContext, EvalError, Expression, Value};
use crate::response::status_text;

const COMPONENT: &str = "error";

/// What the error expression decided for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `false`: hand the request to the next layer.
    Pass,
    /// A number: respond with that status code.
    Status(StatusCode),
    /// `true`: respond with a generic server error.
    ServerError,
    /// `"CLOSE"`: drop the connection without a response.
    Close,
}

impl Fault {
    /// Maps an evaluation result onto a fault. Anything not listed on
    /// [`Fault`] is rejected rather than passed through.
    pub fn from_value(value: Value) -> std::result::Result<Self, EvalError> {
        match value {
            Value::Bool(false) => Ok(Fault::Pass),
            Value::Bool(true) => Ok(Fault::ServerError),
            Value::Number(code) => status_from_number(code).map(Fault::Status),
            Value::Str(s) if s == "CLOSE" => Ok(Fault::Close),
            Value::Str(s) => Err(EvalError::UnexpectedResult(format!(
                "expression returned a string, '{}', but it was not recognized",
                s
            ))),
        }
    }
}

fn status_from_number(code: f64) -> std::result::Result<StatusCode, EvalError> {
    let invalid = || EvalError::UnexpectedResult(format!("expression returned {}, which is not an HTTP status code", code));
    if code.fract() != 0.0 || !(100.0..=999.0).contains(&code) {
        return Err(invalid());
    }
    StatusCode::from_u16(code as u16).map_err(|_| invalid())
}

/// Decides per request whether to fail it, based on an expression.
#[derive(Debug)]
pub struct ErrorInjector {
    expression: Option<Expression>,
    context: ContextSource,
}

impl ErrorInjector {
    pub fn new(expression: Option<&str>, started: Instant) -> Result<Self> {
        let expression = expression
            .map(Expression::compile)
            .transpose()
            .map_err(|source| Error::ExpressionCompile {
                component: COMPONENT,
                source,
            })?;

        Ok(Self {
            expression,
            context: ContextSource::new(started),
        })
    }

    /// An injector that never fails a request.
    pub fn disabled(started: Instant) -> Self {
        Self {
            expression: None,
            context: ContextSource::new(started),
        }
    }

    pub fn expression(&self) -> Option<&Expression> {
        self.expression.as_ref()
    }

    pub fn decide(&self, context: &EvalContext) -> Result<Fault> {
        let Some(expression) = &self.expression else {
            return Ok(Fault::Pass);
        };

        expression
            .evaluate(context)
            .and_then(Fault::from_value)
            .map_err(|source| Error::ExpressionEval {
                component: COMPONENT,
                source,
            })
    }
}

/// Error injection middleware.
pub async fn inject(State(injector): State<Arc<ErrorInjector>>, request: Request, next: Next) -> Response {
    let (_active, context) = injector.context.enter();

    match injector.decide(&context) {
        Ok(Fault::Pass) => next.run(request).await,
        Ok(Fault::Status(status)) => {
            debug!(status = %status, "injecting status");
            status_text(status)
        }
        Ok(Fault::ServerError) => {
            debug!("injecting server error");
            status_text(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Ok(Fault::Close) => {
            debug!("injecting connection close");
            match connection::drop_connection(request.extensions()).await {
                Ok(never) => match never {},
                Err(err) => err.into_response(),
            }
        }
        Err(err) => err.into_response(),
    }
}
