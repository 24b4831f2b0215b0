use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Failures of a supervised capture process. All of them are recovered by the
/// control layer: they end up in `lastError` and never take the server down.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    SpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed: {message}")]
    RuntimeFailure { program: String, message: String },

    #[error("{program} exited unexpectedly ({status})")]
    UnexpectedExit { program: String, status: String },
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}
