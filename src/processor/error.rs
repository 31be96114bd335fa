use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error (status {status_code}): {message}")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl ProcessorError {
    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        matches!(self, ProcessorError::ApiError { status_code, .. } if (400..500).contains(status_code))
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        matches!(self, ProcessorError::ApiError { status_code, .. } if (500..600).contains(status_code))
    }

    /// Whether a read-only call failing this way may be retried with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessorError::HttpError(_) | ProcessorError::Timeout(_))
            || self.is_server_error()
            || matches!(self, ProcessorError::ApiError { status_code: 429, .. })
    }
}

impl From<reqwest::Error> for ProcessorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProcessorError::Timeout(e.to_string())
        } else if e.is_decode() {
            ProcessorError::ParseError(e.to_string())
        } else {
            ProcessorError::HttpError(e.to_string())
        }
    }
}
