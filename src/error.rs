use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Origin unavailable: {0}")]
    OriginUnavailable(String),

    /// A non-200 origin status mirrored back to the client, with the
    /// origin's own status line and any `Location` it supplied.
    #[error("Origin answered {status_line}")]
    OriginStatus {
        status: u16,
        status_line: String,
        location: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl OffloadError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OffloadError::BadRequest(_) => StatusCode::BAD_REQUEST,
            OffloadError::Forbidden(_) => StatusCode::FORBIDDEN,
            OffloadError::OriginUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OffloadError::OriginStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            OffloadError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OffloadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The plain-text body for the error response. Mirrored origin
    /// statuses echo the origin's status line.
    pub fn message(&self) -> String {
        match self {
            OffloadError::BadRequest(msg)
            | OffloadError::Forbidden(msg)
            | OffloadError::OriginUnavailable(msg)
            | OffloadError::Config(msg)
            | OffloadError::Internal(msg) => msg.clone(),
            OffloadError::OriginStatus { status_line, .. } => status_line.clone(),
        }
    }

    /// Status text for the status line and the mirrored `Status` header,
    /// e.g. `403 Forbidden`. Mirrored origin statuses keep the origin's
    /// reason phrase, with any leading `HTTP/x.y ` stripped.
    pub fn status_text(&self) -> String {
        if let OffloadError::OriginStatus { status_line, .. } = self {
            let http_prefixed = status_line
                .get(..4)
                .is_some_and(|p| p.eq_ignore_ascii_case("HTTP"));
            let stripped = if http_prefixed {
                status_line
                    .split_once(' ')
                    .map(|(_, rest)| rest)
                    .unwrap_or(status_line)
            } else {
                status_line
            };
            return stripped.to_string();
        }

        let status = self.status_code();
        format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            OffloadError::OriginStatus { location, .. } => location.as_deref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for OffloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            OffloadError::OriginUnavailable("Couldn't connect to offload base server.".to_string())
        } else if err.is_timeout() {
            OffloadError::OriginUnavailable(
                "Timeout while talking to offload base server.".to_string(),
            )
        } else {
            OffloadError::OriginUnavailable(format!("Error talking to offload base server: {err}"))
        }
    }
}

impl From<std::io::Error> for OffloadError {
    fn from(err: std::io::Error) -> Self {
        OffloadError::Internal(format!("I/O error: {err}"))
    }
}

pub type OffloadResult<T> = Result<T, OffloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            OffloadError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OffloadError::OriginUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_mirrored_status_text() {
        let err = OffloadError::OriginStatus {
            status: 302,
            status_line: "HTTP/1.1 302 Found".to_string(),
            location: Some("https://elsewhere/".to_string()),
        };
        assert_eq!(err.status_text(), "302 Found");
        assert_eq!(err.message(), "HTTP/1.1 302 Found");
        assert_eq!(err.status_code(), StatusCode::FOUND);
        assert_eq!(err.location(), Some("https://elsewhere/"));
    }

    #[test]
    fn test_plain_status_text() {
        let err = OffloadError::Forbidden("nope".into());
        assert_eq!(err.status_text(), "403 Forbidden");
    }
}
