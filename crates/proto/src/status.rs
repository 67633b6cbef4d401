use serde::{Deserialize, Serialize};

/// Outcome category carried in replies and returned by hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    BadRequest,
    InvalidParameter,
    Unauthorized,
    NotFound,
    Timeout,
    BadGateway,
    Internal,
    Closed,
}

impl StatusCode {
    /// HTTP status used when the code is surfaced through the HTTP transport.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest | Self::InvalidParameter => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::BadGateway => 502,
            Self::Timeout => 504,
            Self::Internal | Self::Closed => 500,
        }
    }
}

/// Status of a call, push, or hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Optional machine-readable detail (e.g. a JSON object).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl Status {
    /// Creates a status with code and message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// The OK status.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// Attaches a cause string.
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.code)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping_covers_client_and_server_errors() {
        assert_eq!(StatusCode::Ok.http_status(), 200);
        assert_eq!(StatusCode::InvalidParameter.http_status(), 400);
        assert_eq!(StatusCode::Unauthorized.http_status(), 401);
        assert_eq!(StatusCode::NotFound.http_status(), 404);
        assert_eq!(StatusCode::BadGateway.http_status(), 502);
        assert_eq!(StatusCode::Timeout.http_status(), 504);
    }

    #[test]
    fn display_includes_message_and_cause() {
        let status = Status::bad_request("bad body").with_cause("{\"param\":\"id\"}");
        let text = status.to_string();
        assert!(text.starts_with("BadRequest: bad body"));
        assert!(text.contains("param"));
        assert!(Status::ok().is_ok());
    }

    #[test]
    fn serializes_code_as_snake_case() {
        let json = serde_json::to_string(&Status::new(StatusCode::BadGateway, "down"))
            .expect("serialize");
        assert!(json.contains("\"code\":\"bad_gateway\""));
        assert!(!json.contains("cause"));
    }
}
