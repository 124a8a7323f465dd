use hyper::{Body, Response, StatusCode, header::RETRY_AFTER};
use tracing::warn;

/// Machine-readable error codes of the HTTP API.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HttpApiErrorCode {
    InternalError,
    NotFound,
    Conflict,
    Invalid,
    Unavailable,
    TooManyRequests,
    MethodNotAllowed,
    RequestTooLarge,
    UnsupportedMediaType,
}

impl HttpApiErrorCode {
    /// Get machine-readable text representation.
    pub fn as_text(&self) -> &'static str {
        match self {
            Self::InternalError => "internal error",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Invalid => "invalid",
            Self::Unavailable => "unavailable",
            Self::TooManyRequests => "too many requests",
            Self::MethodNotAllowed => "method not allowed",
            Self::RequestTooLarge => "request too large",
            Self::UnsupportedMediaType => "unsupported media type",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Invalid => StatusCode::BAD_REQUEST,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        }
    }
}

impl From<StatusCode> for HttpApiErrorCode {
    fn from(s: StatusCode) -> Self {
        match s {
            StatusCode::INTERNAL_SERVER_ERROR => Self::InternalError,
            StatusCode::NOT_FOUND => Self::NotFound,
            StatusCode::CONFLICT => Self::Conflict,
            StatusCode::BAD_REQUEST => Self::Invalid,
            StatusCode::SERVICE_UNAVAILABLE => Self::Unavailable,
            StatusCode::TOO_MANY_REQUESTS => Self::TooManyRequests,
            StatusCode::METHOD_NOT_ALLOWED => Self::MethodNotAllowed,
            StatusCode::PAYLOAD_TOO_LARGE => Self::RequestTooLarge,
            StatusCode::UNSUPPORTED_MEDIA_TYPE => Self::UnsupportedMediaType,
            v => {
                warn!(code=%v, "returning unexpected status code as internal error");
                Self::InternalError
            }
        }
    }
}

/// An error response: `{"code": "...", "message": "..."}`.
#[derive(Debug)]
pub struct HttpApiError {
    code: HttpApiErrorCode,
    msg: String,
    retry_after_secs: Option<u64>,
}

impl HttpApiError {
    pub fn new(code: impl Into<HttpApiErrorCode>, msg: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            msg: msg.into(),
            retry_after_secs: None,
        }
    }

    /// Ask the client to wait `secs` seconds before retrying.
    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn code(&self) -> HttpApiErrorCode {
        self.code
    }

    fn body(&self) -> Body {
        let json = serde_json::json!({
            "code": self.code.as_text(),
            "message": self.msg,
        })
        .to_string();

        Body::from(json)
    }

    pub fn response(&self) -> Response<Body> {
        let mut response = Response::new(self.body());
        *response.status_mut() = self.code.status_code();
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        if let Some(secs) = self.retry_after_secs {
            response.headers_mut().insert(RETRY_AFTER, secs.into());
        }
        response
    }

    /// Whether the failure is on the server side.
    pub fn is_internal(&self) -> bool {
        self.code.status_code().is_server_error()
    }
}

impl std::fmt::Display for HttpApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_text(), self.msg)
    }
}

impl std::error::Error for HttpApiError {}

/// Mixin-trait to simplify creation of [`HttpApiError`].
pub trait HttpApiErrorExt {
    /// Invalid/bad request.
    fn invalid(&self) -> HttpApiError;

    /// Resource was not found.
    fn not_found(&self) -> HttpApiError;

    /// The backing store cannot serve the request right now.
    fn unavailable(&self) -> HttpApiError;
}

impl<E> HttpApiErrorExt for E
where
    E: std::error::Error,
{
    fn invalid(&self) -> HttpApiError {
        HttpApiError::new(HttpApiErrorCode::Invalid, self.to_string())
    }

    fn not_found(&self) -> HttpApiError {
        HttpApiError::new(HttpApiErrorCode::NotFound, self.to_string())
    }

    fn unavailable(&self) -> HttpApiError {
        HttpApiError::new(HttpApiErrorCode::Unavailable, self.to_string())
    }
}

/// An error that can be transformed into a [`HttpApiError`].
pub trait HttpApiErrorSource: std::error::Error {
    fn to_http_api_error(&self) -> HttpApiError;
}
