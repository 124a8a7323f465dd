//! The HTTP API: `POST /{resolution}/{series}` plus health endpoints.

use std::{convert::Infallible, sync::Arc};

use hyper::{
    Body, Method, Request, Response, StatusCode,
    header::{ALLOW, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue},
};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use statingest_types::{ParseResolutionError, Resolution, SeriesKey};
use statingest_write::{
    IngestOutcome, Ingester,
    backend::BackendError,
    backoff::BackoffError,
    coordinator::Commit,
    rollup::{AppliedRollup, RollupReport},
};
use thiserror::Error;
use tracing::{debug, error};

use self::{
    body::{ParseBodyError, parse_body},
    error::{HttpApiError, HttpApiErrorCode, HttpApiErrorExt, HttpApiErrorSource},
};

pub mod body;
pub mod error;

/// Seconds a client is asked to wait after a busy response.
const BUSY_RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("no handler for {method} {path}")]
    NoHandler { method: Method, path: String },

    #[error("method {method} not allowed on {path}")]
    MethodNotAllowed {
        method: Method,
        path: String,
        allow: &'static str,
    },

    #[error(transparent)]
    UnknownResolution(#[from] ParseResolutionError),

    #[error("series name {series:?} is not valid percent-encoded UTF-8: {source}")]
    SeriesEncoding {
        series: String,
        source: std::str::Utf8Error,
    },

    #[error(transparent)]
    Body(#[from] ParseBodyError),

    #[error(transparent)]
    Ingest(#[from] statingest_write::Error),

    #[error("a different point is already stored at {key}")]
    Conflict { key: SeriesKey },

    #[error("another write to {key} is in flight")]
    Busy { key: SeriesKey },

    #[error("cannot store {key}: {source}")]
    Backend {
        key: SeriesKey,
        source: BackoffError<BackendError>,
    },

    #[error("cannot encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HttpApiErrorSource for ApplicationError {
    fn to_http_api_error(&self) -> HttpApiError {
        match self {
            e @ Self::NoHandler { .. } => e.not_found(),
            e @ Self::MethodNotAllowed { .. } => {
                HttpApiError::new(HttpApiErrorCode::MethodNotAllowed, e.to_string())
            }
            e @ Self::UnknownResolution(_) => e.not_found(),
            e @ Self::SeriesEncoding { .. } => e.invalid(),
            Self::Body(e) => e.to_http_api_error(),
            Self::Ingest(e) => e.to_http_api_error(),
            e @ Self::Conflict { .. } => {
                HttpApiError::new(HttpApiErrorCode::Conflict, e.to_string())
            }
            e @ Self::Busy { .. } => {
                HttpApiError::new(HttpApiErrorCode::TooManyRequests, e.to_string())
                    .with_retry_after(BUSY_RETRY_AFTER_SECS)
            }
            e @ Self::Backend { .. } => e.unavailable(),
            e @ Self::Encode(_) => HttpApiError::new(HttpApiErrorCode::InternalError, e.to_string()),
        }
    }
}

impl HttpApiErrorSource for statingest_write::Error {
    fn to_http_api_error(&self) -> HttpApiError {
        match self {
            e @ Self::Validation(_) => e.invalid(),
            e @ Self::InvalidSeriesName(..) => e.invalid(),
            e @ Self::ResolutionNotConfigured(_) => e.not_found(),
            e @ (Self::NoResolutions | Self::InvalidBackoffBase(_) | Self::DeadlineTooLong(_)) => {
                HttpApiError::new(HttpApiErrorCode::InternalError, e.to_string())
            }
        }
    }
}

/// State shared by all request handlers.
#[derive(Debug)]
pub struct HttpApi {
    ingester: Arc<Ingester>,
    max_request_size: usize,
}

impl HttpApi {
    pub fn new(ingester: Arc<Ingester>, max_request_size: usize) -> Self {
        Self {
            ingester,
            max_request_size,
        }
    }

    pub fn ingester(&self) -> &Arc<Ingester> {
        &self.ingester
    }

    async fn write(
        &self,
        resolution: &str,
        series: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, ApplicationError> {
        let resolution: Resolution = resolution.parse()?;
        let series = percent_decode_str(series).decode_utf8().map_err(|source| {
            ApplicationError::SeriesEncoding {
                series: series.to_string(),
                source,
            }
        })?;

        let (parts, body) = req.into_parts();
        let body = parse_body(&parts.headers, body, self.max_request_size).await?;

        let outcome = self
            .ingester
            .ingest_json(&series, resolution, &body)
            .await?;

        match outcome {
            IngestOutcome::Committed {
                key,
                commit,
                rollup,
            } => {
                debug!(%key, ?commit, applied = rollup.applied.len(), "point committed");
                let body = serde_json::to_vec(&WriteResponse::new(&key, commit, &rollup))?;
                Ok(json_response(StatusCode::OK, body))
            }
            IngestOutcome::Conflict { key, .. } => Err(ApplicationError::Conflict { key }),
            IngestOutcome::Busy { key } => Err(ApplicationError::Busy { key }),
            IngestOutcome::BackendFailure { key, error } => Err(ApplicationError::Backend {
                key,
                source: error,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct WriteResponse<'a> {
    status: &'static str,
    key: &'a SeriesKey,
    rollup: RollupResponse<'a>,
}

#[derive(Debug, Serialize)]
struct RollupResponse<'a> {
    applied: &'a [AppliedRollup],
    stale: Vec<StaleResponse<'a>>,
}

#[derive(Debug, Serialize)]
struct StaleResponse<'a> {
    key: &'a SeriesKey,
    error: String,
}

impl<'a> WriteResponse<'a> {
    fn new(key: &'a SeriesKey, commit: Commit, rollup: &'a RollupReport) -> Self {
        let status = match commit {
            Commit::Created => "created",
            Commit::Unchanged => "unchanged",
        };
        let stale = rollup
            .stale
            .iter()
            .map(|s| StaleResponse {
                key: &s.key,
                error: s.error.to_string(),
            })
            .collect();

        Self {
            status,
            key,
            rollup: RollupResponse {
                applied: &rollup.applied,
                stale,
            },
        }
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub(crate) async fn route_request(
    http: Arc<HttpApi>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    debug!(request = ?req, "Processing request");

    let method = req.method().clone();
    let uri = req.uri().clone();
    let content_length = req.headers().get(CONTENT_LENGTH).cloned();

    let segments: Vec<&str> = uri.path().trim_start_matches('/').splitn(2, '/').collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => health(),
        (&Method::GET, ["ping"]) => ping(),
        (_, ["health" | "ping"]) => Err(ApplicationError::MethodNotAllowed {
            method: method.clone(),
            path: uri.path().to_string(),
            allow: "GET",
        }),
        (&Method::POST, [resolution, series]) => http.write(resolution, series, req).await,
        (_, [resolution, _]) if resolution.parse::<Resolution>().is_ok() => {
            Err(ApplicationError::MethodNotAllowed {
                method: method.clone(),
                path: uri.path().to_string(),
                allow: "POST",
            })
        }
        _ => Err(ApplicationError::NoHandler {
            method: method.clone(),
            path: uri.path().to_string(),
        }),
    };

    match response {
        Ok(response) => {
            debug!(?response, "Successfully processed request");
            Ok(response)
        }
        Err(e) => {
            let allow = match &e {
                ApplicationError::MethodNotAllowed { allow, .. } => Some(*allow),
                _ => None,
            };
            let error: HttpApiError = e.to_http_api_error();
            if error.is_internal() {
                error!(%error, %method, %uri, ?content_length, "Error while handling request");
            } else {
                debug!(%error, %method, %uri, ?content_length, "Error while handling request");
            }

            let mut response = error.response();
            if let Some(allow) = allow {
                response
                    .headers_mut()
                    .insert(ALLOW, HeaderValue::from_static(allow));
            }
            Ok(response)
        }
    }
}

fn health() -> Result<Response<Body>, ApplicationError> {
    Ok(Response::new(Body::from("OK")))
}

fn ping() -> Result<Response<Body>, ApplicationError> {
    let body = serde_json::to_vec(&serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
    }))?;
    Ok(json_response(StatusCode::OK, body))
}
