use bytes::{Bytes, BytesMut};
use hyper::{Body, HeaderMap, StatusCode, body::HttpBody, header::CONTENT_ENCODING};
use thiserror::Error;

use super::error::{HttpApiError, HttpApiErrorExt, HttpApiErrorSource};

#[derive(Debug, Error)]
pub enum ParseBodyError {
    #[error("Body exceeds limit of {max_body_size} bytes")]
    RequestSizeExceeded { max_body_size: usize },

    #[error("Invalid content encoding: {content_encoding}")]
    InvalidContentEncoding { content_encoding: String },

    #[error("Error reading request header '{header_name}' as Utf8: {source}")]
    ReadingHeaderAsUtf8 {
        header_name: &'static str,
        source: hyper::header::ToStrError,
    },

    #[error("Error decompressing body as gzip: {0}")]
    ReadingBodyAsGzip(#[source] std::io::Error),

    #[error("Client hung up while sending body: {0}")]
    ClientHangup(#[source] hyper::Error),
}

impl HttpApiErrorSource for ParseBodyError {
    fn to_http_api_error(&self) -> HttpApiError {
        match self {
            e @ Self::RequestSizeExceeded { .. } => {
                HttpApiError::new(StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
            }
            e @ Self::InvalidContentEncoding { .. } => {
                HttpApiError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, e.to_string())
            }
            e @ Self::ReadingHeaderAsUtf8 { .. } => e.invalid(),
            e @ Self::ReadingBodyAsGzip(_) => e.invalid(),
            e @ Self::ClientHangup(_) => e.invalid(),
        }
    }
}

/// Read the whole request body, applying the size limit and any content encoding.
///
/// The limit holds for both the bytes on the wire and the decoded payload.
pub async fn parse_body(
    headers: &HeaderMap,
    mut payload: Body,
    max_size: usize,
) -> Result<Bytes, ParseBodyError> {
    let ungzip = match headers.get(CONTENT_ENCODING) {
        None => false,
        Some(content_encoding) => {
            let content_encoding =
                content_encoding
                    .to_str()
                    .map_err(|source| ParseBodyError::ReadingHeaderAsUtf8 {
                        header_name: CONTENT_ENCODING.as_str(),
                        source,
                    })?;
            match content_encoding {
                "gzip" => true,
                "identity" => false,
                _ => {
                    return Err(ParseBodyError::InvalidContentEncoding {
                        content_encoding: content_encoding.to_string(),
                    });
                }
            }
        }
    };

    let mut body = BytesMut::new();
    while let Some(chunk) = payload.data().await {
        let chunk = chunk.map_err(ParseBodyError::ClientHangup)?;
        if (body.len() + chunk.len()) > max_size {
            return Err(ParseBodyError::RequestSizeExceeded {
                max_body_size: max_size,
            });
        }
        body.extend_from_slice(&chunk);
    }
    let body = body.freeze();

    if !ungzip {
        return Ok(body);
    }

    use std::io::Read;
    let decoder = flate2::read::GzDecoder::new(&body[..]);

    // read one byte past the limit to tell a complete stream from a truncated one
    let mut decoder = decoder.take((max_size as u64).saturating_add(1));
    let mut decoded_data = Vec::new();
    decoder
        .read_to_end(&mut decoded_data)
        .map_err(ParseBodyError::ReadingBodyAsGzip)?;

    if decoded_data.len() > max_size {
        return Err(ParseBodyError::RequestSizeExceeded {
            max_body_size: max_size,
        });
    }

    Ok(decoded_data.into())
}
