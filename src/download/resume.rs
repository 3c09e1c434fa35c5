//! HTTP range resume support.
//!
//! A resumed fetch asks for `Range: bytes=<offset>-`. A `206` reply must
//! confirm that exact offset; any other start is a hard error. A `200`
//! reply means the server ignored the range and the transfer starts over.

use std::path::Path;

use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};

use crate::error::{Error, Result};

/// Parsed `Content-Range: bytes start-end/total` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server sent `*`.
    pub total: Option<u64>,
}

/// How a response to a (possibly ranged) request should be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeResponse {
    /// Server honoured the range; append to the staged file.
    Partial(ContentRange),
    /// Full body; truncate the staged file and start from zero.
    Restart { total: Option<u64> },
}

/// What to do with a locally staged partial file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialState {
    /// Nothing usable on disk; fetch from zero.
    Fresh,
    /// Continue from this offset.
    Resume(u64),
    /// Already holds the whole resource.
    Complete(u64),
    /// Larger than the resource; discarded.
    Corrupt(u64),
}

/// `GET url`, with a `Range` header when `offset > 0`.
pub fn build_range_request(client: &Client, url: &str, offset: u64) -> RequestBuilder {
    let request = client.get(url);
    if offset > 0 {
        request.header(RANGE, format!("bytes={}-", offset))
    } else {
        request
    }
}

/// Parse a `Content-Range` header value.
pub fn parse_content_range(value: &str) -> Result<ContentRange> {
    let malformed = || Error::ContentRange(value.to_string());

    let rest = value.trim().strip_prefix("bytes").ok_or_else(malformed)?.trim_start();
    let (range, total) = rest.split_once('/').ok_or_else(malformed)?;
    let (start, end) = range.trim().split_once('-').ok_or_else(malformed)?;

    let start: u64 = start.trim().parse().map_err(|_| malformed())?;
    let end: u64 = end.trim().parse().map_err(|_| malformed())?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().map_err(|_| malformed())?),
    };

    if end < start || total.is_some_and(|t| end >= t) {
        return Err(malformed());
    }
    Ok(ContentRange { start, end, total })
}

/// Classify a response to a request made from `requested_offset`.
///
/// Statuses other than 200 and 206 are errors.
pub fn check_resume_response(response: &Response, requested_offset: u64) -> Result<ResumeResponse> {
    match response.status() {
        StatusCode::PARTIAL_CONTENT => {
            let header = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| Error::ContentRange("missing on 206 response".to_string()))?;
            let range = parse_content_range(header)?;
            if range.start != requested_offset {
                return Err(Error::RangeMismatch {
                    requested: requested_offset,
                    actual: range.start,
                });
            }
            Ok(ResumeResponse::Partial(range))
        }
        StatusCode::OK => {
            if requested_offset > 0 {
                tracing::info!(
                    url = %response.url(),
                    "Server ignored range request, restarting from zero"
                );
            }
            Ok(ResumeResponse::Restart {
                total: response.content_length(),
            })
        }
        status => Err(Error::HttpStatus {
            status: status.as_u16(),
            url: response.url().to_string(),
        }),
    }
}

/// Decide what a staged file of `size` bytes is good for.
pub fn validate_partial(size: u64, expected_total: Option<u64>) -> PartialState {
    match expected_total {
        _ if size == 0 => PartialState::Fresh,
        // Without a known total there is nothing to validate against.
        None => PartialState::Corrupt(size),
        Some(total) if size < total => PartialState::Resume(size),
        Some(total) if size == total => PartialState::Complete(size),
        Some(_) => PartialState::Corrupt(size),
    }
}

/// Inspect the staged file at `path`, deleting it when it cannot be used.
pub async fn inspect_partial(path: &Path, expected_total: Option<u64>) -> Result<PartialState> {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PartialState::Fresh),
        Err(e) => return Err(e.into()),
    };

    let state = validate_partial(size, expected_total);
    if let PartialState::Corrupt(size) = state {
        tracing::warn!(
            path = %path.display(),
            size,
            expected_total,
            "Discarding unusable partial file"
        );
        tokio::fs::remove_file(path).await?;
    }
    Ok(state)
}
