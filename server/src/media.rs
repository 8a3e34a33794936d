//! Media collaborators: duration probing and the byte-range file endpoint.

use anyhow::{bail, ensure, Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::future::BoxFuture;
use std::io::SeekFrom;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::coordinator::SyncCoordinator;

/// Reports the duration of a media file in milliseconds
pub trait MediaProbe: Send + Sync {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<i64>>;
}

impl<P: MediaProbe + ?Sized> MediaProbe for Box<P> {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<i64>> {
        (**self).probe(path)
    }
}

/// Probe that trusts a configured duration
pub struct FixedDuration(pub i64);

impl MediaProbe for FixedDuration {
    fn probe<'a>(&'a self, _path: &'a Path) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move { Ok(self.0) })
    }
}

/// Probe backed by `ffprobe`
pub struct FfprobeProbe {
    binary: String,
}

impl FfprobeProbe {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl MediaProbe for FfprobeProbe {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let output = tokio::process::Command::new(&self.binary)
                .args([
                    "-v",
                    "error",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                ])
                .arg(path)
                .output()
                .await
                .with_context(|| format!("failed to run {}", self.binary))?;

            if !output.status.success() {
                bail!(
                    "{} exited with {}: {}",
                    self.binary,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }

            parse_ffprobe_duration(&String::from_utf8_lossy(&output.stdout))
        })
    }
}

/// Convert ffprobe's `duration` (seconds, fractional) into milliseconds
pub fn parse_ffprobe_duration(text: &str) -> Result<i64> {
    let secs: f64 = text
        .trim()
        .parse()
        .with_context(|| format!("unexpected ffprobe output {:?}", text.trim()))?;
    ensure!(secs.is_finite() && secs >= 0.0, "invalid duration {secs}");
    Ok((secs * 1000.0).round() as i64)
}

/// Inclusive byte range within a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("range must use the bytes unit")]
    Unit,
    #[error("multiple ranges are not supported")]
    Multiple,
    #[error("malformed range {0:?}")]
    Malformed(String),
    #[error("range not satisfiable for {0} bytes")]
    Unsatisfiable(u64),
}

/// Parse a single `Range: bytes=...` specification against a resource of `len` bytes.
pub fn parse_range(header: &str, len: u64) -> Result<ByteRange, RangeError> {
    let spec = header.trim().strip_prefix("bytes=").ok_or(RangeError::Unit)?;
    if spec.contains(',') {
        return Err(RangeError::Multiple);
    }
    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| RangeError::Malformed(spec.to_string()))?;
    let parse = |value: &str| {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| RangeError::Malformed(spec.to_string()))
    };

    let range = match (start.trim().is_empty(), end.trim().is_empty()) {
        // bytes=-N: the last N bytes
        (true, false) => {
            let suffix = parse(end)?;
            if suffix == 0 || len == 0 {
                return Err(RangeError::Unsatisfiable(len));
            }
            ByteRange {
                start: len.saturating_sub(suffix),
                end: len - 1,
            }
        }
        // bytes=N-: until EOF
        (false, true) => ByteRange {
            start: parse(start)?,
            end: len.saturating_sub(1),
        },
        (false, false) => {
            let start = parse(start)?;
            let end = parse(end)?;
            if end < start {
                return Err(RangeError::Malformed(spec.to_string()));
            }
            ByteRange {
                start,
                end: end.min(len.saturating_sub(1)),
            }
        }
        (true, true) => return Err(RangeError::Malformed(spec.to_string())),
    };

    if len == 0 || range.start >= len {
        return Err(RangeError::Unsatisfiable(len));
    }
    Ok(range)
}

/// Guess a content type from the file extension
pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "vtt" => "text/vtt",
        _ => "application/octet-stream",
    }
}

fn content_disposition(path: &Path) -> Option<HeaderValue> {
    let name = path.file_name()?.to_string_lossy();
    let ascii: String = name
        .chars()
        .map(|ch| if ch.is_ascii() && ch != '"' && !ch.is_ascii_control() { ch } else { '?' })
        .collect();
    HeaderValue::from_str(&format!("inline; filename=\"{ascii}\"")).ok()
}

/// Build the response for `path`, honouring an optional Range header.
pub async fn media_response(path: &Path, range: Option<&str>) -> Result<Response> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let len = file.metadata().await?.len();

    let (status, span) = match range {
        Some(header) => match parse_range(header, len) {
            Ok(span) => (StatusCode::PARTIAL_CONTENT, Some(span)),
            Err(err) => {
                tracing::debug!("Rejecting range {:?}: {}", header, err);
                return Ok((StatusCode::UNPROCESSABLE_ENTITY, err.to_string()).into_response());
            }
        },
        None => (StatusCode::OK, None),
    };

    let (start, body_len) = match span {
        Some(span) => (span.start, span.len()),
        None => (0, len),
    };
    file.seek(SeekFrom::Start(start)).await?;
    let body = Body::from_stream(ReaderStream::new(file.take(body_len)));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(guess_mime(path)));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(span) = span {
        let value = format!("bytes {}-{}/{}", span.start, span.end, len);
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_str(&value)?);
    }
    if let Some(disposition) = content_disposition(path) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    Ok(response)
}

/// `GET /media`: streams the loaded media file
pub async fn serve_media(State(coordinator): State<SyncCoordinator>, headers: HeaderMap) -> Response {
    let Some(media) = coordinator.media() else {
        return (StatusCode::NOT_FOUND, "No media loaded").into_response();
    };

    let range = match headers.get(header::RANGE).map(|value| value.to_str()) {
        Some(Ok(value)) => Some(value),
        Some(Err(_)) => {
            return (StatusCode::UNPROCESSABLE_ENTITY, "Range header is not ASCII").into_response()
        }
        None => None,
    };

    match media_response(&media.path, range).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Failed to serve {}: {:#}", media.path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to serve file").into_response()
        }
    }
}
