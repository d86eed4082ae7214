use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::error::AppError;
use crate::storage::{ChecksumAlgo, ChunkMeta, RangeSpec};
use crate::utils::state::AppState;
use crate::utils::validation::is_valid_chunk_id;

pub const HEADER_CHUNK_ID: &str = "x-oio-chunk-meta-chunk-id";
pub const HEADER_CHUNK_SIZE: &str = "x-oio-chunk-meta-chunk-size";
pub const HEADER_CHUNK_HASH: &str = "x-oio-chunk-meta-chunk-hash";
pub const HEADER_CHUNK_HASH_ALGO: &str = "x-oio-chunk-meta-chunk-hash-algo";
pub const HEADER_COMPRESSION: &str = "x-oio-chunk-meta-compression";

const OCTET_STREAM: &str = "application/octet-stream";

/// PUT /chunk/<id>
pub async fn put_chunk_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    request: Request,
) -> Result<impl IntoResponse, AppError> {
    check_chunk_id(&id)?;
    let declared = meta_from_headers(&id, &headers)?;

    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::UnexpectedEof, e));
    let meta = state.repo.put(declared, StreamReader::new(stream)).await?;

    Ok((StatusCode::CREATED, meta_headers(&meta)))
}

/// GET /chunk/<id>
pub async fn get_chunk_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    check_chunk_id(&id)?;
    let range = headers
        .get(RANGE)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::InvalidRange("not ascii".to_string()))
                .and_then(parse_range)
        })
        .transpose()?;

    let read = state.repo.get(&id, range).await?;
    let mut response_headers = meta_headers(&read.meta);
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
    response_headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(CONTENT_LENGTH, HeaderValue::from(read.len()));

    let status = match read.range {
        Some((start, end)) => {
            let value = format!("bytes {start}-{end}/{}", read.size);
            if let Ok(value) = HeaderValue::from_str(&value) {
                response_headers.insert(CONTENT_RANGE, value);
            }
            StatusCode::PARTIAL_CONTENT
        }
        None => StatusCode::OK,
    };
    let body = Body::from_stream(ReaderStream::new(read.reader));
    Ok((status, response_headers, body).into_response())
}

/// HEAD /chunk/<id>
pub async fn head_chunk_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    check_chunk_id(&id)?;
    let meta = state.repo.head(&id).await?;
    let mut response_headers = meta_headers(&meta);
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
    response_headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(CONTENT_LENGTH, HeaderValue::from(meta.chunk_size.unwrap_or(0)));
    Ok((StatusCode::OK, response_headers))
}

/// DELETE /chunk/<id>
pub async fn delete_chunk_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    check_chunk_id(&id)?;
    state.repo.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn check_chunk_id(id: &str) -> Result<(), AppError> {
    if !is_valid_chunk_id(id) {
        return Err(AppError::InvalidChunkId(id.to_string()));
    }
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, AppError> {
    headers
        .get(name)
        .map(|value| {
            std::str::from_utf8(value.as_bytes())
                .map(str::trim)
                .map_err(|_| AppError::invalid_header(name, "not valid utf-8"))
        })
        .transpose()
}

/// Declared metadata of an upload, taken from the request headers.
pub fn meta_from_headers(id: &str, headers: &HeaderMap) -> Result<ChunkMeta, AppError> {
    let mut meta = ChunkMeta::new(id);

    if let Some(declared_id) = header_str(headers, HEADER_CHUNK_ID)? {
        if !declared_id.eq_ignore_ascii_case(id) {
            return Err(AppError::invalid_header(
                HEADER_CHUNK_ID,
                format!("`{declared_id}` does not name the target chunk"),
            ));
        }
    }
    meta.chunk_size = header_str(headers, HEADER_CHUNK_SIZE)?
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| AppError::invalid_header(HEADER_CHUNK_SIZE, format!("`{raw}` is not a size")))
        })
        .transpose()?;
    meta.chunk_hash = header_str(headers, HEADER_CHUNK_HASH)?
        .map(|raw| {
            if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(AppError::invalid_header(
                    HEADER_CHUNK_HASH,
                    format!("`{raw}` is not a hexadecimal digest"),
                ));
            }
            Ok(raw.to_ascii_uppercase())
        })
        .transpose()?;
    meta.chunk_hash_algo = header_str(headers, HEADER_CHUNK_HASH_ALGO)?
        .map(|raw| {
            raw.parse::<ChecksumAlgo>()
                .map_err(|e| AppError::invalid_header(HEADER_CHUNK_HASH_ALGO, e))
        })
        .transpose()?;

    for (field, value) in meta.text_fields_mut() {
        *value = header_str(headers, field.header)?.map(str::to_string);
    }
    Ok(meta)
}

/// Response headers describing a stored chunk.
pub fn meta_headers(meta: &ChunkMeta) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: &str| {
        match HeaderValue::from_bytes(value.as_bytes()) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(name), value);
            }
            Err(_) => tracing::warn!("chunk {}: cannot send {name} `{value}`", meta.chunk_id),
        }
    };

    put(HEADER_CHUNK_ID, &meta.chunk_id);
    if let Some(size) = meta.chunk_size {
        put(HEADER_CHUNK_SIZE, &size.to_string());
    }
    if let Some(hash) = &meta.chunk_hash {
        put(HEADER_CHUNK_HASH, hash);
    }
    if let Some(algo) = meta.chunk_hash_algo {
        put(HEADER_CHUNK_HASH_ALGO, algo.as_str());
    }
    if let Some(compression) = &meta.compression {
        put(HEADER_COMPRESSION, compression);
    }
    for (field, value) in meta.text_fields() {
        if let Some(value) = value {
            put(field.header, value);
        }
    }
    headers
}

/// Parses a single `bytes=` range. Multiple ranges are not served.
pub fn parse_range(raw: &str) -> Result<RangeSpec, AppError> {
    let invalid = || AppError::InvalidRange(raw.to_string());
    let spec = raw.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
    if spec.contains(',') {
        return Err(invalid());
    }
    let (start, end) = spec.split_once('-').ok_or_else(invalid)?;
    let number = |s: &str| s.trim().parse::<u64>().map_err(|_| invalid());
    match (start.trim().is_empty(), end.trim().is_empty()) {
        (false, false) => {
            let (start, end) = (number(start)?, number(end)?);
            if end < start {
                return Err(invalid());
            }
            Ok(RangeSpec::FromTo(start, end))
        }
        (false, true) => Ok(RangeSpec::From(number(start)?)),
        (true, false) => Ok(RangeSpec::Suffix(number(end)?)),
        (true, true) => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-99").unwrap(), RangeSpec::FromTo(0, 99));
        assert_eq!(parse_range("bytes=100-").unwrap(), RangeSpec::From(100));
        assert_eq!(parse_range("bytes=-5").unwrap(), RangeSpec::Suffix(5));
        for bad in ["bytes=", "bytes=-", "bytes=5-1", "items=0-1", "bytes=0-1,4-5", "bytes=a-b"] {
            assert!(parse_range(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_meta_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-oio-chunk-meta-chunk-hash", HeaderValue::from_static("abcdef"));
        headers.insert("x-oio-chunk-meta-chunk-size", HeaderValue::from_static("12"));
        headers.insert("x-oio-chunk-meta-content-path", HeaderValue::from_static("dir/obj"));
        headers.insert("x-oio-chunk-meta-chunk-hash-algo", HeaderValue::from_static("SHA256"));

        let meta = meta_from_headers("AB", &headers).unwrap();
        assert_eq!(meta.chunk_id, "AB");
        assert_eq!(meta.chunk_hash.as_deref(), Some("ABCDEF"));
        assert_eq!(meta.chunk_size, Some(12));
        assert_eq!(meta.content_path.as_deref(), Some("dir/obj"));
        assert_eq!(meta.chunk_hash_algo, Some(ChecksumAlgo::Sha256));
    }

    #[test]
    fn test_bad_meta_headers() {
        let cases = [
            ("x-oio-chunk-meta-chunk-size", "twelve"),
            ("x-oio-chunk-meta-chunk-hash", "not-hex"),
            ("x-oio-chunk-meta-chunk-hash-algo", "crc32"),
            ("x-oio-chunk-meta-chunk-id", "CD"),
        ];
        for (name, value) in cases {
            let mut headers = HeaderMap::new();
            headers.insert(name, HeaderValue::from_static(value));
            let err = meta_from_headers("AB", &headers).unwrap_err();
            assert!(matches!(err, AppError::InvalidHeader { .. }), "{name}");
        }
    }

    #[test]
    fn test_meta_headers_roundtrip() {
        let mut meta = ChunkMeta::new("AB");
        meta.chunk_size = Some(3);
        meta.chunk_hash = Some("00FF".into());
        meta.chunk_pos = Some("0.1".into());
        meta.compression = Some("zlib".into());

        let headers = meta_headers(&meta);
        assert_eq!(headers[HEADER_CHUNK_SIZE], "3");
        assert_eq!(headers[HEADER_COMPRESSION], "zlib");
        assert_eq!(headers["x-oio-chunk-meta-chunk-pos"], "0.1");

        let parsed = meta_from_headers("AB", &headers).unwrap();
        assert_eq!(parsed.chunk_pos, meta.chunk_pos);
        assert_eq!(parsed.chunk_hash, meta.chunk_hash);
    }
}
