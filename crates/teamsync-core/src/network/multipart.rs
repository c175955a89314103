//! Decoding of multipart response bodies.
//!
//! Bulk image downloads answer with one part per image, named by image id
//! in the part's `Content-Disposition` header.

use crate::{Result, SyncError};

/// One decoded part: its `name` and raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: String,
    pub body: Vec<u8>,
}

/// Extract the boundary parameter from a `multipart/*` content type.
pub fn boundary_of(content_type: &str) -> Result<String> {
    let mut params = content_type.split(';');
    let mime = params.next().unwrap_or_default().trim().to_ascii_lowercase();
    if !mime.starts_with("multipart/") {
        return Err(SyncError::Other(format!(
            "Expected a multipart response, got '{}'",
            content_type
        )));
    }

    params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
        .ok_or_else(|| SyncError::Other(format!("No boundary in '{}'", content_type)))
}

/// Split a multipart body into its named parts, in body order.
pub fn decode(content_type: &str, body: &[u8]) -> Result<Vec<MultipartPart>> {
    let boundary = boundary_of(content_type)?;
    let delimiter = format!("--{}", boundary).into_bytes();
    let separator = format!("\r\n--{}", boundary).into_bytes();
    let malformed = |what: &str| SyncError::Other(format!("Malformed multipart body: {}", what));

    let start = find(body, &delimiter, 0).ok_or_else(|| malformed("missing first boundary"))?;
    let mut cursor = start + delimiter.len();
    let mut parts = Vec::new();

    loop {
        if body[cursor..].starts_with(b"--") {
            break;
        }
        cursor = skip_line_end(body, cursor);

        let headers_end =
            find(body, b"\r\n\r\n", cursor).ok_or_else(|| malformed("unterminated headers"))?;
        let headers = std::str::from_utf8(&body[cursor..headers_end])
            .map_err(|_| malformed("headers are not UTF-8"))?;
        let name = part_name(headers).ok_or_else(|| malformed("part without a name"))?;

        let body_start = headers_end + 4;
        let body_end =
            find(body, &separator, body_start).ok_or_else(|| malformed("unterminated part"))?;
        parts.push(MultipartPart {
            name,
            body: body[body_start..body_end].to_vec(),
        });
        cursor = body_end + separator.len();
    }

    Ok(parts)
}

fn part_name(headers: &str) -> Option<String> {
    headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-disposition"))
        .and_then(|(_, value)| {
            value
                .split(';')
                .filter_map(|param| param.split_once('='))
                .find(|(key, _)| key.trim() == "name")
                .map(|(_, name)| name.trim().trim_matches('"').to_string())
        })
}

fn skip_line_end(body: &[u8], cursor: usize) -> usize {
    if body[cursor..].starts_with(b"\r\n") {
        cursor + 2
    } else {
        cursor
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
