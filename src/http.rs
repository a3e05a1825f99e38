//! Byte-level HTTP/1.x request head parsing
//!
//! Every function works directly on the read buffer and reports absolute
//! offsets so the tunnel can splice rewritten values into the original bytes
//! without rebuilding the message. Malformed or incomplete input is reported
//! as `None`, never as a panic.

use std::collections::HashMap;
use tracing::debug;

/// End of the header section.
pub const END_OF_HEADERS: &[u8] = b"\r\n\r\n";

/// Zero-length chunk closing a chunked body.
pub const END_OF_CHUNKED: &[u8] = b"0\r\n\r\n";

const CRLF: &[u8] = b"\r\n";

/// Smallest request line worth looking at ("GET / H").
const MIN_REQUEST_LINE: usize = 8;

/// Parsed request line with the position of the path inside the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
    /// Version token as sent, e.g. `HTTP/1.1`
    pub http_version: String,
    /// Numeric part of the version token, e.g. `1.1`
    pub version: String,
    /// Absolute offset of the first path byte
    pub path_offset: usize,
    /// Length of the path in bytes
    pub path_len: usize,
    /// Absolute offset just past the request line's CRLF
    pub end_offset: usize,
}

impl RequestLine {
    /// Absolute offset of the first byte after the path
    pub fn path_end(&self) -> usize {
        self.path_offset + self.path_len
    }
}

/// A header value and where it sits in the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderValue {
    pub value: String,
    pub offset: usize,
    pub len: usize,
}

impl HeaderValue {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Header map with case-insensitive names. A repeated header keeps the last value.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    values: HashMap<String, HeaderValue>,
}

impl Headers {
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.values.get(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn insert(&mut self, name: &str, value: HeaderValue) {
        self.values.insert(name.to_ascii_lowercase(), value);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn is_blank(byte: u8) -> bool {
    byte == b' ' || byte == b'\t'
}

fn trim_blanks(bytes: &[u8], mut start: usize, mut end: usize) -> (usize, usize) {
    while start < end && is_blank(bytes[start]) {
        start += 1;
    }
    while end > start && is_blank(bytes[end - 1]) {
        end -= 1;
    }
    (start, end)
}

/// True once the buffer holds the complete header section.
pub fn headers_complete(buffer: &[u8]) -> bool {
    find(buffer, END_OF_HEADERS).is_some()
}

/// Index of the chunked body terminator, if present.
pub fn find_chunk_terminator(buffer: &[u8]) -> Option<usize> {
    find(buffer, END_OF_CHUNKED)
}

/// Parse the request line found at `buffer[offset..offset + length]`.
pub fn parse_request_line(buffer: &[u8], offset: usize, length: usize) -> Option<RequestLine> {
    if length < MIN_REQUEST_LINE {
        return None;
    }
    let span = buffer.get(offset..offset.checked_add(length)?)?;

    let line_end = span.iter().position(|&b| b == b'\r')?;
    let line = &span[..line_end];

    let Some(first_space) = line.iter().position(|&b| b == b' ') else {
        debug!(offset, length, "invalid request line: no space after method");
        return None;
    };
    let method = String::from_utf8_lossy(&line[..first_space]).to_ascii_uppercase();

    let mut path_start = first_space + 1;
    while path_start < line.len() && line[path_start] == b' ' {
        path_start += 1;
    }
    let mut path_end = path_start;
    while path_end < line.len() && line[path_end] != b' ' {
        path_end += 1;
    }
    let path = String::from_utf8_lossy(&line[path_start..path_end]).into_owned();

    let mut version_start = path_end + 1;
    while version_start < line.len() && line[version_start] == b' ' {
        version_start += 1;
    }
    if version_start >= line.len() {
        debug!("invalid request line: version not found");
        return None;
    }
    let http_version = String::from_utf8_lossy(&line[version_start..]).into_owned();

    let is_http = http_version
        .get(..5)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("HTTP/"));
    if !is_http {
        debug!(version = %http_version, "unrecognized HTTP version");
        return None;
    }
    let version = http_version[5..].to_string();
    if version.is_empty() {
        debug!(version = %http_version, "invalid HTTP version format");
        return None;
    }

    // A CR not followed by LF still ends the line; skip LF only when present.
    let mut end = line_end + 1;
    if span.get(end) == Some(&b'\n') {
        end += 1;
    }

    Some(RequestLine {
        method,
        path,
        http_version,
        version,
        path_offset: offset + path_start,
        path_len: path_end - path_start,
        end_offset: offset + end,
    })
}

/// Parse header lines from `buffer[offset..offset + length]`.
///
/// Returns the headers seen so far and the absolute offset right after the
/// blank line, or `None` for the offset when the section is not complete yet.
pub fn parse_headers(buffer: &[u8], offset: usize, length: usize) -> (Headers, Option<usize>) {
    let mut headers = Headers::default();
    let Some(span) = offset
        .checked_add(length)
        .and_then(|end| buffer.get(offset..end))
    else {
        return (headers, None);
    };

    let mut i = 0;
    while i < span.len() {
        let Some(rel) = find(&span[i..], CRLF) else {
            break;
        };
        let line_end = i + rel;

        if line_end == i {
            return (headers, Some(offset + i + CRLF.len()));
        }

        if let Some(colon) = span[i..line_end].iter().position(|&b| b == b':').map(|c| i + c) {
            if colon > i {
                let (name_start, name_end) = trim_blanks(span, i, colon);
                let (value_start, value_end) = trim_blanks(span, colon + 1, line_end);
                let name = String::from_utf8_lossy(&span[name_start..name_end]);
                headers.insert(
                    &name,
                    HeaderValue {
                        value: String::from_utf8_lossy(&span[value_start..value_end]).into_owned(),
                        offset: offset + value_start,
                        len: value_end - value_start,
                    },
                );
            }
        }

        i = line_end + CRLF.len();
    }

    (headers, None)
}
