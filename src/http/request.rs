//! HTTP request object and incremental request parser

use std::sync::Arc;

use tracing::debug;

use super::cookie::parse_cookie_header;
use super::headers::{HeaderMap, HeadersChecker, HttpError};

/// Observable state of the request parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Waiting for the request line
    WaitForRequestLine,
    /// Request line received, waiting for headers
    WaitForHeaders,
    /// Headers received, waiting for body bytes
    WaitForBody,
    /// Request fully received
    Complete,
    /// Request violates a size limit or is malformed
    Abort,
    /// A header check rejected the request
    WrongHeaders,
}

/// One part of a `multipart/form-data` body
#[derive(Debug, Clone)]
pub struct Part {
    /// Field name from the Content-Disposition header
    pub name: String,
    /// Original filename, for file uploads
    pub filename: Option<String>,
    /// Content type of the part, if declared
    pub content_type: Option<String>,
    /// Raw part data
    pub data: Vec<u8>,
}

/// A fully parsed HTTP request
#[derive(Debug, Clone, Default)]
pub struct Request {
    method: String,
    path: String,
    version: String,
    headers: HeaderMap,
    cookies: Vec<(String, String)>,
    parameters: Vec<(String, String)>,
    body: Vec<u8>,
    parts: Vec<Part>,
}

impl Request {
    /// Request method (e.g. `GET`)
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Decoded request path without the query string
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP version literal (e.g. `HTTP/1.0`)
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Request headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Value of the cookie with the given name, if present
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All request cookies in arrival order
    #[must_use]
    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    /// First value of the query or form parameter with the given name
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All query and form parameters in arrival order
    #[must_use]
    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    /// Raw request body
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Multipart body parts (empty unless the body was multipart/form-data)
    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }
}

/// Incremental HTTP/1.x request parser.
///
/// Bytes are pushed in with [`feed`](Self::feed), which consumes only up to
/// the end of the current request so that pipelined requests behind it stay
/// in the caller's buffer. A fresh parser is created per request.
pub struct RequestParser {
    status: ParseStatus,
    max_request_size: usize,
    max_multipart_size: usize,
    checker: Arc<HeadersChecker>,
    request: Request,
    line: Vec<u8>,
    consumed_size: usize,
    body_remaining: usize,
    boundary: Option<Vec<u8>>,
    http_error: Option<HttpError>,
}

impl RequestParser {
    /// Create a parser with the given size limits and header checks
    #[must_use]
    pub fn new(
        max_request_size: usize,
        max_multipart_size: usize,
        checker: Arc<HeadersChecker>,
    ) -> Self {
        Self {
            status: ParseStatus::WaitForRequestLine,
            max_request_size,
            max_multipart_size,
            checker,
            request: Request::default(),
            line: Vec::new(),
            consumed_size: 0,
            body_remaining: 0,
            boundary: None,
            http_error: None,
        }
    }

    /// Current parser status
    #[must_use]
    pub fn status(&self) -> ParseStatus {
        self.status
    }

    /// Error of the failing header check, valid while status is `WrongHeaders`
    #[must_use]
    pub fn http_error(&self) -> Option<&HttpError> {
        self.http_error.as_ref()
    }

    /// Take the parsed request; valid once status is `Complete`
    #[must_use]
    pub fn take_request(&mut self) -> Request {
        std::mem::take(&mut self.request)
    }

    /// Consume as many bytes as belong to the current request.
    ///
    /// Returns the number of bytes consumed; bytes past the end of the
    /// request are left untouched. Once the status is terminal (`Complete`,
    /// `Abort` or `WrongHeaders`) no further bytes are consumed.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;

        while consumed < data.len() {
            match self.status {
                ParseStatus::WaitForRequestLine | ParseStatus::WaitForHeaders => {
                    match data[consumed..].iter().position(|&b| b == b'\n') {
                        Some(idx) => {
                            self.line.extend_from_slice(&data[consumed..consumed + idx]);
                            consumed += idx + 1;
                            self.consumed_size += idx + 1;
                            self.process_line();
                        }
                        None => {
                            self.line.extend_from_slice(&data[consumed..]);
                            self.consumed_size += data.len() - consumed;
                            consumed = data.len();
                        }
                    }
                    if self.consumed_size > self.max_request_size {
                        debug!(
                            "request exceeds maximum size of {} bytes",
                            self.max_request_size
                        );
                        self.status = ParseStatus::Abort;
                    }
                }
                ParseStatus::WaitForBody => {
                    let take = self.body_remaining.min(data.len() - consumed);
                    self.request
                        .body
                        .extend_from_slice(&data[consumed..consumed + take]);
                    consumed += take;
                    self.body_remaining -= take;
                    if self.body_remaining == 0 {
                        self.finish_body();
                    }
                }
                ParseStatus::Complete | ParseStatus::Abort | ParseStatus::WrongHeaders => break,
            }
        }

        consumed
    }

    fn process_line(&mut self) {
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        let line = std::mem::take(&mut self.line);

        match self.status {
            ParseStatus::WaitForRequestLine => self.parse_request_line(&line),
            ParseStatus::WaitForHeaders => {
                if line.is_empty() {
                    self.finish_headers();
                } else {
                    self.parse_header_line(&line);
                }
            }
            _ => {}
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) {
        let Ok(text) = std::str::from_utf8(line) else {
            debug!("request line is not valid UTF-8");
            self.status = ParseStatus::Abort;
            return;
        };

        let mut words = text.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version)) =
            (words.next(), words.next(), words.next())
        else {
            debug!("malformed request line: {text:?}");
            self.status = ParseStatus::Abort;
            return;
        };
        if words.next().is_some() {
            debug!("malformed request line: {text:?}");
            self.status = ParseStatus::Abort;
            return;
        }

        self.request.method = method.to_string();
        self.request.version = version.to_string();
        match target.split_once('?') {
            Some((path, query)) => {
                self.request.path = percent_decode(path, false);
                self.request.parameters = parse_urlencoded(query);
            }
            None => self.request.path = percent_decode(target, false),
        }

        self.status = ParseStatus::WaitForHeaders;
    }

    fn parse_header_line(&mut self, line: &[u8]) {
        let Ok(text) = std::str::from_utf8(line) else {
            debug!("header line is not valid UTF-8");
            self.status = ParseStatus::Abort;
            return;
        };

        let Some((name, value)) = text.split_once(':') else {
            debug!("header line without colon: {text:?}");
            self.status = ParseStatus::Abort;
            return;
        };

        self.request
            .headers
            .insert(name.trim().to_string(), value.trim().to_string());
    }

    fn finish_headers(&mut self) {
        if let Some(error) = self.checker.run(&self.request.headers) {
            debug!("header check failed: {error}");
            self.http_error = Some(error);
            self.status = ParseStatus::WrongHeaders;
            return;
        }

        for value in self.request.headers.get_all("cookie") {
            self.request.cookies.extend(parse_cookie_header(value));
        }

        let content_length = self
            .request
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let content_type = self
            .request
            .headers
            .get("content-type")
            .unwrap_or("")
            .to_string();
        if content_type
            .to_ascii_lowercase()
            .starts_with("multipart/form-data")
        {
            self.boundary = extract_boundary(&content_type);
            if content_length > self.max_multipart_size {
                debug!(
                    "multipart body of {content_length} bytes exceeds limit of {} bytes",
                    self.max_multipart_size
                );
                self.status = ParseStatus::Abort;
                return;
            }
        } else if self.consumed_size + content_length > self.max_request_size {
            debug!(
                "body of {content_length} bytes exceeds request limit of {} bytes",
                self.max_request_size
            );
            self.status = ParseStatus::Abort;
            return;
        }

        if content_length > 0 {
            self.body_remaining = content_length;
            self.request.body.reserve(content_length);
            self.status = ParseStatus::WaitForBody;
        } else {
            self.status = ParseStatus::Complete;
        }
    }

    fn finish_body(&mut self) {
        if let Some(boundary) = self.boundary.take() {
            match parse_multipart(&self.request.body, &boundary) {
                Some(parts) => self.request.parts = parts,
                None => debug!("ignoring malformed multipart body"),
            }
        } else if self
            .request
            .headers
            .get("content-type")
            .is_some_and(|ct| {
                ct.to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            })
        {
            let body = String::from_utf8_lossy(&self.request.body).into_owned();
            self.request.parameters.extend(parse_urlencoded(&body));
        }

        self.status = ParseStatus::Complete;
    }
}

/// Percent-decode a string; `+` becomes a space only in form/query data
#[must_use]
pub fn percent_decode(input: &str, plus_as_space: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|s| u8::from_str_radix(s, 16).ok())
                }) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Parse an `application/x-www-form-urlencoded` string into pairs
#[must_use]
pub fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (
                percent_decode(name, true),
                percent_decode(value, true),
            ),
            None => (percent_decode(pair, true), String::new()),
        })
        .collect()
}

fn extract_boundary(content_type: &str) -> Option<Vec<u8>> {
    for param in content_type.split(';') {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return Some(value.as_bytes().to_vec());
            }
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split a multipart/form-data body into parts.
///
/// Returns `None` if the framing is malformed; unparseable individual parts
/// are skipped.
fn parse_multipart(body: &[u8], boundary: &[u8]) -> Option<Vec<Part>> {
    let mut delimiter = Vec::with_capacity(boundary.len() + 2);
    delimiter.extend_from_slice(b"--");
    delimiter.extend_from_slice(boundary);

    let first = find_subslice(body, &delimiter)?;
    let mut rest = &body[first + delimiter.len()..];
    let mut parts = Vec::new();

    loop {
        if rest.starts_with(b"--") {
            break;
        }
        rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);

        let end = find_subslice(rest, &delimiter)?;
        let raw_part = &rest[..end];
        rest = &rest[end + delimiter.len()..];

        // Part data is separated from its headers by an empty line and ends
        // with the CRLF that precedes the next delimiter.
        let Some(split) = find_subslice(raw_part, b"\r\n\r\n") else {
            continue;
        };
        let header_block = &raw_part[..split];
        let data = raw_part[split + 4..]
            .strip_suffix(b"\r\n")
            .unwrap_or(&raw_part[split + 4..]);

        if let Some(part) = parse_part(header_block, data) {
            parts.push(part);
        }
    }

    Some(parts)
}

fn parse_part(header_block: &[u8], data: &[u8]) -> Option<Part> {
    let headers = String::from_utf8_lossy(header_block);
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;

    for line in headers.split("\r\n") {
        let Some((header_name, value)) = line.split_once(':') else {
            continue;
        };
        let header_name = header_name.trim();
        let value = value.trim();

        if header_name.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';') {
                let param = param.trim();
                if let Some(v) = param.strip_prefix("name=") {
                    name = Some(v.trim_matches('"').to_string());
                } else if let Some(v) = param.strip_prefix("filename=") {
                    filename = Some(v.trim_matches('"').to_string());
                }
            }
        } else if header_name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        }
    }

    Some(Part {
        name: name?,
        filename,
        content_type,
        data: data.to_vec(),
    })
}
