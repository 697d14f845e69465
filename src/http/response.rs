//! HTTP response writer with automatic body framing

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::server::connection::SocketGate;
use crate::{Result, WharfError};

use super::cookie::Cookie;
use super::headers::HeaderMap;

/// How the end of the response body is signalled to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// Not yet decided (no body bytes written)
    Undecided,
    /// `Content-Length` header with a fixed byte count
    ContentLength,
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// No length framing; the connection closes after the body
    CloseDelimited,
}

#[derive(Debug)]
struct ResponseState {
    status_code: u16,
    status_text: String,
    headers: HeaderMap,
    cookies: BTreeMap<String, Cookie>,
    headers_sent: bool,
    last_part_sent: bool,
    mode: FramingMode,
}

/// HTTP response under construction.
///
/// The response is a shared handle: the connection that created it and the
/// request handler hold clones of the same state. Status, headers and
/// cookies buffer up until the first call to [`write`](Self::write), which
/// picks the framing mode and emits the header block. All socket output
/// travels through the connection's own task, so a response may be written
/// from any task.
#[derive(Clone)]
pub struct Response {
    state: Arc<Mutex<ResponseState>>,
    gate: SocketGate,
}

impl Response {
    pub(crate) fn new(gate: SocketGate) -> Self {
        Self {
            state: Arc::new(Mutex::new(ResponseState {
                status_code: 200,
                status_text: "OK".to_string(),
                headers: HeaderMap::new(),
                cookies: BTreeMap::new(),
                headers_sent: false,
                last_part_sent: false,
                mode: FramingMode::Undecided,
            })),
            gate,
        }
    }

    fn state(&self) -> MutexGuard<'_, ResponseState> {
        self.state.lock().expect("response state lock poisoned")
    }

    /// Set the status line.
    ///
    /// # Panics
    ///
    /// Panics if the headers have already been sent (programming error).
    pub fn set_status(&self, status_code: u16, status_text: impl Into<String>) {
        let mut state = self.state();
        assert!(!state.headers_sent, "status changed after headers were sent");
        state.status_code = status_code;
        state.status_text = status_text.into();
    }

    /// Set a header field, replacing any previous value.
    ///
    /// # Panics
    ///
    /// Panics if the headers have already been sent (programming error).
    pub fn set_header(&self, name: &str, value: impl Into<String>) {
        let mut state = self.state();
        assert!(!state.headers_sent, "header set after headers were sent");
        state.headers.set(name, value);
    }

    /// Set a cookie. Cookies are keyed by name; setting the same name twice
    /// replaces the first cookie.
    ///
    /// # Panics
    ///
    /// Panics if the headers have already been sent (programming error).
    pub fn set_cookie(&self, cookie: Cookie) {
        let mut state = self.state();
        assert!(!state.headers_sent, "cookie set after headers were sent");
        if !cookie.name().is_empty() {
            state.cookies.insert(cookie.name().to_string(), cookie);
        }
    }

    /// Current status code
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.state().status_code
    }

    /// First value of the given header, if set
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.state().headers.get(name).map(str::to_string)
    }

    /// Value of the cookie with the given name, if one was set
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.state()
            .cookies
            .get(name)
            .map(|c| c.value().to_string())
    }

    /// Whether the final part of the body has been written
    #[must_use]
    pub fn has_sent_last_part(&self) -> bool {
        self.state().last_part_sent
    }

    /// Framing mode chosen at the first write
    #[must_use]
    pub fn framing_mode(&self) -> FramingMode {
        self.state().mode
    }

    /// Write a part of the response body.
    ///
    /// The first call decides the framing: `last = true` on the first call
    /// selects Content-Length framing, a `Connection: close` header selects
    /// close-delimited framing, everything else streams chunked. With
    /// `last = true` the body is terminated and the socket flushed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection has been closed.
    pub async fn write(&self, data: &[u8], last: bool) -> Result<()> {
        let (bytes, flush) = self.encode_write(data, last);
        self.gate.submit(bytes, flush).await?;
        Ok(())
    }

    /// Respond with a `303 See Other` redirect to the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection has been closed.
    pub async fn redirect(&self, url: &str) -> Result<()> {
        self.set_status(303, "See Other");
        self.set_header("Location", url);
        self.write(b"Redirect", true).await
    }

    /// Serialize a value as JSON and write it as the complete body.
    ///
    /// Sets `Content-Type: application/json` unless a content type was
    /// already chosen.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the connection has been
    /// closed.
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)
            .map_err(|e| WharfError::Other(format!("JSON serialization failed: {e}")))?;
        {
            let mut state = self.state();
            if !state.headers_sent && !state.headers.contains("content-type") {
                state.headers.set("Content-Type", "application/json");
            }
        }
        self.write(&body, true).await
    }

    /// Encode a body part into wire bytes, emitting the header block first
    /// when necessary. Returns the bytes and whether a flush is due.
    pub(crate) fn encode_write(&self, data: &[u8], last: bool) -> (Vec<u8>, bool) {
        let mut state = self.state();
        assert!(
            !state.last_part_sent,
            "write after the last part of the response"
        );

        let mut out = Vec::with_capacity(data.len() + 128);

        if !state.headers_sent {
            // The whole response arriving in one call means the total size
            // is known and Content-Length framing applies. Otherwise the
            // connection's close decision picks between close-delimited
            // (no Transfer-Encoding, HTTP/1.0 compatible) and chunked.
            if last {
                state.headers.set("Content-Length", data.len().to_string());
                state.mode = FramingMode::ContentLength;
            } else if state.headers.value_is("connection", "close") {
                state.mode = FramingMode::CloseDelimited;
            } else {
                state.headers.set("Transfer-Encoding", "chunked");
                state.mode = FramingMode::Chunked;
            }

            out.extend_from_slice(b"HTTP/1.1 ");
            out.extend_from_slice(state.status_code.to_string().as_bytes());
            out.push(b' ');
            out.extend_from_slice(state.status_text.as_bytes());
            out.extend_from_slice(b"\r\n");
            for (name, value) in state.headers.iter() {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            for cookie in state.cookies.values() {
                out.extend_from_slice(b"Set-Cookie: ");
                out.extend_from_slice(cookie.to_wire().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
            state.headers_sent = true;
        }

        if !data.is_empty() {
            if state.mode == FramingMode::Chunked {
                out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            } else {
                out.extend_from_slice(data);
            }
        }

        if last {
            if state.mode == FramingMode::Chunked {
                out.extend_from_slice(b"0\r\n\r\n");
            }
            state.last_part_sent = true;
        }

        (out, last)
    }

    /// Whether this response forces the connection to close: either it
    /// carries `Connection: close`, or it ended up without any length
    /// framing, so only closing can signal the end of the body.
    pub(crate) fn requires_close(&self) -> bool {
        let state = self.state();
        state.headers.value_is("connection", "close")
            || !(state.headers.contains("content-length")
                || state.headers.value_is("transfer-encoding", "chunked"))
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Response")
            .field("status_code", &state.status_code)
            .field("headers_sent", &state.headers_sent)
            .field("last_part_sent", &state.last_part_sent)
            .field("mode", &state.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::test_gate;

    #[test]
    fn test_single_write_uses_content_length() {
        let (gate, _rx) = test_gate();
        let response = Response::new(gate);

        let (bytes, flush) = response.encode_write(b"hello", true);
        assert_eq!(
            bytes,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello"
        );
        assert!(flush);
        assert!(response.has_sent_last_part());
        assert_eq!(response.framing_mode(), FramingMode::ContentLength);
    }

    #[test]
    fn test_streaming_uses_chunked() {
        let (gate, _rx) = test_gate();
        let response = Response::new(gate);

        let (head, _) = response.encode_write(b"foo", false);
        assert_eq!(
            head,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n"
        );

        let (tail, flush) = response.encode_write(b"bar", true);
        assert_eq!(tail, b"3\r\nbar\r\n0\r\n\r\n");
        assert!(flush);
        assert_eq!(response.framing_mode(), FramingMode::Chunked);
    }

    #[test]
    fn test_connection_close_uses_close_delimited() {
        let (gate, _rx) = test_gate();
        let response = Response::new(gate);
        response.set_header("Connection", "close");

        let (head, _) = response.encode_write(b"a", false);
        assert_eq!(head, b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\na");

        let (tail, _) = response.encode_write(b"bc", true);
        assert_eq!(tail, b"bc");
        assert_eq!(response.framing_mode(), FramingMode::CloseDelimited);
        assert!(response.requires_close());
    }

    #[test]
    fn test_status_and_headers_emitted() {
        let (gate, _rx) = test_gate();
        let response = Response::new(gate);
        response.set_status(404, "not found");
        response.set_header("Content-Type", "text/plain");

        let (bytes, _) = response.encode_write(b"404 not found", true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 not found\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.ends_with("\r\n\r\n404 not found"));
    }

    #[test]
    fn test_cookies_one_line_per_cookie() {
        let (gate, _rx) = test_gate();
        let response = Response::new(gate);
        response.set_cookie(Cookie::new("b", "2"));
        response.set_cookie(Cookie::new("a", "1"));
        // Same name replaces the earlier cookie
        response.set_cookie(Cookie::new("a", "3"));

        let (bytes, _) = response.encode_write(b"", true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Set-Cookie: a=3; Version=1\r\n"));
        assert!(text.contains("Set-Cookie: b=2; Version=1\r\n"));
        assert_eq!(text.matches("Set-Cookie: a=").count(), 1);
    }

    #[test]
    fn test_empty_last_part_flushes_chunked_framing() {
        let (gate, _rx) = test_gate();
        let response = Response::new(gate);

        let _ = response.encode_write(b"data", false);
        let (tail, _) = response.encode_write(b"", true);
        assert_eq!(tail, b"0\r\n\r\n");
        assert!(response.has_sent_last_part());
    }

    #[test]
    fn test_requires_close_without_framing_headers() {
        let (gate, _rx) = test_gate();
        let response = Response::new(gate);
        // Nothing written yet: neither Content-Length nor chunked present
        assert!(response.requires_close());

        let (_, _) = response.encode_write(b"x", true);
        assert!(!response.requires_close());
    }

    #[test]
    #[should_panic(expected = "header set after headers were sent")]
    fn test_set_header_after_send_panics() {
        let (gate, _rx) = test_gate();
        let response = Response::new(gate);
        let _ = response.encode_write(b"hello", false);
        response.set_header("X-Late", "1");
    }

    #[tokio::test]
    async fn test_redirect() {
        let (gate, mut rx) = test_gate();
        let response = Response::new(gate);

        let handle = tokio::spawn(async move {
            let job = rx.recv().await.unwrap();
            let _ = job.done.send(Ok(()));
            job.bytes
        });

        response.redirect("/elsewhere").await.unwrap();

        let bytes = handle.await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 303 See Other\r\n"));
        assert!(text.contains("Location: /elsewhere\r\n"));
        assert!(text.contains("Content-Length: 8\r\n"));
        assert!(text.ends_with("Redirect"));
    }

    #[tokio::test]
    async fn test_write_json_sets_content_type() {
        let (gate, mut rx) = test_gate();
        let response = Response::new(gate);

        let handle = tokio::spawn(async move {
            let job = rx.recv().await.unwrap();
            let _ = job.done.send(Ok(()));
            job.bytes
        });

        #[derive(Serialize)]
        struct Payload {
            ok: bool,
        }
        response.write_json(&Payload { ok: true }).await.unwrap();

        let bytes = handle.await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.ends_with("{\"ok\":true}"));
    }
}
