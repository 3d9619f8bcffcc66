//! HTTP subsystem (spec §4.4): an incremental `httparse`-backed parser
//! state machine, a regex-ordered request router, and the WebSocket
//! upgrade path. Per spec.md's Non-goals ("a general HTTP/1.1 server
//! beyond what WHIP signaling requires"), only the WHIP POST route and an
//! optional WebSocket upgrade are wired up by `qrpc-server`; this module
//! itself is a general incremental parser, grounded in
//! `original_source/src/base/http.cpp`/`http.h` (`base::HttpSession`,
//! whose state machine this file's `ParseState` enum names match 1:1, and
//! `base::HttpRouter`, whose `std::regex`-ordered-match-in-insertion-order
//! design this file's `Router` ports using the `regex` crate).

use std::collections::HashMap;

use regex::Regex;

use qrpc_protocol::error::QrpcError;

/// Mirrors `base::HttpSession::State` (`original_source/src/base/http.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RecvHeader,
    RecvBody,
    RecvBodyNoChunk,
    RecvBodyLen,
    RecvFooter,
    RecvComment,
    RecvFinish,
    WebsocketEstablish,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Options,
    Other(String),
}

impl Method {
    fn parse(raw: &str) -> Self {
        match raw {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self.header("upgrade").map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false);
        let connection_has_upgrade = self
            .header("connection")
            .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false);
        upgrade && connection_has_upgrade && self.header("sec-websocket-key").is_some()
    }
}

const INITIAL_BUF_CAPACITY: usize = 4096;
const MAX_HEADERS: usize = 64;

/// Incremental HTTP/1.1 request parser (spec §4.4). Buffer growth is
/// geometric (`reserve` doubles capacity on overflow); consumed bytes are
/// drained from the front after each completed request, which is the
/// "internal pointers are rebased after each growth" rule realized for an
/// owned, contiguous buffer rather than a fixed ring.
pub struct HttpParser {
    buf: Vec<u8>,
    state: ParseState,
    body_target_len: usize,
    pending: Option<HttpRequest>,
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_BUF_CAPACITY),
            state: ParseState::RecvHeader,
            body_target_len: 0,
            pending: None,
        }
    }

    fn grow_if_needed(&mut self, incoming: usize) {
        if self.buf.capacity() < self.buf.len() + incoming {
            let target = (self.buf.capacity().max(INITIAL_BUF_CAPACITY)) * 2;
            self.buf.reserve(target.saturating_sub(self.buf.capacity()));
        }
    }

    /// Feeds newly read bytes. Returns `Ok(Some(request))` once a full
    /// request has been parsed (leaving any trailing bytes buffered for
    /// the next request on a keep-alive connection), `Ok(None)` if more
    /// data is needed, or `Err` on malformed input (`ParseState::Error`).
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<HttpRequest>, QrpcError> {
        self.grow_if_needed(bytes.len());
        self.buf.extend_from_slice(bytes);

        if self.state == ParseState::Error {
            return Err(QrpcError::Invalid("HTTP parser is in ERROR state".to_string()));
        }

        if self.state == ParseState::RecvHeader {
            let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut header_storage);
            let parsed = match req.parse(&self.buf) {
                Ok(httparse::Status::Complete(n)) => n,
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(e) => {
                    self.state = ParseState::Error;
                    return Err(QrpcError::Invalid(format!("malformed HTTP request: {e}")));
                }
            };

            let method = Method::parse(req.method.unwrap_or(""));
            let path = req.path.unwrap_or("/").to_string();
            let mut headers = HashMap::new();
            for h in req.headers.iter() {
                headers.insert(h.name.to_ascii_lowercase(), String::from_utf8_lossy(h.value).into_owned());
            }

            self.buf.drain(..parsed);

            let content_length: usize = headers
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let chunked = headers
                .get("transfer-encoding")
                .map(|v| v.eq_ignore_ascii_case("chunked"))
                .unwrap_or(false);

            self.pending = Some(HttpRequest { method, path, headers, body: Vec::new() });

            if chunked {
                self.state = ParseState::RecvBodyNoChunk;
            } else if content_length > 0 {
                self.state = ParseState::RecvBodyLen;
                self.body_target_len = content_length;
            } else {
                self.state = ParseState::RecvFinish;
            }
        }

        match self.state {
            ParseState::RecvBodyLen => {
                let Some(req) = self.pending.as_mut() else {
                    self.state = ParseState::Error;
                    return Err(QrpcError::Invalid("body received with no pending request".to_string()));
                };
                let need = self.body_target_len.saturating_sub(req.body.len());
                let take = need.min(self.buf.len());
                req.body.extend_from_slice(&self.buf[..take]);
                self.buf.drain(..take);
                if req.body.len() >= self.body_target_len {
                    self.state = ParseState::RecvFinish;
                } else {
                    return Ok(None);
                }
            }
            ParseState::RecvBodyNoChunk => {
                // Chunked decoding: each chunk is `<hex-len>\r\n<bytes>\r\n`,
                // terminated by a zero-length chunk (spec §4.4 RECV_FOOTER).
                loop {
                    let Some(line_end) = find_crlf(&self.buf) else {
                        return Ok(None);
                    };
                    let size_line = String::from_utf8_lossy(&self.buf[..line_end]).to_string();
                    let Ok(chunk_len) = usize::from_str_radix(size_line.trim(), 16) else {
                        self.state = ParseState::Error;
                        return Err(QrpcError::Invalid("malformed chunk size".to_string()));
                    };
                    let chunk_start = line_end + 2;
                    let chunk_end = chunk_start + chunk_len;
                    if self.buf.len() < chunk_end + 2 {
                        return Ok(None);
                    }
                    if chunk_len == 0 {
                        self.buf.drain(..chunk_end + 2);
                        self.state = ParseState::RecvFooter;
                        break;
                    }
                    let Some(req) = self.pending.as_mut() else {
                        self.state = ParseState::Error;
                        return Err(QrpcError::Invalid("body received with no pending request".to_string()));
                    };
                    req.body.extend_from_slice(&self.buf[chunk_start..chunk_end]);
                    self.buf.drain(..chunk_end + 2);
                }
            }
            _ => {}
        }

        if self.state == ParseState::RecvFooter {
            self.state = ParseState::RecvFinish;
        }

        if self.state == ParseState::RecvFinish {
            self.state = ParseState::RecvHeader;
            self.body_target_len = 0;
            return Ok(self.pending.take());
        }

        Ok(None)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Regex-ordered request router (spec §4.4 "a router matches the URL path
/// against registered regex entries in insertion order; the first match
/// wins; unmatched paths reply 404").
pub struct Router<H> {
    routes: Vec<(Method, Regex, H)>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> Router<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&mut self, method: Method, pattern: &str, handler: H) {
        let regex = Regex::new(pattern).expect("route pattern must be a valid regex");
        self.routes.push((method, regex, handler));
    }

    /// First matching entry wins; `None` means an unmatched path (caller
    /// replies 404).
    pub fn resolve(&self, method: &Method, path: &str) -> Option<&H> {
        self.routes
            .iter()
            .find(|(m, re, _)| m == method && re.is_match(path))
            .map(|(_, _, h)| h)
    }
}

/// WHIP's RFC-magic GUID for computing `Sec-WebSocket-Accept` (spec §4.4).
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Base64 of SHA-1 over `client_key + WEBSOCKET_GUID` (spec §4.4 "the HTTP
/// session computes the accept key").
pub fn websocket_accept_key(client_key: &str) -> String {
    use base64::Engine;
    use sha1::{Digest, Sha1};

    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

pub fn websocket_upgrade_response(client_key: &str) -> Vec<u8> {
    let accept = websocket_accept_key(client_key);
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
    .into_bytes()
}

/// WHIP's `201 Created` response (spec §6.1): answer SDP body plus a
/// `Location` header the (optional) `DELETE` teardown targets.
pub fn whip_created_response(answer_sdp: &str, location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 201 Created\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\
         Location: {location}\r\n\r\n\
         {answer_sdp}",
        answer_sdp.len()
    )
    .into_bytes()
}

pub fn not_found_response() -> Vec<u8> {
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()
}

pub fn bad_request_response(message: &str) -> Vec<u8> {
    format!("HTTP/1.1 400 Bad Request\r\nContent-Length: {}\r\n\r\n{message}", message.len()).into_bytes()
}

pub fn no_content_response() -> Vec<u8> {
    b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n".to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_whip_post_with_content_length_body() {
        let mut parser = HttpParser::new();
        let request = b"POST /whip HTTP/1.1\r\nHost: x\r\nContent-Type: application/sdp\r\nContent-Length: 5\r\n\r\nhello";
        let req = parser.push(request).unwrap().expect("complete request");
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path, "/whip");
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn reassembles_a_request_split_across_two_reads() {
        let mut parser = HttpParser::new();
        let full = b"POST /whip HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc".to_vec();
        let mid = full.len() / 2;
        assert!(parser.push(&full[..mid]).unwrap().is_none());
        let req = parser.push(&full[mid..]).unwrap().expect("complete request");
        assert_eq!(req.body, b"abc");
    }

    #[test]
    fn decodes_chunked_transfer_encoding() {
        let mut parser = HttpParser::new();
        let request = b"POST /whip HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n0\r\n\r\n";
        let req = parser.push(request).unwrap().expect("complete request");
        assert_eq!(req.body, b"foo");
    }

    #[test]
    fn parser_resets_for_the_next_request_on_the_same_connection() {
        let mut parser = HttpParser::new();
        let first = b"GET /a HTTP/1.1\r\n\r\n";
        let second = b"GET /b HTTP/1.1\r\n\r\n";
        let r1 = parser.push(first).unwrap().unwrap();
        assert_eq!(r1.path, "/a");
        let r2 = parser.push(second).unwrap().unwrap();
        assert_eq!(r2.path, "/b");
    }

    #[test]
    fn router_first_match_wins_and_unmatched_path_is_none() {
        let mut router: Router<&'static str> = Router::new();
        router.route(Method::Post, "^/whip$", "whip");
        router.route(Method::Post, "^/whip.*", "whip-catchall");

        assert_eq!(router.resolve(&Method::Post, "/whip"), Some(&"whip"));
        assert_eq!(router.resolve(&Method::Get, "/whip"), None);
        assert_eq!(router.resolve(&Method::Post, "/other"), None);
    }

    #[test]
    fn websocket_accept_key_matches_the_rfc_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(websocket_accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn upgrade_is_detected_only_with_all_three_headers() {
        let mut headers = HashMap::new();
        headers.insert("upgrade".to_string(), "websocket".to_string());
        headers.insert("connection".to_string(), "keep-alive, Upgrade".to_string());
        headers.insert("sec-websocket-key".to_string(), "abc".to_string());
        let req = HttpRequest { method: Method::Get, path: "/ws".to_string(), headers, body: Vec::new() };
        assert!(req.is_websocket_upgrade());

        let mut missing_key = req.clone();
        missing_key.headers.remove("sec-websocket-key");
        assert!(!missing_key.is_websocket_upgrade());
    }
}
