// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! Every attempt starts from the front of the read buffer and only consumes
//! bytes once a whole request is available, so a request split across
//! several reads is simply re-parsed when more data arrives.

use std::collections::HashMap;

use memchr::{memchr, memmem};
use tracing::debug;

use crate::auth::UserVerifier;
use crate::buffer::Buffer;
use crate::http::Method;

/// Pages reachable without their `.html` suffix.
const DEFAULT_HTML: [&str; 6] = ["/index", "/register", "/login", "/welcome", "/video", "/picture"];

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Longest line accepted while still waiting for its terminator.
pub const MAX_LINE_LEN: usize = 8192;

/// Largest request line plus header block.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

/// Largest `Content-Length` a request may declare.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request was parsed and its bytes consumed.
    Complete,
    /// More bytes are needed; nothing was consumed.
    Incomplete,
    /// The request line is malformed; the buffer was discarded.
    Invalid,
}

#[derive(Debug)]
pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    post: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            post: HashMap::new(),
        }
    }

    pub fn init(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.post.clear();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Header value by name; an exact match wins over a case-insensitive one.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    /// Decoded form field from a urlencoded POST body.
    pub fn post_field(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
            && self.version == "1.1"
    }

    /// Try to parse one request from the front of `buf`.
    ///
    /// Form submissions to the login and register pages are checked against
    /// `users` while the body is parsed, and the path is rewritten to the
    /// welcome or error page.
    pub fn parse(&mut self, buf: &mut Buffer, users: &dyn UserVerifier) -> ParseStatus {
        self.init();
        let consumed = match self.parse_bytes(buf.peek(), users) {
            Ok(Some(consumed)) => consumed,
            Ok(None) => return ParseStatus::Incomplete,
            Err(()) => {
                buf.retrieve_all();
                return ParseStatus::Invalid;
            }
        };
        buf.retrieve(consumed);
        debug!("[{}] [{}] [{}]", self.method, self.path, self.version);
        ParseStatus::Complete
    }

    /// Returns the number of bytes making up the request, `None` if more
    /// input is needed.
    fn parse_bytes(&mut self, data: &[u8], users: &dyn UserVerifier) -> Result<Option<usize>, ()> {
        let mut pos = 0;
        while self.state != ParseState::Finished {
            let rest = &data[pos..];
            match self.state {
                ParseState::RequestLine => {
                    let Some(end) = find_crlf(rest) else {
                        return if rest.len() > MAX_LINE_LEN { Err(()) } else { Ok(None) };
                    };
                    if !self.parse_request_line(&rest[..end]) {
                        debug!("malformed request line");
                        return Err(());
                    }
                    self.normalize_path();
                    pos += end + 2;
                }
                ParseState::Headers => {
                    let Some(end) = find_crlf(rest) else {
                        return if rest.len() > MAX_LINE_LEN { Err(()) } else { Ok(None) };
                    };
                    if pos + end > MAX_HEAD_LEN {
                        debug!("header block over {} bytes", MAX_HEAD_LEN);
                        return Err(());
                    }
                    self.parse_header(&rest[..end]);
                    // A terminated blank line with nothing after it and no
                    // declared body: the request is done.
                    if rest.len() <= 2 && self.content_length().unwrap_or(0) == 0 {
                        self.state = ParseState::Finished;
                    }
                    pos += end + 2;
                }
                ParseState::Body => {
                    let declared = self.content_length();
                    if declared.is_some_and(|n| n > MAX_BODY_LEN) {
                        debug!("declared body over {} bytes", MAX_BODY_LEN);
                        return Err(());
                    }
                    let len = match declared {
                        Some(n) if rest.len() < n => return Ok(None),
                        Some(n) => n,
                        None => find_crlf(rest).unwrap_or(rest.len()),
                    };
                    self.body.extend_from_slice(&rest[..len]);
                    pos += len;
                    if declared.is_none() && rest.len() >= len + 2 {
                        pos += 2;
                    }
                    self.parse_post(users);
                    self.state = ParseState::Finished;
                }
                ParseState::Finished => unreachable!(),
            }
        }
        Ok(Some(pos))
    }

    fn content_length(&self) -> Option<usize> {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
    }

    // METHOD SP PATH SP "HTTP/" VERSION, with no spaces inside any part.
    fn parse_request_line(&mut self, line: &[u8]) -> bool {
        let Ok(line) = std::str::from_utf8(line) else {
            return false;
        };
        let mut parts = line.splitn(3, ' ');
        let (Some(method), Some(path), Some(rest)) = (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let Some(version) = rest.strip_prefix("HTTP/") else {
            return false;
        };
        if version.contains(' ') {
            return false;
        }
        self.method.push_str(method);
        self.path.push_str(path);
        self.version.push_str(version);
        self.state = ParseState::Headers;
        true
    }

    fn normalize_path(&mut self) {
        if let Some(q) = self.path.find('?') {
            self.path.truncate(q);
        }
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    // `key: value`, a single optional space after the colon. Anything else
    // (including the blank separator line) ends the header block.
    fn parse_header(&mut self, line: &[u8]) {
        let Some(colon) = memchr(b':', line) else {
            self.state = ParseState::Body;
            return;
        };
        let key = String::from_utf8_lossy(&line[..colon]).into_owned();
        let mut value = &line[colon + 1..];
        if value.first() == Some(&b' ') {
            value = &value[1..];
        }
        self.headers
            .insert(key, String::from_utf8_lossy(value).into_owned());
    }

    fn parse_post(&mut self, users: &dyn UserVerifier) {
        if Method::from_bytes(self.method.as_bytes()) != Method::Post {
            return;
        }
        let is_form = self
            .header("Content-Type")
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE));
        if !is_form {
            return;
        }

        self.post = decode_form(&self.body);

        let is_login = match self.path.as_str() {
            "/register.html" => false,
            "/login.html" => true,
            _ => return,
        };
        let name = self.post.get("username").map(String::as_str).unwrap_or("");
        let password = self.post.get("password").map(String::as_str).unwrap_or("");
        self.path = if users.verify_user(name, password, is_login) {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode an `application/x-www-form-urlencoded` body. Repeated keys keep
/// their last value; an undecodable body yields no fields.
pub fn decode_form(body: &[u8]) -> HashMap<String, String> {
    match serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
        Ok(pairs) => pairs.into_iter().collect(),
        Err(e) => {
            debug!("form body not decodable: {}", e);
            HashMap::new()
        }
    }
}

#[inline]
fn find_crlf(data: &[u8]) -> Option<usize> {
    memmem::find(data, b"\r\n")
}
