// src/http.rs
//! Wire-level tables shared by the parser and the response builder.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }
}

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_NOT_FOUND: u16 = 404;

/// Reason phrase for a status code. Anything unknown is reported as a 400.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        STATUS_OK => "OK",
        STATUS_FORBIDDEN => "Forbidden",
        STATUS_NOT_FOUND => "Not Found",
        _ => "Bad Request",
    }
}

/// Whether `code` has an entry in the status table.
pub fn is_known_status(code: u16) -> bool {
    matches!(
        code,
        STATUS_OK | STATUS_BAD_REQUEST | STATUS_FORBIDDEN | STATUS_NOT_FOUND
    )
}

/// Document served in place of the requested file for an error status.
pub fn error_page(code: u16) -> Option<&'static str> {
    match code {
        STATUS_BAD_REQUEST => Some("/400.html"),
        STATUS_FORBIDDEN => Some("/403.html"),
        STATUS_NOT_FOUND => Some("/404.html"),
        _ => None,
    }
}

/// Content type derived from the path's final suffix, `text/plain` if unknown.
pub fn content_type(path: &str) -> &'static str {
    let file = path.rsplit('/').next().unwrap_or(path);
    let Some(dot) = file.rfind('.') else {
        return "text/plain";
    };
    match &file[dot..] {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}
