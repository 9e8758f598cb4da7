// src/response.rs
//! Response construction: a header block written into the connection's
//! write buffer plus an optional memory-mapped file sent as a second segment.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use crate::buffer::Buffer;
use crate::http::{self, STATUS_BAD_REQUEST, STATUS_FORBIDDEN, STATUS_NOT_FOUND, STATUS_OK};

const KEEP_ALIVE_PARAMS: &str = "max=6, timeout=120";

#[derive(Debug, Default)]
pub struct HttpResponse {
    /// `None` until resolved against the file system by `make_response`.
    code: Option<u16>,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    file: Option<Mmap>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare for a new response. Passing `code = None` means "serve the
    /// file if possible"; a fixed code skips the file-system checks.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: Option<u16>) {
        self.unmap_file();
        self.code = code;
        self.keep_alive = keep_alive;
        self.path.clear();
        self.path.push_str(path);
        self.src_dir = src_dir.to_path_buf();
    }

    pub fn code(&self) -> Option<u16> {
        self.code
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Path of the document actually served; error pages replace the request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mapped file contents, empty when no file segment is attached.
    pub fn file(&self) -> &[u8] {
        self.file.as_deref().unwrap_or(&[])
    }

    pub fn file_len(&self) -> usize {
        self.file().len()
    }

    /// Release the mapping, if any.
    pub fn unmap_file(&mut self) {
        self.file = None;
    }

    /// Write the status line and headers into `buf` and attach the file
    /// segment, or an inline error body when the file is unusable.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        let mut code = match self.code {
            Some(code) => code,
            None => self.check_target(),
        };
        if !http::is_known_status(code) {
            code = STATUS_BAD_REQUEST;
        }
        self.code = Some(code);
        if let Some(page) = http::error_page(code) {
            self.path.clear();
            self.path.push_str(page);
        }

        self.add_state_line(buf, code);
        self.add_headers(buf);
        self.add_content(buf);
    }

    /// Append a small HTML error body with its `Content-Length` header.
    pub fn error_content(&self, buf: &mut Buffer, message: &str) {
        let code = self.code.unwrap_or(STATUS_BAD_REQUEST);
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>ember</em></body></html>",
            code,
            http::reason_phrase(code),
            message
        );
        buf.append_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        buf.append_str(&body);
    }

    fn full_path(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    fn check_target(&self) -> u16 {
        if self.path.split('/').any(|seg| seg == "..") {
            return STATUS_FORBIDDEN;
        }
        match fs::metadata(self.full_path()) {
            Err(_) => STATUS_NOT_FOUND,
            Ok(meta) if meta.is_dir() => STATUS_NOT_FOUND,
            Ok(meta) if meta.permissions().mode() & libc::S_IROTH == 0 => STATUS_FORBIDDEN,
            Ok(_) => STATUS_OK,
        }
    }

    fn add_state_line(&self, buf: &mut Buffer, code: u16) {
        buf.append_str(&format!("HTTP/1.1 {} {}\r\n", code, http::reason_phrase(code)));
    }

    fn add_headers(&self, buf: &mut Buffer) {
        let mut head = String::with_capacity(96);
        if self.keep_alive {
            let _ = write!(head, "Connection: keep-alive\r\nKeep-Alive: {}\r\n", KEEP_ALIVE_PARAMS);
        } else {
            head.push_str("Connection: close\r\n");
        }
        let _ = write!(head, "Content-Type: {}\r\n", http::content_type(&self.path));
        buf.append_str(&head);
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let full = self.full_path();
        let file = match File::open(&full) {
            Ok(file) => file,
            Err(e) => {
                debug!("open {} failed: {}", full.display(), e);
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        let len = match file.metadata() {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        if len == 0 {
            buf.append_str("Content-Length: 0\r\n\r\n");
            return;
        }

        // SAFETY: the mapping is read-only and dropped before the response
        // is reused; files under the resource root are not truncated while
        // being served.
        match unsafe { Mmap::map(&file) } {
            Ok(map) => {
                buf.append_str(&format!("Content-Length: {}\r\n\r\n", map.len()));
                self.file = Some(map);
            }
            Err(e) => {
                debug!("mmap {} failed: {}", full.display(), e);
                self.error_content(buf, "File NotFound!");
            }
        }
    }
}
