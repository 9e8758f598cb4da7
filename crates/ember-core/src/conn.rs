// src/conn.rs
//! Per-connection protocol state: read buffer → request parser → response
//! builder → two-segment gather write.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::auth::UserVerifier;
use crate::buffer::Buffer;
use crate::metrics::ServerStats;
use crate::parser::{HttpRequest, ParseStatus};
use crate::response::HttpResponse;
use crate::syscalls;

/// Level-triggered writes keep looping while more than this many bytes remain.
pub const WRITE_SPIN_THRESHOLD: usize = 10240;

/// State shared by every connection of one server.
pub struct ServerContext {
    pub src_dir: PathBuf,
    pub edge_triggered: bool,
    pub users: Arc<dyn UserVerifier>,
    pub stats: ServerStats,
}

impl ServerContext {
    pub fn new(src_dir: PathBuf, edge_triggered: bool, users: Arc<dyn UserVerifier>) -> Self {
        Self {
            src_dir,
            edge_triggered,
            users,
            stats: ServerStats::new(),
        }
    }
}

pub struct HttpConn {
    fd: RawFd,
    addr: Option<SocketAddr>,
    closed: bool,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    /// Bytes of the mapped file already handed to the kernel.
    file_sent: usize,
    ctx: Arc<ServerContext>,
}

impl HttpConn {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            fd: -1,
            addr: None,
            closed: true,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            file_sent: 0,
            ctx,
        }
    }

    /// Take ownership of an accepted socket.
    pub fn init(&mut self, fd: RawFd, addr: SocketAddr) {
        self.fd = fd;
        self.addr = Some(addr);
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        self.response.unmap_file();
        self.file_sent = 0;
        self.closed = false;
        let live = self.ctx.stats.inc_conn();
        info!("Client[{}]({}) in, live: {}", fd, addr, live);
    }

    /// Release the mapping and the socket. Safe to call more than once.
    pub fn close(&mut self) {
        self.response.unmap_file();
        if self.closed {
            return;
        }
        self.closed = true;
        let live = self.ctx.stats.dec_conn();
        syscalls::close(self.fd);
        match self.addr {
            Some(addr) => info!("Client[{}]({}) quit, live: {}", self.fd, addr, live),
            None => info!("Client[{}] quit, live: {}", self.fd, live),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_keep_alive(&self) -> bool {
        self.response.is_keep_alive()
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Header bytes plus unsent file bytes.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes() + self.response.file_len() - self.file_sent
    }

    /// How many of the two write segments still hold data.
    pub fn pending_segments(&self) -> usize {
        (self.write_buf.readable_bytes() > 0) as usize
            + (self.response.file_len() > self.file_sent) as usize
    }

    /// Drain the socket into the read buffer; edge-triggered connections
    /// read until the kernel has nothing left.
    ///
    /// `Ok(0)` means the peer closed without sending anything new.
    /// `WouldBlock` is only returned when no bytes arrived at all.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    total += n;
                    if !self.ctx.edge_triggered {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    /// Parse what has been read and stage a response.
    ///
    /// Returns `false` when there is no complete request yet.
    pub fn process(&mut self) -> bool {
        self.request.init();
        if self.read_buf.readable_bytes() == 0 {
            return false;
        }

        match self.request.parse(&mut self.read_buf, &*self.ctx.users) {
            ParseStatus::Incomplete => return false,
            ParseStatus::Complete => self.response.init(
                &self.ctx.src_dir,
                self.request.path(),
                self.request.is_keep_alive(),
                None,
            ),
            ParseStatus::Invalid => {
                self.response
                    .init(&self.ctx.src_dir, self.request.path(), false, Some(400))
            }
        }

        self.response.make_response(&mut self.write_buf);
        self.file_sent = 0;
        self.ctx.stats.inc_req();
        debug!(
            "fd {} -> {} {} file {} bytes, {} to write",
            self.fd,
            self.response.code().unwrap_or(0),
            self.response.path(),
            self.response.file_len(),
            self.to_write_bytes()
        );
        true
    }

    /// Send the staged header and file segments with gather writes.
    ///
    /// Unsent suffixes of both segments are kept for the next call.
    /// `WouldBlock` is only returned when nothing could be written.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while self.to_write_bytes() > 0 {
            let (head_len, res) = {
                let head = self.write_buf.peek();
                let file = &self.response.file()[self.file_sent..];
                (head.len(), syscalls::writev(self.fd, &[head, file]))
            };
            let n = match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(e) => return Err(e),
            };

            if n >= head_len {
                self.file_sent += n - head_len;
                if head_len > 0 {
                    self.write_buf.retrieve_all();
                }
            } else {
                self.write_buf.retrieve(n);
            }
            total += n;
            self.ctx.stats.add_bytes(n);

            if !self.ctx.edge_triggered && self.to_write_bytes() <= WRITE_SPIN_THRESHOLD {
                break;
            }
        }
        Ok(total)
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}
