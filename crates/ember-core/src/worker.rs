// src/worker.rs
//! Worker-side task handling and the completion channel back to the
//! dispatch thread.
//!
//! Workers perform all socket I/O on connections but never touch the
//! multiplexer or the connection table. When a task ends, the worker writes
//! a fixed-size record naming the connection and the interest it needs next;
//! the dispatch thread reads these records and re-arms or closes.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tracing::{debug, error, trace, warn};

use crate::conn::{HttpConn, ServerContext};
use crate::syscalls;

/// Encoded size of one record. Far below PIPE_BUF, so concurrent writers
/// never interleave.
pub const NOTICE_SIZE: usize = 16;

const TAG_READ: u8 = 0;
const TAG_WRITE: u8 = 1;
const TAG_CLOSE: u8 = 2;
const TAG_SHUTDOWN: u8 = 0xff;

/// A live connection as seen by the dispatch thread and the workers.
///
/// `serial` distinguishes successive connections that reuse the same fd.
pub struct ConnHandle {
    pub fd: RawFd,
    pub serial: u64,
    busy: AtomicBool,
    close_requested: AtomicBool,
    conn: Mutex<HttpConn>,
}

impl ConnHandle {
    pub fn new(fd: RawFd, serial: u64, conn: HttpConn) -> Self {
        Self {
            fd,
            serial,
            busy: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            conn: Mutex::new(conn),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, HttpConn> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Close the connection without waiting on a worker.
    ///
    /// Returns `false` when a task holds the connection; that task closes
    /// it as soon as it lets go.
    pub fn request_close(&self) -> bool {
        // Set before trying the lock so a worker releasing it concurrently sees the flag.
        self.close_requested.store(true, Ordering::SeqCst);
        match self.conn.try_lock() {
            Ok(mut conn) => conn.close(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().close(),
            Err(TryLockError::WouldBlock) => return false,
        }
        true
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    Close,
}

pub enum Task {
    Read(Arc<ConnHandle>),
    Write(Arc<ConnHandle>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Done {
        fd: RawFd,
        serial: u64,
        next: Interest,
    },
    Shutdown,
}

impl Notice {
    pub fn encode(&self) -> [u8; NOTICE_SIZE] {
        let mut out = [0u8; NOTICE_SIZE];
        match *self {
            Notice::Done { fd, serial, next } => {
                out[0] = match next {
                    Interest::Read => TAG_READ,
                    Interest::Write => TAG_WRITE,
                    Interest::Close => TAG_CLOSE,
                };
                out[4..8].copy_from_slice(&fd.to_ne_bytes());
                out[8..16].copy_from_slice(&serial.to_ne_bytes());
            }
            Notice::Shutdown => out[0] = TAG_SHUTDOWN,
        }
        out
    }

    pub fn decode(raw: &[u8; NOTICE_SIZE]) -> Option<Self> {
        let mut fd = [0u8; 4];
        fd.copy_from_slice(&raw[4..8]);
        let mut serial = [0u8; 8];
        serial.copy_from_slice(&raw[8..16]);
        let next = match raw[0] {
            TAG_READ => Interest::Read,
            TAG_WRITE => Interest::Write,
            TAG_CLOSE => Interest::Close,
            TAG_SHUTDOWN => return Some(Notice::Shutdown),
            _ => return None,
        };
        Some(Notice::Done {
            fd: RawFd::from_ne_bytes(fd),
            serial: u64::from_ne_bytes(serial),
            next,
        })
    }
}

/// Sending half of the completion channel. Closes the write end on drop.
pub struct Notifier {
    fd: RawFd,
}

impl Notifier {
    pub fn send(&self, notice: Notice) -> io::Result<()> {
        let record = notice.encode();
        loop {
            match syscalls::write(self.fd, &record) {
                Ok(n) if n == NOTICE_SIZE => return Ok(()),
                Ok(n) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short notice write: {} bytes", n),
                    ));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        syscalls::close(self.fd);
    }
}

/// Receiving half, owned by the dispatch thread.
pub struct NoticeReceiver {
    fd: RawFd,
    pending: Vec<u8>,
}

impl NoticeReceiver {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Read every record currently in the pipe into `out`.
    pub fn drain(&mut self, out: &mut Vec<Notice>) -> io::Result<()> {
        let mut chunk = [0u8; NOTICE_SIZE * 64];
        loop {
            match syscalls::read(self.fd, &mut chunk) {
                Ok(0) => break,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        let whole = self.pending.len() - self.pending.len() % NOTICE_SIZE;
        for raw in self.pending[..whole].chunks_exact(NOTICE_SIZE) {
            let mut record = [0u8; NOTICE_SIZE];
            record.copy_from_slice(raw);
            match Notice::decode(&record) {
                Some(notice) => out.push(notice),
                None => warn!("dropping malformed completion record"),
            }
        }
        self.pending.drain(..whole);
        Ok(())
    }

    /// Close the read end. Later sends fail instead of blocking.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            syscalls::close(self.fd);
            self.fd = -1;
        }
    }
}

impl Drop for NoticeReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn completion_channel() -> io::Result<(NoticeReceiver, Arc<Notifier>)> {
    let (rd, wr) = syscalls::create_pipe()?;
    Ok((
        NoticeReceiver {
            fd: rd,
            pending: Vec::with_capacity(NOTICE_SIZE * 64),
        },
        Arc::new(Notifier { fd: wr }),
    ))
}

/// Run one task on a worker thread and report the connection's next interest.
pub fn handle_task(task: Task, notifier: &Notifier, ctx: &ServerContext) {
    let (handle, readable) = match task {
        Task::Read(handle) => (handle, true),
        Task::Write(handle) => (handle, false),
    };

    if handle.busy.swap(true, Ordering::AcqRel) {
        ctx.stats.inc_overlap();
        error!("fd {} dispatched while another task holds it", handle.fd);
    }
    let next = {
        let mut conn = handle.lock();
        if conn.is_closed() {
            handle.busy.store(false, Ordering::Release);
            trace!("fd {} closed before its task ran", handle.fd);
            return;
        }
        if readable {
            on_read(&mut conn)
        } else {
            on_write(&mut conn)
        }
    };
    handle.busy.store(false, Ordering::Release);

    if handle.is_close_requested() {
        debug!("fd {} evicted mid-task, closing", handle.fd);
        handle.lock().close();
        return;
    }

    let notice = Notice::Done {
        fd: handle.fd,
        serial: handle.serial,
        next,
    };
    if let Err(e) = notifier.send(notice) {
        warn!("completion for fd {} lost: {}", handle.fd, e);
    }
}

fn on_read(conn: &mut HttpConn) -> Interest {
    match conn.read() {
        Ok(0) => Interest::Close,
        Ok(_) => on_process(conn),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => on_process(conn),
        Err(e) => {
            debug!("read on fd {} failed: {}", conn.fd(), e);
            Interest::Close
        }
    }
}

fn on_process(conn: &mut HttpConn) -> Interest {
    if conn.process() {
        Interest::Write
    } else {
        Interest::Read
    }
}

fn on_write(conn: &mut HttpConn) -> Interest {
    let res = conn.write();
    if conn.to_write_bytes() == 0 {
        if conn.is_keep_alive() {
            return on_process(conn);
        }
        return Interest::Close;
    }
    match res {
        Ok(_) => Interest::Write,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Interest::Write,
        Err(e) => {
            debug!("write on fd {} failed: {}", conn.fd(), e);
            Interest::Close
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PooledVerifier;
    use std::fs::{self, Permissions};
    use std::net::SocketAddr;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_notice_encoding() {
        let done = Notice::Done {
            fd: 42,
            serial: u64::MAX - 7,
            next: Interest::Write,
        };
        assert_eq!(Notice::decode(&done.encode()), Some(done));
        assert_eq!(Notice::decode(&Notice::Shutdown.encode()), Some(Notice::Shutdown));

        let mut junk = [0u8; NOTICE_SIZE];
        junk[0] = 9;
        assert_eq!(Notice::decode(&junk), None);
    }

    #[test]
    fn test_channel_carries_records_from_many_threads() {
        let (mut rx, tx) = completion_channel().unwrap();
        let senders: Vec<_> = (0..4)
            .map(|t| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        tx.send(Notice::Done {
                            fd: t,
                            serial: i,
                            next: Interest::Read,
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for s in senders {
            s.join().unwrap();
        }

        let mut out = Vec::new();
        rx.drain(&mut out).unwrap();
        assert_eq!(out.len(), 400);
        for t in 0..4 {
            let serials: Vec<u64> = out
                .iter()
                .filter_map(|n| match n {
                    Notice::Done { fd, serial, .. } if *fd == t => Some(*serial),
                    _ => None,
                })
                .collect();
            assert_eq!(serials, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_send_fails_after_receiver_closed() {
        let (mut rx, tx) = completion_channel().unwrap();
        rx.close();
        assert!(tx.send(Notice::Shutdown).is_err());
    }

    #[test]
    fn test_task_round_trip_over_socket_pair() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("index.html");
        fs::write(&page, "ok").unwrap();
        fs::set_permissions(&page, Permissions::from_mode(0o644)).unwrap();
        let ctx = Arc::new(ServerContext::new(
            dir.path().to_path_buf(),
            true,
            Arc::new(PooledVerifier::in_memory(1)),
        ));
        let (server_fd, client_fd) = syscalls::socket_pair().unwrap();
        let mut conn = HttpConn::new(ctx.clone());
        conn.init(server_fd, "127.0.0.1:1".parse::<SocketAddr>().unwrap());
        let handle = Arc::new(ConnHandle::new(server_fd, 7, conn));
        let (mut rx, tx) = completion_channel().unwrap();
        let mut out = Vec::new();

        // Nothing to read yet.
        handle_task(Task::Read(handle.clone()), &tx, &ctx);
        rx.drain(&mut out).unwrap();
        assert_eq!(
            out.pop(),
            Some(Notice::Done { fd: server_fd, serial: 7, next: Interest::Read })
        );

        syscalls::write(client_fd, b"GET / HTTP/1.1\r\n\r\n").unwrap();
        handle_task(Task::Read(handle.clone()), &tx, &ctx);
        rx.drain(&mut out).unwrap();
        assert_eq!(
            out.pop(),
            Some(Notice::Done { fd: server_fd, serial: 7, next: Interest::Write })
        );

        // Not keep-alive: a finished write asks for close.
        handle_task(Task::Write(handle.clone()), &tx, &ctx);
        rx.drain(&mut out).unwrap();
        assert_eq!(
            out.pop(),
            Some(Notice::Done { fd: server_fd, serial: 7, next: Interest::Close })
        );
        assert_eq!(ctx.stats.snapshot().overlapping_tasks, 0);

        // A closed connection is skipped without a completion.
        handle.lock().close();
        handle_task(Task::Read(handle), &tx, &ctx);
        rx.drain(&mut out).unwrap();
        assert!(out.is_empty());
        syscalls::close(client_fd);
    }

    fn idle_handle(ctx: &Arc<ServerContext>, serial: u64) -> (Arc<ConnHandle>, RawFd) {
        let (server_fd, client_fd) = syscalls::socket_pair().unwrap();
        let mut conn = HttpConn::new(ctx.clone());
        conn.init(server_fd, "127.0.0.1:2".parse::<SocketAddr>().unwrap());
        (Arc::new(ConnHandle::new(server_fd, serial, conn)), client_fd)
    }

    #[test]
    fn test_request_close_on_idle_connection_closes_now() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ServerContext::new(
            dir.path().to_path_buf(),
            true,
            Arc::new(PooledVerifier::in_memory(1)),
        ));
        let (handle, client_fd) = idle_handle(&ctx, 1);

        assert!(handle.request_close());
        assert!(handle.lock().is_closed());
        assert_eq!(ctx.stats.live(), 0);
        syscalls::close(client_fd);
    }

    #[test]
    fn test_request_close_during_task_is_deferred_to_worker() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ServerContext::new(
            dir.path().to_path_buf(),
            true,
            Arc::new(PooledVerifier::in_memory(1)),
        ));
        let (handle, client_fd) = idle_handle(&ctx, 2);
        let (mut rx, tx) = completion_channel().unwrap();

        // A worker holds the connection: the request must not block.
        let guard = handle.lock();
        assert!(!handle.request_close());
        assert!(!guard.is_closed());
        drop(guard);

        let worker = {
            let handle = handle.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();
            std::thread::spawn(move || handle_task(Task::Read(handle), &tx, &ctx))
        };
        worker.join().unwrap();

        assert!(handle.lock().is_closed());
        assert_eq!(ctx.stats.live(), 0);
        let mut out = Vec::new();
        rx.drain(&mut out).unwrap();
        assert!(out.is_empty());
        syscalls::close(client_fd);
    }
}
