// src/server.rs
//! The reactor: one dispatch thread multiplexing the listener, every live
//! connection and the worker completion channel.
//!
//! Connection sockets are registered one-shot. After an event is handed to
//! a worker, the fd stays disarmed until the worker's completion record
//! comes back and the dispatch thread re-arms it, so at most one task ever
//! touches a connection at a time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::auth::{PooledVerifier, UserVerifier};
use crate::config::ServerConfig;
use crate::conn::{HttpConn, ServerContext};
use crate::epoll::{DEFAULT_MAX_EVENTS, EPOLLIN, EPOLLOUT, Epoller, HANGUP_MASK};
use crate::error::{EmberError, EmberResult};
use crate::pool::WorkerPool;
use crate::syscalls;
use crate::timer::HeapTimer;
use crate::worker::{self, ConnHandle, Interest, Notice, NoticeReceiver, Notifier, Task};

const BUSY_MESSAGE: &[u8] = b"Server busy!";

/// Stops a running [`Server`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.notifier.send(Notice::Shutdown) {
                warn!("could not wake dispatch thread: {}", e);
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

struct Listener {
    fd: RawFd,
}

impl Drop for Listener {
    fn drop(&mut self) {
        syscalls::close(self.fd);
    }
}

/// State the idle timer's callbacks operate on.
pub struct Dispatch {
    epoller: Epoller,
    conns: HashMap<RawFd, Arc<ConnHandle>>,
    conn_events: u32,
}

impl Dispatch {
    /// Close the connection on `fd` if it is still the one numbered `serial`.
    pub fn close_conn(&mut self, fd: RawFd, serial: u64) {
        match self.conns.get(&fd) {
            Some(handle) if handle.serial == serial => {}
            _ => return,
        }
        if let Some(handle) = self.conns.remove(&fd) {
            if let Err(e) = self.epoller.remove_fd(fd) {
                debug!("epoll remove fd {}: {}", fd, e);
            }
            if !handle.request_close() {
                debug!("fd {} busy, its worker will close it", fd);
            }
        }
    }

    fn serial_of(&self, fd: RawFd) -> Option<u64> {
        self.conns.get(&fd).map(|h| h.serial)
    }

    fn rearm(&self, fd: RawFd, interest: u32) -> std::io::Result<()> {
        self.epoller.modify_fd(fd, interest | self.conn_events)
    }
}

pub struct Server {
    listener: Listener,
    local_addr: SocketAddr,
    listen_edge: bool,
    idle_timeout: Option<Duration>,
    max_connections: usize,
    next_serial: u64,
    timer: HeapTimer<RawFd, Dispatch>,
    dispatch: Dispatch,
    receiver: NoticeReceiver,
    notices: Vec<Notice>,
    pool: WorkerPool<Task>,
    ctx: Arc<ServerContext>,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Bind and register the listener, using an in-memory credential store.
    pub fn bind(config: &ServerConfig) -> EmberResult<Self> {
        let workers = config.worker_threads.max(1);
        Self::with_verifier(config, Arc::new(PooledVerifier::in_memory(workers)))
    }

    pub fn with_verifier(config: &ServerConfig, users: Arc<dyn UserVerifier>) -> EmberResult<Self> {
        config.validate()?;
        let trigger = config.trigger()?;

        let epoller = Epoller::new(DEFAULT_MAX_EVENTS).map_err(EmberError::Poll)?;
        let (receiver, notifier) = worker::completion_channel()?;
        epoller
            .add_fd(receiver.fd(), EPOLLIN)
            .map_err(EmberError::Poll)?;

        let addr = config.server_addr();
        let listener = Listener {
            fd: syscalls::create_listen_socket(addr, config.linger)
                .map_err(|source| EmberError::Bind { addr, source })?,
        };
        let local_addr = syscalls::local_addr(listener.fd)?;
        epoller
            .add_fd(listener.fd, EPOLLIN | trigger.listen_events())
            .map_err(EmberError::Poll)?;

        let ctx = Arc::new(ServerContext::new(
            config.resource_dir.clone(),
            trigger.conn_edge,
            users,
        ));
        let pool = {
            let notifier = notifier.clone();
            let ctx = ctx.clone();
            WorkerPool::new(config.worker_threads, move |task| {
                worker::handle_task(task, &notifier, &ctx)
            })?
        };

        let idle_timeout =
            (config.timeout_ms > 0).then(|| Duration::from_millis(config.timeout_ms as u64));

        info!("========== Server init ==========");
        info!("Listening on {}, linger: {}", local_addr, config.linger);
        info!(
            "Listen mode: {}, conn mode: {}",
            if trigger.listen_edge { "ET" } else { "LT" },
            if trigger.conn_edge { "ET" } else { "LT" }
        );
        info!("Resource dir: {}", config.resource_dir.display());
        info!(
            "Worker threads: {}, max connections: {}, idle timeout: {:?}",
            pool.size(),
            config.max_connections,
            idle_timeout
        );

        Ok(Self {
            listener,
            local_addr,
            listen_edge: trigger.listen_edge,
            idle_timeout,
            max_connections: config.max_connections,
            next_serial: 0,
            timer: HeapTimer::with_capacity(1024),
            dispatch: Dispatch {
                epoller,
                conns: HashMap::new(),
                conn_events: trigger.conn_events(),
            },
            receiver,
            notices: Vec::with_capacity(64),
            pool,
            ctx,
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                notifier,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run the dispatch loop until shut down. Every connection is closed
    /// and the worker pool joined before this returns.
    pub fn start(mut self) -> EmberResult<()> {
        info!("========== Server start ==========");
        let result = self.run();
        self.stop();
        result
    }

    fn run(&mut self) -> EmberResult<()> {
        while !self.shutdown.is_shutdown() {
            let wait = match self.idle_timeout {
                Some(_) => self.timer.next_deadline(&mut self.dispatch),
                None => None,
            };
            let n = self.dispatch.epoller.wait(wait).map_err(EmberError::Poll)?;

            for i in 0..n {
                let fd = self.dispatch.epoller.event_fd(i);
                let events = self.dispatch.epoller.events(i);

                if fd == self.listener.fd {
                    self.deal_listen();
                } else if fd == self.receiver.fd() {
                    self.deal_notices();
                } else if events & HANGUP_MASK != 0 {
                    trace!("fd {} hung up ({:#x})", fd, events);
                    self.close_conn(fd);
                } else if events & EPOLLIN != 0 {
                    self.deal_io(fd, true);
                } else if events & EPOLLOUT != 0 {
                    self.deal_io(fd, false);
                } else {
                    error!("unexpected event {:#x} on fd {}", events, fd);
                }
            }
        }
        Ok(())
    }

    fn deal_listen(&mut self) {
        loop {
            match syscalls::accept_connection(self.listener.fd) {
                Ok(Some((fd, addr))) => {
                    if self.ctx.stats.live() >= self.max_connections {
                        let _ = syscalls::send(fd, BUSY_MESSAGE);
                        syscalls::close(fd);
                        warn!("Clients full, rejected {}", addr);
                    } else {
                        self.add_client(fd, addr);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
            if !self.listen_edge {
                break;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: SocketAddr) {
        let serial = self.next_serial;
        self.next_serial += 1;

        let mut conn = HttpConn::new(self.ctx.clone());
        conn.init(fd, addr);
        self.dispatch
            .conns
            .insert(fd, Arc::new(ConnHandle::new(fd, serial, conn)));

        if let Some(timeout) = self.idle_timeout {
            self.timer.add(
                fd,
                timeout,
                Box::new(move |dispatch: &mut Dispatch| {
                    debug!("fd {} idle, evicting", fd);
                    dispatch.close_conn(fd, serial);
                }),
            );
        }

        let events = EPOLLIN | self.dispatch.conn_events;
        if let Err(e) = self.dispatch.epoller.add_fd(fd, events) {
            warn!("register fd {} failed: {}", fd, e);
            self.close_conn(fd);
        }
    }

    /// Close through the timer when one is armed, so its entry goes with it.
    fn close_conn(&mut self, fd: RawFd) {
        if self.timer.do_work(fd, &mut self.dispatch) {
            return;
        }
        if let Some(serial) = self.dispatch.serial_of(fd) {
            self.dispatch.close_conn(fd, serial);
        }
    }

    fn extend_time(&mut self, fd: RawFd) {
        if let Some(timeout) = self.idle_timeout {
            self.timer.adjust(fd, timeout);
        }
    }

    fn deal_io(&mut self, fd: RawFd, readable: bool) {
        let Some(handle) = self.dispatch.conns.get(&fd).cloned() else {
            trace!("event for unknown fd {}", fd);
            return;
        };
        self.extend_time(fd);
        self.pool.submit(if readable {
            Task::Read(handle)
        } else {
            Task::Write(handle)
        });
    }

    fn deal_notices(&mut self) {
        let mut notices = std::mem::take(&mut self.notices);
        if let Err(e) = self.receiver.drain(&mut notices) {
            error!("completion channel read failed: {}", e);
        }

        for notice in notices.drain(..) {
            let Notice::Done { fd, serial, next } = notice else {
                debug!("shutdown requested");
                continue;
            };
            if self.dispatch.serial_of(fd) != Some(serial) {
                trace!("stale completion for fd {} serial {}", fd, serial);
                continue;
            }
            let rearmed = match next {
                Interest::Read => self.dispatch.rearm(fd, EPOLLIN),
                Interest::Write => self.dispatch.rearm(fd, EPOLLOUT),
                Interest::Close => {
                    self.close_conn(fd);
                    continue;
                }
            };
            if let Err(e) = rearmed {
                warn!("re-arm fd {} failed: {}", fd, e);
                self.close_conn(fd);
            }
        }
        self.notices = notices;
    }

    fn stop(&mut self) {
        info!("========== Server stop ==========");
        // Workers finishing queued tasks must not block on a full channel.
        self.receiver.close();
        self.pool.shutdown();

        self.timer.clear();
        for (fd, handle) in self.dispatch.conns.drain() {
            let _ = self.dispatch.epoller.remove_fd(fd);
            handle.lock().close();
        }
        let stats = self.ctx.stats.snapshot();
        info!(
            "served {} requests, {} bytes sent, {} live",
            stats.req_count, stats.bytes_sent, stats.live_conns
        );
    }
}
