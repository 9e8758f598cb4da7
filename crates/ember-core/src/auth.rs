// src/auth.rs
//! Credential verification for the login and register forms.
//!
//! The server only sees [`UserVerifier`]. Storage sits behind
//! [`CredentialBackend`], whose handles are shared through a fixed-size
//! [`ConnPool`]; each verification checks one handle out for its duration.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("user {0} already exists")]
    Conflict(String),
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// Decides whether a login or register attempt succeeds.
///
/// Called synchronously from worker threads.
pub trait UserVerifier: Send + Sync {
    fn verify_user(&self, name: &str, password: &str, is_login: bool) -> bool;
}

/// One handle onto a credential store.
pub trait CredentialBackend: Send {
    /// Stored password for `name`, if the user exists.
    fn lookup(&mut self, name: &str) -> Result<Option<String>, AuthError>;
    fn insert(&mut self, name: &str, password: &str) -> Result<(), AuthError>;
}

/// Fixed set of backend handles.
pub struct ConnPool<C> {
    free: Mutex<VecDeque<C>>,
    available: Condvar,
    size: usize,
}

impl<C> ConnPool<C> {
    pub fn new(handles: Vec<C>) -> Self {
        let size = handles.len();
        Self {
            free: Mutex::new(handles.into()),
            available: Condvar::new(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_count(&self) -> usize {
        self.lock().len()
    }

    /// Block until a handle is free. The handle goes back to the pool when
    /// the returned guard drops. Returns `None` for an empty pool.
    pub fn checkout(&self) -> Option<PooledConn<'_, C>> {
        if self.size == 0 {
            return None;
        }
        let mut free = self.lock();
        loop {
            if let Some(conn) = free.pop_front() {
                return Some(PooledConn {
                    pool: self,
                    conn: Some(conn),
                });
            }
            free = self
                .available
                .wait(free)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn checkin(&self, conn: C) {
        self.lock().push_back(conn);
        self.available.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<C>> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A checked-out handle, returned to its pool on drop.
pub struct PooledConn<'a, C> {
    pool: &'a ConnPool<C>,
    conn: Option<C>,
}

impl<C> Deref for PooledConn<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<C> DerefMut for PooledConn<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<C> Drop for PooledConn<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

/// Login/register rules over a pool of backend handles.
///
/// Any backend error counts as a failed verification.
pub struct PooledVerifier<B> {
    pool: ConnPool<B>,
}

impl<B: CredentialBackend> PooledVerifier<B> {
    pub fn new(handles: Vec<B>) -> Self {
        Self {
            pool: ConnPool::new(handles),
        }
    }

    pub fn pool(&self) -> &ConnPool<B> {
        &self.pool
    }

    fn check(&self, name: &str, password: &str, is_login: bool) -> Result<bool, AuthError> {
        let mut conn = self
            .pool
            .checkout()
            .ok_or_else(|| AuthError::Unavailable("no backend handles".into()))?;

        let stored = conn.lookup(name)?;
        if is_login {
            return Ok(stored.as_deref() == Some(password));
        }
        if stored.is_some() {
            debug!("register rejected: {} already in use", name);
            return Ok(false);
        }
        conn.insert(name, password)?;
        Ok(true)
    }
}

impl PooledVerifier<MemoryBackend> {
    /// Verifier over a fresh in-process store with `handles` pooled handles.
    pub fn in_memory(handles: usize) -> Self {
        let store = MemoryBackend::new();
        Self::new((0..handles.max(1)).map(|_| store.clone()).collect())
    }
}

impl<B: CredentialBackend> UserVerifier for PooledVerifier<B> {
    fn verify_user(&self, name: &str, password: &str, is_login: bool) -> bool {
        if name.is_empty() || password.is_empty() {
            return false;
        }
        let ok = match self.check(name, password, is_login) {
            Ok(ok) => ok,
            Err(e) => {
                warn!("credential check for {} failed: {}", name, e);
                false
            }
        };
        debug!(
            "verify {} user={} ok={}",
            if is_login { "login" } else { "register" },
            name,
            ok
        );
        ok
    }
}

/// Process-local credential store. Clones share the same table.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    users: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.users.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialBackend for MemoryBackend {
    fn lookup(&mut self, name: &str) -> Result<Option<String>, AuthError> {
        Ok(self.table().get(name).cloned())
    }

    fn insert(&mut self, name: &str, password: &str) -> Result<(), AuthError> {
        let mut users = self.table();
        if users.contains_key(name) {
            return Err(AuthError::Conflict(name.to_string()));
        }
        users.insert(name.to_string(), password.to_string());
        Ok(())
    }
}
