//! # GNU Make-compatible POSIX jobserver
//!
//! Coordinates subprocess concurrency across cooperating build processes
//! through a named FIFO holding one ASCII `T` byte per available token.
//! Agents read one byte to acquire a slot and write one byte to release it.
//!
//! Protocol: <https://www.gnu.org/software/make/manual/html_node/POSIX-Jobserver.html>
//!
//! Unlike GNU Make (which writes N-1 tokens and holds an implicit slot),
//! dfm writes N tokens: every subprocess launch acquires explicitly.
//!
//! A single background reader drains the FIFO: it reads one byte per
//! queued waiter, so the FIFO is never polled when nobody is waiting.
//! Tokens read for a waiter that has since been cancelled are written
//! back.

use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::errors::{DfmError, Result};

static MAKEFLAGS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--jobserver-auth=fifo:([^\s]+)").unwrap());

static FIFO_SEQ: AtomicU64 = AtomicU64::new(0);

/// Default acquire timeout
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// RAW FIFO OPS
// ============================================================================

fn mkfifo(path: &Path) -> std::io::Result<()> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| std::io::Error::other("path contains NUL"))?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Open read+write so neither side blocks waiting for a peer
fn open_rw_nonblock(path: &Path) -> std::io::Result<RawFd> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| std::io::Error::other("path contains NUL"))?;
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn read_token(fd: RawFd) -> std::io::Result<bool> {
    let mut byte = 0u8;
    let n = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
    if n == 1 {
        Ok(true)
    } else if n == 0 {
        Ok(false)
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn write_tokens(fd: RawFd, count: usize) -> std::io::Result<usize> {
    let buf = vec![b'T'; count];
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// AsRawFd wrapper for AsyncFd registration; the fd is owned by `Inner`
struct FifoFd(RawFd);

impl AsRawFd for FifoFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

// ============================================================================
// JOBSERVER
// ============================================================================

struct Inner {
    fd: RawFd,
    closed: AtomicBool,
    held: AtomicUsize,
    shutdown: Notify,
}

pub struct Jobserver {
    /// Total slots; `None` when joined from the environment
    nproc: Option<usize>,
    fifo_path: PathBuf,
    owner: bool,
    inner: Arc<Inner>,
    waiters: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl Jobserver {
    /// Create a new token pool with `nproc` slots
    pub fn create(nproc: usize) -> Result<Self> {
        if nproc < 1 {
            return Err(DfmError::schema(format!(
                "jobserver nproc must be >= 1, got {}",
                nproc
            )));
        }
        let fifo_path = Self::generate_fifo_path();
        match mkfifo(&fifo_path) {
            Ok(()) => debug!(path = %fifo_path.display(), "created jobserver FIFO"),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(path = %fifo_path.display(), "FIFO already exists, reusing");
            }
            Err(e) => {
                return Err(DfmError::io(
                    format!("creating FIFO {}", fifo_path.display()),
                    e,
                ))
            }
        }

        let fd = open_rw_nonblock(&fifo_path).map_err(|e| {
            let _ = std::fs::remove_file(&fifo_path);
            DfmError::io(format!("opening FIFO {}", fifo_path.display()), e)
        })?;

        let written = write_tokens(fd, nproc)
            .map_err(|e| DfmError::io("writing jobserver tokens".to_string(), e))?;
        if written != nproc {
            warn!(written, expected = nproc, "short token write");
        }

        info!(nproc, fifo = %fifo_path.display(), "jobserver created");
        Ok(Self::start(Some(nproc), fifo_path, true, fd))
    }

    /// Join an existing pool advertised through `MAKEFLAGS`
    pub fn from_environment() -> Option<Self> {
        let makeflags = std::env::var("MAKEFLAGS").ok()?;
        Self::from_makeflags(&makeflags)
    }

    pub fn from_makeflags(makeflags: &str) -> Option<Self> {
        let caps = MAKEFLAGS_RE.captures(makeflags)?;
        let fifo_path = PathBuf::from(&caps[1]);
        if !fifo_path.exists() {
            warn!(path = %fifo_path.display(), "jobserver FIFO not found");
            return None;
        }
        match open_rw_nonblock(&fifo_path) {
            Ok(fd) => {
                info!(path = %fifo_path.display(), "joined existing jobserver");
                Some(Self::start(None, fifo_path, false, fd))
            }
            Err(e) => {
                warn!(error = %e, "failed to open jobserver FIFO");
                None
            }
        }
    }

    fn start(nproc: Option<usize>, fifo_path: PathBuf, owner: bool, fd: RawFd) -> Self {
        let inner = Arc::new(Inner {
            fd,
            closed: AtomicBool::new(false),
            held: AtomicUsize::new(0),
            shutdown: Notify::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(reader_loop(inner.clone(), rx));
        Self {
            nproc,
            fifo_path,
            owner,
            inner,
            waiters: tx,
        }
    }

    /// `MAKEFLAGS` value for child processes
    pub fn makeflags(&self) -> String {
        format!("--jobserver-auth=fifo:{}", self.fifo_path.display())
    }

    pub fn nproc(&self) -> Option<usize> {
        self.nproc
    }

    pub fn held(&self) -> usize {
        self.inner.held.load(Ordering::SeqCst)
    }

    pub fn fifo_path(&self) -> &Path {
        &self.fifo_path
    }

    /// Acquire one token, waiting up to `timeout`
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DfmError::schema("jobserver is closed"));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters
            .send(tx)
            .map_err(|_| DfmError::schema("jobserver reader stopped"))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                let held = self.inner.held.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(held, "acquired jobserver token");
                Ok(())
            }
            Ok(Err(_)) => Err(DfmError::schema("jobserver closed while waiting")),
            Err(_) => {
                warn!(?timeout, "jobserver acquire timeout");
                Err(DfmError::Timeout(format!(
                    "jobserver acquire after {:?}",
                    timeout
                )))
            }
        }
    }

    pub async fn acquire(&self) -> Result<()> {
        self.acquire_timeout(ACQUIRE_TIMEOUT).await
    }

    /// Return one token to the pool. Honored even while shutting down, to
    /// keep peer processes from deadlocking.
    pub fn release(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            warn!("release on closed jobserver");
            return;
        }
        let held = self.inner.held.load(Ordering::SeqCst);
        if held == 0 {
            warn!("release with no held tokens");
            return;
        }
        match write_tokens(self.inner.fd, 1) {
            Ok(1) => {
                let held = self.inner.held.fetch_sub(1, Ordering::SeqCst) - 1;
                debug!(held, "released jobserver token");
            }
            Ok(n) => warn!(n, "short release write"),
            Err(e) => warn!(error = %e, "error releasing token"),
        }
    }

    /// Stop the reader, return held tokens, close the fd, and unlink the
    /// FIFO if this process created it.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(owner = self.owner, held = self.held(), "closing jobserver");
        self.inner.shutdown.notify_waiters();

        let held = self.inner.held.swap(0, Ordering::SeqCst);
        if held > 0 {
            if let Err(e) = write_tokens(self.inner.fd, held) {
                warn!(error = %e, "failed to return tokens on close");
            }
        }
        unsafe {
            libc::close(self.inner.fd);
        }
        if self.owner {
            if let Err(e) = std::fs::remove_file(&self.fifo_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, "failed to remove FIFO");
                }
            }
        }
    }

    fn generate_fifo_path() -> PathBuf {
        let tmpdir = std::env::var("TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let uniq = FIFO_SEQ.fetch_add(1, Ordering::Relaxed);
        tmpdir.join(format!(
            "dfm-jobserver-{}-{}.fifo",
            std::process::id(),
            uniq
        ))
    }
}

impl Drop for Jobserver {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Jobserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jobserver")
            .field("nproc", &self.nproc)
            .field("fifo", &self.fifo_path)
            .field("held", &self.held())
            .finish()
    }
}

// ============================================================================
// READER TASK
// ============================================================================

/// One byte is read per queued waiter. A token obtained for a cancelled
/// waiter goes back into the FIFO.
async fn reader_loop(inner: Arc<Inner>, mut waiters: mpsc::UnboundedReceiver<oneshot::Sender<()>>) {
    let asyncfd = match AsyncFd::with_interest(FifoFd(inner.fd), Interest::READABLE) {
        Ok(fd) => fd,
        Err(e) => {
            warn!(error = %e, "failed to register jobserver FIFO with reactor");
            return;
        }
    };

    'outer: while let Some(waiter) = waiters.recv().await {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        loop {
            let mut guard = tokio::select! {
                r = asyncfd.readable() => match r {
                    Ok(g) => g,
                    Err(_) => break 'outer,
                },
                _ = inner.shutdown.notified() => break 'outer,
            };
            if inner.closed.load(Ordering::SeqCst) {
                break 'outer;
            }
            match read_token(inner.fd) {
                Ok(true) => {
                    if waiter.send(()).is_err() {
                        // Waiter timed out or was cancelled: defensive return
                        if !inner.closed.load(Ordering::SeqCst) {
                            let _ = write_tokens(inner.fd, 1);
                        }
                    }
                    break;
                }
                Ok(false) => {
                    warn!("jobserver FIFO returned EOF");
                    break 'outer;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                }
                Err(e) => {
                    if !inner.closed.load(Ordering::SeqCst) {
                        warn!(error = %e, "error reading jobserver token");
                    }
                    break 'outer;
                }
            }
        }
    }
    debug!("jobserver reader stopped");
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_acquire_release() {
        let js = Jobserver::create(2).unwrap();
        assert!(js.fifo_path().exists());

        js.acquire().await.unwrap();
        js.acquire().await.unwrap();
        assert_eq!(js.held(), 2);

        // Pool exhausted: a third acquire times out
        let err = js
            .acquire_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DfmError::Timeout(_)));

        js.release();
        assert_eq!(js.held(), 1);
        js.acquire_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(js.held(), 2);

        js.close();
        assert!(!js.fifo_path().exists());
    }

    #[tokio::test]
    async fn test_close_removes_fifo_iff_owner() {
        let js = Jobserver::create(1).unwrap();
        let path = js.fifo_path().to_path_buf();

        let joined = Jobserver::from_makeflags(&js.makeflags()).unwrap();
        assert_eq!(joined.nproc(), None);
        joined.close();
        // Non-owner close leaves the FIFO in place
        assert!(path.exists());

        js.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_token_conservation_across_processes_view() {
        // Owner writes N tokens; a joined peer and the owner between them
        // never hold more than N.
        let js = Jobserver::create(2).unwrap();
        let peer = Jobserver::from_makeflags(&js.makeflags()).unwrap();

        js.acquire().await.unwrap();
        peer.acquire().await.unwrap();
        assert_eq!(js.held() + peer.held(), 2);

        let err = js
            .acquire_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DfmError::Timeout(_)));

        // Peer release unblocks the owner
        peer.release();
        js.acquire_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(js.held(), 2);

        js.close();
        peer.close();
    }

    #[tokio::test]
    async fn test_close_returns_held_tokens() {
        let js = Jobserver::create(2).unwrap();
        let peer = Jobserver::from_makeflags(&js.makeflags()).unwrap();

        peer.acquire().await.unwrap();
        peer.acquire().await.unwrap();
        // Peer shuts down holding both tokens; close returns them
        peer.close();

        js.acquire_timeout(Duration::from_secs(5)).await.unwrap();
        js.acquire_timeout(Duration::from_secs(5)).await.unwrap();
        js.close();
    }

    #[tokio::test]
    async fn test_makeflags_format() {
        let js = Jobserver::create(1).unwrap();
        let mf = js.makeflags();
        assert!(mf.starts_with("--jobserver-auth=fifo:"));
        assert!(mf.contains("dfm-jobserver-"));
        js.close();
    }

    #[tokio::test]
    async fn test_from_makeflags_missing_fifo() {
        assert!(Jobserver::from_makeflags("--jobserver-auth=fifo:/nonexistent/x.fifo").is_none());
        assert!(Jobserver::from_makeflags("-j4").is_none());
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let js = Jobserver::create(1).unwrap();
        js.close();
        assert!(js.acquire_timeout(Duration::from_millis(50)).await.is_err());
    }
}
