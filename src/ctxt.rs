//! # Task execution context
//!
//! Each task body receives a [`TaskRunCtxt`]: the per-task environment,
//! a subprocess launcher that merges stdout+stderr into a log file in the
//! rundir, marker collection, and the cooperative cancellation token.
//!
//! A jobserver token is held for the duration of every subprocess spawned
//! through [`TaskRunCtxt::exec`]; the scheduler slot alone is never enough
//! to launch user work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::data::merge_env;
use crate::errors::{DfmError, Marker, Result, Severity, SrcLoc};
use crate::jobserver::Jobserver;

/// SIGTERM -> SIGKILL grace period on cancellation
const KILL_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// CANCELLATION
// ============================================================================

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation token observed by the scheduler and by
/// subprocess supervision.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let fut = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        fut.await;
    }
}

// ============================================================================
// RUN CONTEXT
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ExecInfo {
    pub cmd: Vec<String>,
    pub status: i32,
}

pub struct TaskRunCtxt {
    pub name: String,
    pub srcdir: PathBuf,
    pub rundir: PathBuf,
    /// Merged environment for subprocesses
    pub env: HashMap<String, String>,
    jobserver: Option<Arc<Jobserver>>,
    cancel: CancelToken,
    markers: Mutex<Vec<Marker>>,
    exec_info: Mutex<Vec<ExecInfo>>,
}

impl TaskRunCtxt {
    pub fn new(
        name: impl Into<String>,
        srcdir: PathBuf,
        rundir: PathBuf,
        base_env: &HashMap<String, String>,
        env_inputs: &[crate::data::DataItem],
        jobserver: Option<Arc<Jobserver>>,
        cancel: CancelToken,
    ) -> Self {
        let name = name.into();
        let makeflags = jobserver.as_ref().map(|js| js.makeflags());
        let env = merge_env(base_env, env_inputs, &srcdir, &rundir, makeflags.as_deref());
        Self {
            name,
            srcdir,
            rundir,
            env,
            jobserver,
            cancel,
            markers: Mutex::new(Vec::new()),
            exec_info: Mutex::new(Vec::new()),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ------------------------------------------------------------------------
    // Subprocess execution
    // ------------------------------------------------------------------------

    /// Execute a command as part of the task's implementation. Output goes
    /// to `logfile` (default `cmd_<n>.log`) in the rundir, stdout and
    /// stderr merged. A non-zero exit adds an error marker and is also
    /// returned as the status.
    pub async fn exec(&self, cmd: &[String], logfile: Option<&str>) -> Result<i32> {
        if cmd.is_empty() {
            return Err(DfmError::schema("exec requires a command"));
        }
        let n = self.exec_info.lock().unwrap().len() + 1;
        let logname = logfile
            .map(String::from)
            .unwrap_or_else(|| format!("cmd_{}.log", n));
        let logpath = self.rundir.join(&logname);

        let status = self
            .spawn_supervised(&cmd[0], &cmd[1..], &logpath, &self.rundir)
            .await?;

        self.exec_info.lock().unwrap().push(ExecInfo {
            cmd: cmd.to_vec(),
            status,
        });
        if status != 0 {
            self.error(format!("Command failed: {}", cmd.join(" ")));
        }
        Ok(status)
    }

    /// Run a shell task body. Multiline bodies are written to
    /// `<rundir>/<taskname>_cmd.sh` with a shebang and executable bit;
    /// single-line bodies are passed to the shell directly. Stdout and
    /// stderr merge into `<rundir>/<taskname>.log`.
    pub async fn run_shell_body(&self, body: &str, shell: &str) -> Result<i32> {
        let shortname = self.name.rsplit('.').next().unwrap_or(&self.name);
        let logpath = self.rundir.join(format!("{}.log", shortname));

        let status = if body.contains('\n') {
            let script = self.rundir.join(format!("{}_cmd.sh", shortname));
            let content = format!("#!/usr/bin/env {}\n{}", shell, body);
            std::fs::write(&script, content)
                .map_err(|e| DfmError::io(format!("writing {}", script.display()), e))?;
            let mut perms = std::fs::metadata(&script)
                .map_err(|e| DfmError::io(format!("stat {}", script.display()), e))?
                .permissions();
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms)
                .map_err(|e| DfmError::io(format!("chmod {}", script.display()), e))?;
            self.spawn_supervised(
                &script.to_string_lossy(),
                &[],
                &logpath,
                &self.rundir,
            )
            .await?
        } else {
            self.spawn_supervised(
                shell,
                &["-c".to_string(), body.to_string()],
                &logpath,
                &self.rundir,
            )
            .await?
        };

        if status != 0 {
            self.error(format!("shell task exited with status {}", status));
        }
        Ok(status)
    }

    /// Spawn with jobserver handshake and SIGTERM/SIGKILL escalation on
    /// cancellation.
    async fn spawn_supervised(
        &self,
        program: &str,
        args: &[String],
        logpath: &Path,
        cwd: &Path,
    ) -> Result<i32> {
        // A subprocess needs a jobserver token in addition to the
        // scheduler slot the caller already holds.
        let token_held = match &self.jobserver {
            Some(js) => {
                js.acquire().await?;
                true
            }
            None => false,
        };
        let result = self.spawn_inner(program, args, logpath, cwd).await;
        if token_held {
            if let Some(js) = &self.jobserver {
                js.release();
            }
        }
        result
    }

    async fn spawn_inner(
        &self,
        program: &str,
        args: &[String],
        logpath: &Path,
        cwd: &Path,
    ) -> Result<i32> {
        let log = std::fs::File::create(logpath)
            .map_err(|e| DfmError::io(format!("creating {}", logpath.display()), e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| DfmError::io(format!("cloning {}", logpath.display()), e))?;

        debug!(task = %self.name, program, "spawning subprocess");
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .env_clear()
            .envs(&self.env)
            .current_dir(cwd)
            .stdout(std::process::Stdio::from(log))
            .stderr(std::process::Stdio::from(log_err))
            .spawn()
            .map_err(|e| DfmError::io(format!("spawning '{}'", program), e))?;

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| DfmError::io(format!("waiting for '{}'", program), e))?
            }
            _ = self.cancel.cancelled() => {
                warn!(task = %self.name, "cancelling subprocess");
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(status) => {
                        status.map_err(|e| DfmError::io(format!("waiting for '{}'", program), e))?
                    }
                    Err(_) => {
                        let _ = child.start_kill();
                        child
                            .wait()
                            .await
                            .map_err(|e| DfmError::io(format!("waiting for '{}'", program), e))?
                    }
                }
            }
        };

        Ok(status.code().unwrap_or(-1))
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Create a file in the task's rundir (or at an absolute path)
    pub fn create(&self, path: &str, content: &str) -> Result<()> {
        let path = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.rundir.join(path)
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DfmError::io(format!("creating {}", parent.display()), e))?;
        }
        std::fs::write(&path, content)
            .map_err(|e| DfmError::io(format!("writing {}", path.display()), e))
    }

    pub fn marker(&self, msg: impl Into<String>, severity: Severity, loc: Option<SrcLoc>) {
        self.markers.lock().unwrap().push(Marker {
            msg: msg.into(),
            severity,
            loc,
        });
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.marker(msg, Severity::Error, None);
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.marker(msg, Severity::Info, None);
    }

    pub fn take_markers(&self) -> Vec<Marker> {
        std::mem::take(&mut self.markers.lock().unwrap())
    }

    pub fn exec_info(&self) -> Vec<ExecInfo> {
        self.exec_info.lock().unwrap().clone()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ctxt(rundir: &Path) -> TaskRunCtxt {
        TaskRunCtxt::new(
            "p.t",
            rundir.to_path_buf(),
            rundir.to_path_buf(),
            &std::env::vars().collect(),
            &[],
            None,
            CancelToken::new(),
        )
    }

    #[tokio::test]
    async fn test_exec_writes_merged_log() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctxt(dir.path());
        let status = c
            .exec(
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    "echo out; echo err 1>&2".to_string(),
                ],
                Some("t.log"),
            )
            .await
            .unwrap();
        assert_eq!(status, 0);
        let log = std::fs::read_to_string(dir.path().join("t.log")).unwrap();
        assert!(log.contains("out"));
        assert!(log.contains("err"));
    }

    #[tokio::test]
    async fn test_exec_failure_adds_marker() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctxt(dir.path());
        let status = c
            .exec(&["sh".to_string(), "-c".to_string(), "exit 4".to_string()], None)
            .await
            .unwrap();
        assert_eq!(status, 4);
        let markers = c.take_markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_run_shell_body_single_line() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctxt(dir.path());
        let status = c.run_shell_body("echo single > out.txt", "sh").await.unwrap();
        assert_eq!(status, 0);
        assert!(dir.path().join("out.txt").exists());
        assert!(dir.path().join("t.log").exists());
        // Single-line bodies are not written to a script file
        assert!(!dir.path().join("t_cmd.sh").exists());
    }

    #[tokio::test]
    async fn test_run_shell_body_multiline_script() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctxt(dir.path());
        let status = c
            .run_shell_body("echo one\necho two\n", "bash")
            .await
            .unwrap();
        assert_eq!(status, 0);
        let script = std::fs::read_to_string(dir.path().join("t_cmd.sh")).unwrap();
        assert!(script.starts_with("#!/usr/bin/env bash"));
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join("t_cmd.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[tokio::test]
    async fn test_cancel_terminates_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctxt(dir.path());
        let cancel = c.cancel_token();
        let start = std::time::Instant::now();
        let handle = tokio::spawn(async move {
            c.exec(
                &["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
                None,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let status = handle.await.unwrap().unwrap();
        assert_ne!(status, 0);
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn test_create_relative_file() {
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let c = ctxt(dir.path());
        c.create("sub/file.txt", "content").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sub/file.txt")).unwrap(),
            "content"
        );
    }
}
