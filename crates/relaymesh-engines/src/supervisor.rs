//! Process supervision for one tunnel: spawn, watch output, reconnect, terminate

use crate::driver::{EngineDriver, LaunchSpec};
use crate::error::EngineError;
use crate::policy::ReconnectPolicy;
use crate::runtime::{EngineStatus, LineSignal, RuntimeEvent, RuntimeState};
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// In-memory handle for one tunnel, owned by its adapter
pub(crate) struct RuntimeHandle {
    pub state: RuntimeState,
    pub cancel: CancellationToken,
    pub task: Option<JoinHandle<()>>,
}

pub(crate) type Handles = Arc<RwLock<HashMap<String, RuntimeHandle>>>;

/// Write every config file of `spec`, creating parent directories
pub(crate) async fn write_config_files(spec: &LaunchSpec) -> Result<(), EngineError> {
    for file in &spec.files {
        if let Some(parent) = file.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| EngineError::ConfigWrite {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&file.path, &file.contents)
            .await
            .map_err(|source| EngineError::ConfigWrite {
                path: file.path.clone(),
                source,
            })?;
    }
    Ok(())
}

/// Spawn the external program with piped output
pub(crate) fn launch(spec: &LaunchSpec) -> Result<Child, EngineError> {
    Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| EngineError::SpawnFailure {
            program: spec.program.clone(),
            source,
        })
}

/// Best-effort traffic counters (`rchar`, `wchar`) from `/proc/<pid>/io`
pub(crate) fn read_proc_io(pid: u32) -> Option<(u64, u64)> {
    let contents = std::fs::read_to_string(format!("/proc/{}/io", pid)).ok()?;
    let field = |name: &str| {
        contents
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|value| value.trim().parse::<u64>().ok())
    };
    Some((field("rchar:")?, field("wchar:")?))
}

fn describe_exit(result: std::io::Result<ExitStatus>) -> String {
    match result {
        Ok(status) => match status.code() {
            Some(code) => format!("exit code {}", code),
            None => exit_signal_description(&status),
        },
        Err(e) => format!("wait failed: {}", e),
    }
}

#[cfg(unix)]
fn exit_signal_description(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => format!("terminated by signal {}", signal),
        None => "exited".to_string(),
    }
}

#[cfg(not(unix))]
fn exit_signal_description(_status: &ExitStatus) -> String {
    "exited".to_string()
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(format!("failed to send SIGTERM to pid {}: {}", pid, err)),
    }
}

const READ_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Forward classified output lines until the pipe closes
///
/// Lines are decoded lossily and the pipe is drained to EOF even after a read
/// error or a closed channel; an undrained pipe would SIGPIPE the engine.
async fn pump_lines<R, D>(
    reader: R,
    driver: Arc<D>,
    tx: mpsc::Sender<LineSignal>,
    tunnel_id: String,
) where
    R: AsyncRead + Unpin,
    D: EngineDriver,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut forwarding = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(tunnel_id = %tunnel_id, "Output read error: {}", e);
                sleep(READ_ERROR_PAUSE).await;
                continue;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\r', '\n']);
        debug!(tunnel_id = %tunnel_id, engine = %driver.kind(), "{}", line);

        if forwarding {
            if let Some(signal) = driver.classify(line) {
                forwarding = tx.send(signal).await.is_ok();
            }
        }
    }
}

/// Supervision task for one tunnel process
pub(crate) struct Supervision<D> {
    pub driver: Arc<D>,
    pub handles: Handles,
    pub tunnel_id: String,
    pub spec: LaunchSpec,
    pub policy: ReconnectPolicy,
    pub settle_delay: Duration,
    pub stop_grace: Duration,
    pub cancel: CancellationToken,
}

impl<D: EngineDriver> Supervision<D> {
    pub async fn run(self, mut child: Child) {
        loop {
            let Some(description) = self.watch(&mut child).await else {
                return;
            };

            self.apply(RuntimeEvent::Exited {
                description: EngineError::ExitedUnexpectedly(description).to_string(),
            })
            .await;

            if self.cancel.is_cancelled() {
                return;
            }

            match self.reconnect().await {
                Some(next) => child = next,
                None => return,
            }
        }
    }

    /// Watch a running child until it exits (`Some(description)`) or the
    /// operator stops it (`None`)
    async fn watch(&self, child: &mut Child) -> Option<String> {
        let (tx, mut rx) = mpsc::channel::<LineSignal>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(
                stdout,
                self.driver.clone(),
                tx.clone(),
                self.tunnel_id.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(
                stderr,
                self.driver.clone(),
                tx.clone(),
                self.tunnel_id.clone(),
            ));
        }
        drop(tx);

        let settle = sleep(self.settle_delay);
        tokio::pin!(settle);
        let mut settled = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.terminate(child).await;
                    return None;
                }
                Some(signal) = rx.recv() => {
                    self.apply(RuntimeEvent::Output(signal)).await;
                }
                _ = &mut settle, if !settled => {
                    settled = true;
                    self.apply(RuntimeEvent::Settled).await;
                }
                result = child.wait() => {
                    return Some(describe_exit(result));
                }
            }
        }
    }

    /// Apply the reconnect policy; returns the respawned child, or `None` when
    /// retries are exhausted or the operator stopped the tunnel
    async fn reconnect(&self) -> Option<Child> {
        loop {
            let (retries, last_error) = self.snapshot().await;
            let attempt = retries + 1;

            let Some(delay) = self.policy.delay_for(attempt) else {
                let err = EngineError::MaxRetriesExceeded {
                    tunnel_id: self.tunnel_id.clone(),
                    max_retries: self.policy.max_retries,
                };
                error!(
                    tunnel_id = %self.tunnel_id,
                    engine = %self.driver.kind(),
                    last_error = last_error.as_deref().unwrap_or("unknown"),
                    "{}", err
                );
                self.apply(RuntimeEvent::RetriesExhausted).await;
                self.set_last_error(match last_error {
                    Some(previous) => format!("{}; last error: {}", err, previous),
                    None => err.to_string(),
                })
                .await;
                return None;
            };

            self.apply(RuntimeEvent::RetryScheduled { attempt }).await;
            warn!(
                tunnel_id = %self.tunnel_id,
                engine = %self.driver.kind(),
                attempt,
                max_retries = self.policy.max_retries,
                "Reconnecting in {:?}",
                delay
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.cancel.cancelled() => return None,
            }

            let launched = match write_config_files(&self.spec).await {
                Ok(()) => launch(&self.spec),
                Err(e) => Err(e),
            };

            match launched {
                Ok(child) => {
                    self.apply(RuntimeEvent::Spawned { pid: child.id() }).await;
                    return Some(child);
                }
                Err(e) => {
                    warn!(tunnel_id = %self.tunnel_id, "Respawn failed: {}", e);
                    self.apply(RuntimeEvent::SpawnFailed(e.to_string())).await;
                }
            }
        }
    }

    /// SIGTERM, then SIGKILL once the grace period runs out
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                if let Err(e) = send_sigterm(pid) {
                    warn!(tunnel_id = %self.tunnel_id, "{}", e);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match timeout(self.stop_grace, child.wait()).await {
            Ok(result) => {
                debug!(tunnel_id = %self.tunnel_id, "Process stopped: {}", describe_exit(result));
            }
            Err(_) => {
                warn!(
                    tunnel_id = %self.tunnel_id,
                    "Process did not exit after SIGTERM; escalating to SIGKILL"
                );
                if let Err(e) = child.kill().await {
                    error!(tunnel_id = %self.tunnel_id, "Failed to kill process: {}", e);
                }
            }
        }

        self.apply(RuntimeEvent::Exited {
            description: "stopped by operator".to_string(),
        })
        .await;
    }

    async fn apply(&self, event: RuntimeEvent) {
        let mut handles = self.handles.write().await;
        let Some(handle) = handles.get_mut(&self.tunnel_id) else {
            return;
        };

        let previous = handle.state.status;
        handle.state.apply(&event);

        if self.policy.reset_on_connect && handle.state.status == EngineStatus::Connected {
            handle.state.retries = 0;
        }

        if handle.state.status != previous {
            info!(
                tunnel_id = %self.tunnel_id,
                engine = %self.driver.kind(),
                from = previous.as_str(),
                to = handle.state.status.as_str(),
                "Tunnel status changed"
            );
        }
    }

    async fn snapshot(&self) -> (u32, Option<String>) {
        let handles = self.handles.read().await;
        handles
            .get(&self.tunnel_id)
            .map(|h| (h.state.retries, h.state.last_error.clone()))
            .unwrap_or((0, None))
    }

    async fn set_last_error(&self, message: String) {
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get_mut(&self.tunnel_id) {
            handle.state.last_error = Some(message);
        }
    }
}
