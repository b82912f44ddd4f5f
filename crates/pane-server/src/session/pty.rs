//! PTY-backed shell process using portable-pty.
//!
//! Output is pushed through a bounded channel as [`PtyEvent`]s. A blocking
//! reader thread feeds it, so a slow consumer backpressures the PTY instead
//! of growing memory. A separate waiter thread reaps the child and publishes
//! its exit code; the forwarder task then drains what the reader still has
//! and emits `Exited` exactly once as the final event.

use pane_core::{PaneError, PaneResult, SpawnError, TerminateOutcome};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Size of a single read from the PTY master.
const READ_CHUNK: usize = 8192;

/// Chunks the reader thread may queue ahead of the forwarder.
const OUTPUT_QUEUE: usize = 32;

/// Writes queued for the writer thread before `write` starts waiting.
const INPUT_QUEUE: usize = 64;

/// How long to keep draining output after the child has been reaped.
/// Background jobs can hold the slave side open indefinitely.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Everything needed to start one shell.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

/// Push-based output of a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    /// Last event on the channel.
    Exited(i32),
}

/// A managed PTY child process.
pub struct PtyProcess {
    pid: Option<u32>,
    /// MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    size: Mutex<(u16, u16)>,
    input_tx: mpsc::Sender<Vec<u8>>,
    exit_rx: watch::Receiver<Option<i32>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    resizes: AtomicU64,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

impl PtyProcess {
    /// Spawn a shell on a fresh PTY.
    ///
    /// The returned receiver yields the process output followed by exactly
    /// one [`PtyEvent::Exited`].
    pub async fn spawn(req: SpawnRequest) -> Result<(Self, mpsc::Receiver<PtyEvent>), SpawnError> {
        check_cwd(&req.cwd)?;
        let program = resolve_program(&req.program, &req.env)?;

        let spawned = tokio::task::spawn_blocking(move || open_and_spawn(&req, &program))
            .await
            .map_err(|e| SpawnError::Exec(format!("spawn task failed: {e}")))??;

        let Spawned {
            master,
            reader,
            writer,
            child,
            cols,
            rows,
        } = spawned;

        let pid = child.process_id();
        let killer = child.clone_killer();

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(OUTPUT_QUEUE);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);

        spawn_reader(reader, out_tx);
        spawn_writer(writer, input_rx);
        spawn_waiter(child, exit_tx);
        tokio::spawn(forward_events(out_rx, exit_rx.clone(), events_tx));

        info!(?pid, cols, rows, "PTY spawned");

        Ok((
            Self {
                pid,
                master: Mutex::new(master),
                size: Mutex::new((cols, rows)),
                input_tx,
                exit_rx,
                killer: Mutex::new(killer),
                resizes: AtomicU64::new(0),
            },
            events_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code, once the child has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Queue bytes for the shell's input.
    ///
    /// Only waits for queue space, never for the PTY write itself.
    pub async fn write(&self, data: Vec<u8>) -> PaneResult<()> {
        if self.exit_code().is_some() {
            return Err(PaneError::ProcessNotRunning);
        }
        self.input_tx
            .send(data)
            .await
            .map_err(|_| PaneError::ProcessNotRunning)
    }

    /// Set the kernel window size. Returns `false` when nothing changed.
    pub fn resize(&self, cols: u16, rows: u16) -> PaneResult<bool> {
        let mut size = self
            .size
            .lock()
            .map_err(|_| PaneError::Other("PTY size lock poisoned".into()))?;
        if *size == (cols, rows) {
            return Ok(false);
        }
        let master = self
            .master
            .lock()
            .map_err(|_| PaneError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| PaneError::Other(format!("PTY resize failed: {e}")))?;
        *size = (cols, rows);
        let resizes = self.resizes.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(cols, rows, resizes, "PTY resized");
        Ok(true)
    }

    /// Current window size.
    #[cfg(test)]
    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|s| *s).unwrap_or((0, 0))
    }

    /// Number of window-size changes applied to the kernel.
    #[cfg(test)]
    pub fn resize_count(&self) -> u64 {
        self.resizes.load(Ordering::Relaxed)
    }

    /// Wait until the child is reaped or `timeout` passes.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        let reaped = match tokio::time::timeout(timeout, rx.wait_for(|code| code.is_some())).await
        {
            Ok(Ok(code)) => *code,
            _ => None,
        };
        reaped.or_else(|| self.exit_code())
    }

    /// Hang up the shell, escalating to SIGKILL after `timeout`.
    pub async fn terminate(&self, timeout: Duration) -> TerminateOutcome {
        if self.exit_code().is_some() {
            return TerminateOutcome::AlreadyExited;
        }

        self.hangup();
        if self.wait_exit(timeout).await.is_some() {
            info!(pid = ?self.pid, "process exited after hangup");
            return TerminateOutcome::Graceful;
        }

        warn!(pid = ?self.pid, "process ignored hangup, killing");
        if let Ok(mut killer) = self.killer.lock() {
            if let Err(e) = killer.kill() {
                debug!(error = %e, "child kill failed");
            }
        }
        self.signal_group(Signal::Kill);
        if self.wait_exit(timeout).await.is_some() {
            return TerminateOutcome::Forced;
        }

        warn!(pid = ?self.pid, "process survived SIGKILL, giving up");
        TerminateOutcome::Unreaped { pid: self.pid }
    }

    fn hangup(&self) {
        self.signal_group(Signal::Hangup);
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        let sig = match signal {
            Signal::Hangup => libc::SIGHUP,
            Signal::Kill => libc::SIGKILL,
        };
        // The shell leads its own session, so its pid is also the group id.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
        if rc != 0 {
            trace!(pid, sig, "group signal not delivered");
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: Signal) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.exit_code().is_none() {
            self.hangup();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Hangup,
    Kill,
}

struct Spawned {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    cols: u16,
    rows: u16,
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn open_and_spawn(req: &SpawnRequest, program: &Path) -> Result<Spawned, SpawnError> {
    let pair = native_pty_system()
        .openpty(pty_size(req.cols, req.rows))
        .map_err(|e| SpawnError::OpenPty(e.to_string()))?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(&req.args);
    cmd.cwd(&req.cwd);
    cmd.env("TERM", &req.term);
    for (key, value) in &req.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SpawnError::Exec(e.to_string()))?;
    // The reader only sees EOF once every slave handle is closed.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SpawnError::OpenPty(format!("failed to clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| SpawnError::OpenPty(format!("failed to take PTY writer: {e}")))?;

    Ok(Spawned {
        master: pair.master,
        reader,
        writer,
        child,
        cols: req.cols,
        rows: req.rows,
    })
}

fn check_cwd(cwd: &Path) -> Result<(), SpawnError> {
    match std::fs::metadata(cwd) {
        Ok(meta) if meta.is_dir() => Ok(()),
        _ => Err(SpawnError::InvalidCwd(cwd.to_path_buf())),
    }
}

/// Find the shell executable, honouring a `PATH` override in the request env.
fn resolve_program(program: &str, env: &HashMap<String, String>) -> Result<PathBuf, SpawnError> {
    if program.is_empty() {
        return Err(SpawnError::ShellNotFound(String::new()));
    }

    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(SpawnError::ShellNotFound(program.to_string()))
        };
    }

    let path_var = env
        .get("PATH")
        .map(std::ffi::OsString::from)
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_default();
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
        .ok_or_else(|| SpawnError::ShellNotFound(program.to_string()))
}

fn spawn_reader(mut reader: Box<dyn Read + Send>, out_tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO once the slave side is gone.
                Err(e) => {
                    trace!(error = %e, "PTY read ended");
                    break;
                }
            }
        }
    });
}

fn spawn_writer(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    std::thread::spawn(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                debug!(error = %e, "PTY write failed");
                break;
            }
        }
    });
}

fn spawn_waiter(
    mut child: Box<dyn Child + Send + Sync>,
    exit_tx: watch::Sender<Option<i32>>,
) {
    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => i32::try_from(status.exit_code()).unwrap_or(-1),
            Err(e) => {
                warn!(error = %e, "waiting for child failed");
                -1
            }
        };
        info!(code, "PTY child exited");
        let _ = exit_tx.send(Some(code));
    });
}

/// Merge reader output and the exit code into one ordered event stream.
async fn forward_events(
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    mut exit_rx: watch::Receiver<Option<i32>>,
    events: mpsc::Sender<PtyEvent>,
) {
    let code = loop {
        tokio::select! {
            biased;
            chunk = out_rx.recv() => match chunk {
                Some(bytes) => {
                    if events.send(PtyEvent::Output(bytes)).await.is_err() {
                        return;
                    }
                }
                None => {
                    let code = match exit_rx.wait_for(|c| c.is_some()).await {
                        Ok(code) => (*code).unwrap_or(-1),
                        Err(_) => -1,
                    };
                    break code;
                }
            },
            changed = exit_rx.changed() => {
                let code = match changed {
                    Ok(()) => *exit_rx.borrow_and_update(),
                    Err(_) => Some(-1),
                };
                if let Some(code) = code {
                    drain_after_exit(&mut out_rx, &events).await;
                    break code;
                }
            }
        }
    };
    let _ = events.send(PtyEvent::Exited(code)).await;
}

async fn drain_after_exit(out_rx: &mut mpsc::Receiver<Vec<u8>>, events: &mpsc::Sender<PtyEvent>) {
    let deadline = tokio::time::Instant::now() + EXIT_DRAIN_GRACE;
    while let Ok(Some(bytes)) = tokio::time::timeout_at(deadline, out_rx.recv()).await {
        if events.send(PtyEvent::Output(bytes)).await.is_err() {
            return;
        }
    }
}
