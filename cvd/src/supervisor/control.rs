//! Per-instance control socket of the supervisor.
//!
//! One JSON line in, one JSON line out, then the connection is closed.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;

use cvd_shared::errors::{CvdError, CvdResult};
use cvd_shared::protocol::{ControlRequest, ControlResponse};

use super::SupervisorEvent;
use super::monitor::SharedStates;
use crate::instances::InstanceState;

const IO_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ControlServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind `path` (replacing a stale socket) and serve requests for
    /// `instance_id` on a background thread.
    pub fn spawn(
        path: &Path,
        instance_id: u32,
        states: SharedStates,
        events: Sender<SupervisorEvent>,
    ) -> CvdResult<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CvdError::Io(format!(
                    "failed to remove stale socket {}: {e}",
                    path.display()
                )));
            }
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| CvdError::Io(format!("failed to bind {}: {e}", path.display())))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let supervisor_pid = std::process::id();

        let thread = std::thread::Builder::new()
            .name(format!("cvd-control-{instance_id}"))
            .spawn(move || {
                for stream in listener.incoming() {
                    if thread_stop.load(Ordering::Relaxed) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            let ctx = ServeContext {
                                instance_id,
                                supervisor_pid,
                                states: &states,
                                events: &events,
                            };
                            if let Err(e) = serve(stream, &ctx) {
                                tracing::debug!(instance_id, error = %e, "Control request failed");
                            }
                        }
                        Err(e) => tracing::warn!(instance_id, error = %e, "Control accept failed"),
                    }
                }
            })
            .map_err(|e| CvdError::Internal(format!("failed to start control server: {e}")))?;

        tracing::debug!(instance_id, socket = %path.display(), "Control socket listening");
        Ok(Self {
            path: path.to_path_buf(),
            stop,
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Wake the blocking accept.
        let _ = UnixStream::connect(&self.path);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

struct ServeContext<'a> {
    instance_id: u32,
    supervisor_pid: u32,
    states: &'a SharedStates,
    events: &'a Sender<SupervisorEvent>,
}

fn serve(stream: UnixStream, ctx: &ServeContext<'_>) -> CvdResult<()> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let mut line = String::new();
    BufReader::new(&stream).read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
        Ok(ControlRequest::Status) => {
            let state = ctx
                .states
                .lock()
                .ok()
                .and_then(|states| states.get(&ctx.instance_id).copied())
                .unwrap_or(InstanceState::Unknown);
            ControlResponse::Status {
                instance_id: ctx.instance_id,
                state: state.as_str().to_string(),
                supervisor_pid: ctx.supervisor_pid,
            }
        }
        Ok(ControlRequest::Stop) => {
            tracing::info!(instance_id = ctx.instance_id, "Stop requested over control socket");
            let _ = ctx.events.send(SupervisorEvent::Stop {
                reason: "stop requested".to_string(),
            });
            ControlResponse::Stopping
        }
        Err(e) => ControlResponse::Error {
            message: format!("malformed request: {e}"),
        },
    };

    let mut out = serde_json::to_string(&response)?;
    out.push('\n');
    (&stream).write_all(out.as_bytes())?;
    Ok(())
}

/// Send one request to the control socket at `path`.
pub fn request(path: &Path, request: &ControlRequest, timeout: Duration) -> CvdResult<ControlResponse> {
    let stream = UnixStream::connect(path)
        .map_err(|e| CvdError::Io(format!("failed to connect to {}: {e}", path.display())))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    (&stream).write_all(line.as_bytes())?;

    let mut reply = String::new();
    BufReader::new(&stream).read_line(&mut reply)?;
    if reply.trim().is_empty() {
        return Err(CvdError::Io(format!(
            "control socket {} closed without a reply",
            path.display()
        )));
    }
    Ok(serde_json::from_str(reply.trim())?)
}
