use std::io::{Read, Seek, SeekFrom};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;

use cvd_shared::constants::boot_markers;
use cvd_shared::errors::{CvdError, CvdResult};
use cvd_shared::protocol::BootStatus;

use super::SupervisorEvent;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Send the boot outcome byte to the dispatcher's monitor socket.
pub fn send_boot_status(socket_path: &Path, status: BootStatus) -> CvdResult<()> {
    let socket = UnixDatagram::unbound()
        .map_err(|e| CvdError::Io(format!("failed to create datagram socket: {e}")))?;
    socket
        .send_to(&[status.as_byte()], socket_path)
        .map_err(|e| {
            CvdError::Io(format!(
                "failed to send boot status to {}: {e}",
                socket_path.display()
            ))
        })?;
    tracing::info!(socket = %socket_path.display(), ?status, "Reported boot status");
    Ok(())
}

/// Follows each instance's kernel log for the boot markers and posts one
/// [`SupervisorEvent::Boot`] per instance.
pub struct BootWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

struct WatchedLog {
    instance_id: u32,
    path: PathBuf,
    offset: u64,
    /// Unterminated tail of the last read.
    partial: String,
}

impl BootWatcher {
    pub fn spawn(logs: Vec<(u32, PathBuf)>, events: Sender<SupervisorEvent>) -> CvdResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let mut watched: Vec<WatchedLog> = logs
            .into_iter()
            .map(|(instance_id, path)| WatchedLog {
                instance_id,
                path,
                offset: 0,
                partial: String::new(),
            })
            .collect();

        let thread = std::thread::Builder::new()
            .name("cvd-boot-watcher".to_string())
            .spawn(move || {
                while !watched.is_empty() && !thread_stop.load(Ordering::Relaxed) {
                    let mut index = 0;
                    while index < watched.len() {
                        match scan(&mut watched[index]) {
                            Some(status) => {
                                let log = watched.remove(index);
                                let event = SupervisorEvent::Boot {
                                    instance_id: log.instance_id,
                                    status,
                                };
                                if events.send(event).is_err() {
                                    return;
                                }
                            }
                            None => index += 1,
                        }
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            })
            .map_err(|e| CvdError::Internal(format!("failed to start boot watcher: {e}")))?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BootWatcher {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// Read what was appended since the last scan and look for a marker.
fn scan(log: &mut WatchedLog) -> Option<BootStatus> {
    let mut file = std::fs::File::open(&log.path).ok()?;
    let len = file.metadata().ok()?.len();
    if len < log.offset {
        // Truncated or replaced: start over.
        log.offset = 0;
        log.partial.clear();
    }
    if len == log.offset {
        return None;
    }

    file.seek(SeekFrom::Start(log.offset)).ok()?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).ok()?;
    log.offset += bytes.len() as u64;

    log.partial.push_str(&String::from_utf8_lossy(&bytes));
    let mut found = None;
    let complete_up_to = log.partial.rfind('\n').map(|i| i + 1).unwrap_or(0);
    for line in log.partial[..complete_up_to].lines() {
        if line.contains(boot_markers::BOOT_FAILED) {
            found = Some(BootStatus::Failed);
            break;
        }
        if line.contains(boot_markers::BOOT_COMPLETED) {
            found = Some(BootStatus::Completed);
            break;
        }
    }
    log.partial.drain(..complete_up_to);
    found
}
