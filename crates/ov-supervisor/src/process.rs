//! OS process helpers: liveness, group signals and output pumping

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::logbuf::LogRing;

/// True if `pid` names a live process. EPERM means it exists under another user.
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send `signal` to the process group led by `pgid`. Ok(false) when the group is gone.
pub fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<bool> {
    send(pgid, signal, true)
}

/// Send `signal` to a single process. Ok(false) when it is gone.
pub fn signal_pid(pid: u32, signal: libc::c_int) -> io::Result<bool> {
    send(pid, signal, false)
}

/// Signal the group, falling back to the lone pid when it leads no group.
pub fn terminate(pid: u32, signal: libc::c_int) -> io::Result<bool> {
    if signal_group(pid, signal)? {
        return Ok(true);
    }
    signal_pid(pid, signal)
}

fn send(id: u32, signal: libc::c_int, group: bool) -> io::Result<bool> {
    let id = libc::pid_t::try_from(id)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if id <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pid <= 0"));
    }
    let target = if group { -id } else { id };
    if unsafe { libc::kill(target, signal) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Where a job's output lines go: the log file and the in-memory ring
pub(crate) struct OutputSink {
    file: Option<tokio::sync::Mutex<File>>,
    ring: Arc<Mutex<LogRing>>,
}

impl OutputSink {
    pub(crate) async fn open(path: &Path, ring: Arc<Mutex<LogRing>>) -> Self {
        let file = match OpenOptions::new().create(true).append(true).open(path).await {
            Ok(file) => Some(tokio::sync::Mutex::new(file)),
            Err(e) => {
                warn!(path = %path.display(), "Could not open job log, keeping memory only: {}", e);
                None
            }
        };
        Self { file, ring }
    }

    async fn write_line(&self, line: String) {
        if let Some(file) = &self.file {
            let mut file = file.lock().await;
            let mut bytes = line.clone().into_bytes();
            bytes.push(b'\n');
            if let Err(e) = async {
                file.write_all(&bytes).await?;
                file.flush().await
            }
            .await
            {
                debug!("Log write failed: {}", e);
            }
        }
        if let Ok(mut ring) = self.ring.lock() {
            ring.push(line);
        }
    }
}

/// Copy `reader` line by line into the sink until EOF.
pub(crate) fn pump<R>(reader: R, sink: Arc<OutputSink>, job_id: String, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    sink.write_line(line).await;
                }
                Err(e) => {
                    debug!(job_id = %job_id, stream, "Output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_alive(pid));
        assert!(!signal_pid(pid, libc::SIGTERM).unwrap());
    }

    #[test]
    fn test_signal_group_kills_group() {
        use std::os::unix::process::CommandExt;

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(signal_group(pid, libc::SIGKILL).unwrap());
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_pump_tees_to_file_and_ring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let ring = Arc::new(Mutex::new(LogRing::new(10)));
        let sink = Arc::new(OutputSink::open(&path, Arc::clone(&ring)).await);

        let input: &[u8] = b"first\nsecond\r\nno newline";
        pump(input, sink, "j".to_string(), "stdout").await.unwrap();

        assert_eq!(
            ring.lock().unwrap().tail(10).unwrap(),
            "first\nsecond\nno newline"
        );
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk, "first\nsecond\nno newline\n");
    }
}
