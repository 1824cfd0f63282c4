//! FIFO-backed task IO.
//!
//! containerd's shim writes a task's stdout/stderr into named pipes given
//! at task creation. The read ends are opened here, before the task exists,
//! so the shim's blocking open for writing never waits on us.
//!
//! ```text
//!   /tmp/tau-containerd-logs-XXXX/
//!     <id>-stdout  ◄── shim (writer)      TaskIo (reader) ──┐
//!     <id>-stderr  ◄── shim (writer)      TaskIo (reader) ──┤
//!                                                           ▼
//!                                 copy task: stdout, then stderr
//!                                                           │
//!                                         duplex pipe ──► LogStream
//! ```
//!
//! Dropping the [`LogStream`] aborts the copy task, which closes both FIFO
//! read ends even while the container is silent. Dropping the [`TaskIo`]
//! removes the directory.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf};
use tokio::net::unix::pipe;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::backend::LogStream;
use crate::constants::validate_container_id;
use crate::error::{Error, Result};
use crate::types::ContainerId;

/// Capacity of the in-memory pipe between the copy task and the reader.
const LOG_PIPE_CAPACITY: usize = 64 * 1024;

/// stdout/stderr FIFOs of one task.
#[derive(Debug)]
pub struct TaskIo {
    dir: TempDir,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    /// `None` once handed to a log stream.
    readers: Option<(pipe::Receiver, pipe::Receiver)>,
}

impl TaskIo {
    /// Creates both FIFOs in a private temp directory and opens their read
    /// ends.
    ///
    /// Must be called within a tokio runtime.
    pub fn create(id: &ContainerId) -> Result<Self> {
        validate_container_id(id.as_str()).map_err(|reason| Error::StartFailed {
            id: id.to_string(),
            reason: reason.to_string(),
        })?;

        let dir = tempfile::Builder::new()
            .prefix("tau-containerd-logs-")
            .tempdir()?;
        let stdout_path = dir.path().join(format!("{id}-stdout"));
        let stderr_path = dir.path().join(format!("{id}-stderr"));

        for path in [&stdout_path, &stderr_path] {
            mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
                Error::StartFailed {
                    id: id.to_string(),
                    reason: format!("failed to create FIFO {}: {e}", path.display()),
                }
            })?;
        }

        let stdout = pipe::OpenOptions::new().open_receiver(&stdout_path)?;
        let stderr = pipe::OpenOptions::new().open_receiver(&stderr_path)?;
        debug!("Created task FIFOs in {}", dir.path().display());

        Ok(Self {
            dir,
            stdout_path,
            stderr_path,
            readers: Some((stdout, stderr)),
        })
    }

    #[must_use]
    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    #[must_use]
    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Returns the combined log stream.
    ///
    /// The FIFOs can only be drained once; later calls get an empty stream.
    pub fn take_log_stream(&mut self) -> LogStream {
        match self.readers.take() {
            Some((stdout, stderr)) => sequential_stream(stdout, stderr),
            None => Box::pin(tokio::io::empty()),
        }
    }
}

/// Read half of a log pipe. Dropping it aborts the copy task feeding it.
struct LogReader {
    inner: DuplexStream,
    copy: AbortHandle,
}

impl AsyncRead for LogReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        self.copy.abort();
    }
}

/// Streams `first` to EOF, then `second`, through a duplex pipe.
fn sequential_stream<A, B>(first: A, second: B) -> LogStream
where
    A: AsyncRead + Send + Unpin + 'static,
    B: AsyncRead + Send + Unpin + 'static,
{
    let (mut writer, reader) = tokio::io::duplex(LOG_PIPE_CAPACITY);

    let copy = tokio::spawn(async move {
        let mut combined = first.chain(second);
        match tokio::io::copy(&mut combined, &mut writer).await {
            Ok(n) => debug!("Log copy finished after {} bytes", n),
            Err(e) => debug!("Log copy ended: {}", e),
        }
    });

    Box::pin(LogReader {
        inner: reader,
        copy: copy.abort_handle(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_stream_orders_stdout_first() {
        let stdout: &[u8] = b"out\n";
        let stderr: &[u8] = b"err\n";
        let mut stream = sequential_stream(stdout, stderr);

        let mut logs = String::new();
        stream.read_to_string(&mut logs).await.unwrap();
        assert_eq!(logs, "out\nerr\n");
    }

    #[tokio::test]
    async fn test_fifos_created_and_drained_once() {
        let id = ContainerId::new("tau-test");
        let mut io = TaskIo::create(&id).unwrap();
        assert!(io.stdout_path().starts_with(io.dir()));
        assert!(io
            .dir()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("tau-containerd-logs-"));

        {
            // Writers open and close immediately: both FIFOs hit EOF.
            let _out = std::fs::OpenOptions::new()
                .write(true)
                .open(io.stdout_path())
                .unwrap();
            let _err = std::fs::OpenOptions::new()
                .write(true)
                .open(io.stderr_path())
                .unwrap();
        }

        let mut first = String::new();
        io.take_log_stream()
            .read_to_string(&mut first)
            .await
            .unwrap();
        assert!(first.is_empty());

        let mut second = String::new();
        io.take_log_stream()
            .read_to_string(&mut second)
            .await
            .unwrap();
        assert!(second.is_empty(), "second stream should be empty");

        let dir = io.dir().to_path_buf();
        drop(io);
        assert!(!dir.exists(), "dropping TaskIo should remove the FIFO directory");
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_idle_fifos() {
        use std::io::Write;

        let id = ContainerId::new("tau-idle");
        let mut io = TaskIo::create(&id).unwrap();
        // Held open and never written: the copy task sits on an idle FIFO.
        let mut writer = std::fs::OpenOptions::new()
            .write(true)
            .open(io.stdout_path())
            .unwrap();

        drop(io.take_log_stream());

        let mut closed = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            match writer.write(b"x") {
                Ok(_) => continue,
                Err(e) => {
                    assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe, "unexpected error: {e}");
                    closed = true;
                    break;
                }
            }
        }
        assert!(closed, "the FIFO read end should close once the stream is dropped");
    }

    #[tokio::test]
    async fn test_path_like_id_rejected() {
        let err = TaskIo::create(&ContainerId::new("../escape")).unwrap_err();
        assert!(matches!(err, Error::StartFailed { .. }), "unexpected error: {err}");
    }
}
