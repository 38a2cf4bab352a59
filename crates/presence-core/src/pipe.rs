//! Named pipe control channel.
//!
//! External processes write command lines into a FIFO; every non-empty,
//! trimmed line is forwarded to the `request` callback. The reactor waits on
//! [`ControlChannel::readable`] and calls [`ControlChannel::process_event`]
//! once per wakeup, which performs a single bounded read. A line split
//! across reads is held back until its newline arrives.
//!
//! When the last writer closes, the read end sees end-of-file. The channel
//! forwards any unterminated tail, then reopens the FIFO.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use thiserror::Error;
use tokio::net::unix::pipe::{OpenOptions, Receiver};

use crate::handler::Dispatcher;

const TARGET: &str = "presence::pipe";

/// Bytes read per wakeup.
const READ_SIZE: usize = 4096;

/// Longest unterminated line kept between reads.
const MAX_PENDING: usize = 64 * 1024;

/// Control channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Something other than a FIFO exists at the path.
    #[error("{} exists and is not a FIFO", path.display())]
    NotAFifo {
        /// Channel path.
        path: PathBuf,
    },

    /// The FIFO could not be created.
    #[error("cannot create FIFO {}: {source}", path.display())]
    Create {
        /// Channel path.
        path: PathBuf,
        /// OS error.
        #[source]
        source: nix::Error,
    },

    /// The FIFO could not be opened for reading.
    #[error("cannot open FIFO {}: {source}", path.display())]
    Open {
        /// Channel path.
        path: PathBuf,
        /// OS error.
        #[source]
        source: io::Error,
    },

    /// A read failed.
    #[error("FIFO read failed: {0}")]
    Read(#[source] io::Error),
}

/// Read end of the control FIFO.
#[derive(Debug)]
pub struct ControlChannel {
    path: PathBuf,
    receiver: Option<Receiver>,
    dispatcher: Dispatcher,
    buffer: Vec<u8>,
    pending: Vec<u8>,
}

impl ControlChannel {
    /// Create the FIFO if absent and open it non-blocking for reading.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the path holds a non-FIFO file, or the FIFO cannot
    /// be created or opened.
    pub fn open(path: impl Into<PathBuf>, dispatcher: Dispatcher) -> Result<Self, ChannelError> {
        let path = path.into();
        ensure_fifo(&path)?;
        let receiver = open_receiver(&path)?;
        tracing::info!(target: TARGET, path = %path.display(), "listening for pipe requests");
        Ok(Self {
            path,
            receiver: Some(receiver),
            dispatcher,
            buffer: vec![0; READ_SIZE],
            pending: Vec::new(),
        })
    }

    /// FIFO path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` while the read end is open.
    pub const fn is_open(&self) -> bool {
        self.receiver.is_some()
    }

    /// Wait until the FIFO is readable. Never resolves once closed.
    ///
    /// # Errors
    ///
    /// Returns the readiness error from the runtime.
    pub async fn readable(&self) -> io::Result<()> {
        match &self.receiver {
            Some(receiver) => receiver.readable().await,
            None => std::future::pending().await,
        }
    }

    /// Perform one read and forward every line it completes. Returns the
    /// number of commands forwarded.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Read`] on a read failure, or an open error if
    /// reopening after end-of-file fails.
    pub fn process_event(&mut self) -> Result<usize, ChannelError> {
        let Some(receiver) = &self.receiver else {
            return Ok(0);
        };
        let length = match receiver.try_read(&mut self.buffer) {
            Ok(0) => {
                tracing::debug!(target: TARGET, "writer closed, reopening");
                let tail = std::mem::take(&mut self.pending);
                let forwarded = self.forward(&tail);
                self.receiver = None;
                self.receiver = Some(open_receiver(&self.path)?);
                return Ok(forwarded);
            }
            Ok(length) => length,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(err) => return Err(ChannelError::Read(err)),
        };

        self.pending.extend_from_slice(&self.buffer[..length]);
        let Some(end) = self.pending.iter().rposition(|&byte| byte == b'\n') else {
            if self.pending.len() > MAX_PENDING {
                tracing::warn!(target: TARGET, bytes = self.pending.len(), "line too long, dropped");
                self.pending.clear();
            }
            return Ok(0);
        };
        let complete: Vec<u8> = self.pending.drain(..=end).collect();
        Ok(self.forward(&complete))
    }

    fn forward(&self, bytes: &[u8]) -> usize {
        let text = String::from_utf8_lossy(bytes);
        let commands: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        for command in &commands {
            tracing::debug!(target: TARGET, command, "request");
            self.dispatcher.pipe_request(command);
        }
        commands.len()
    }

    /// Close the read end and remove the FIFO. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.receiver.take().is_some() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(target: TARGET, path = %self.path.display(), error = %err, "cannot remove FIFO");
                }
            }
            tracing::info!(target: TARGET, path = %self.path.display(), "closed");
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn ensure_fifo(path: &Path) -> Result<(), ChannelError> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.file_type().is_fifo() => Ok(()),
        Ok(_) => Err(ChannelError::NotAFifo {
            path: path.to_path_buf(),
        }),
        Err(_) => nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o660)).map_err(|source| {
            ChannelError::Create {
                path: path.to_path_buf(),
                source,
            }
        }),
    }
}

fn open_receiver(path: &Path) -> Result<Receiver, ChannelError> {
    OpenOptions::new()
        .open_receiver(path)
        .map_err(|source| ChannelError::Open {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use super::*;
    use crate::handler::testing::{Recorded, RecordingHandler};

    fn write_once(path: &Path, payload: &[u8]) {
        let mut writer = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        writer.write_all(payload).unwrap();
    }

    #[tokio::test]
    async fn test_trimmed_command_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.fifo");
        let handler = Arc::new(RecordingHandler::new());
        let mut channel = ControlChannel::open(&path, Dispatcher::new(handler.clone())).unwrap();

        write_once(&path, b"  ping\n");
        channel.readable().await.unwrap();
        assert_eq!(channel.process_event().unwrap(), 1);

        assert_eq!(handler.events(), vec![Recorded::Pipe("ping".into())]);
    }

    #[tokio::test]
    async fn test_empty_read_reopens_without_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.fifo");
        let handler = Arc::new(RecordingHandler::new());
        let mut channel = ControlChannel::open(&path, Dispatcher::new(handler.clone())).unwrap();

        write_once(&path, b"");
        channel.readable().await.unwrap();
        assert_eq!(channel.process_event().unwrap(), 0);
        assert!(channel.is_open());
        assert!(handler.events().is_empty());

        write_once(&path, b"status\nlights off\n\n");
        let mut forwarded = 0;
        while forwarded < 2 {
            channel.readable().await.unwrap();
            forwarded += channel.process_event().unwrap();
        }
        assert_eq!(
            handler.events(),
            vec![
                Recorded::Pipe("status".into()),
                Recorded::Pipe("lights off".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_line_split_across_reads_is_forwarded_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.fifo");
        let handler = Arc::new(RecordingHandler::new());
        let mut channel = ControlChannel::open(&path, Dispatcher::new(handler.clone())).unwrap();
        let mut writer = std::fs::OpenOptions::new().write(true).open(&path).unwrap();

        writer.write_all(b"sta").unwrap();
        channel.readable().await.unwrap();
        assert_eq!(channel.process_event().unwrap(), 0);
        assert!(handler.events().is_empty());

        writer.write_all(b"tus\nlig").unwrap();
        let mut forwarded = 0;
        while forwarded < 1 {
            channel.readable().await.unwrap();
            forwarded += channel.process_event().unwrap();
        }
        assert_eq!(handler.events(), vec![Recorded::Pipe("status".into())]);

        // The unterminated tail goes out when the writer closes.
        drop(writer);
        while forwarded < 2 {
            channel.readable().await.unwrap();
            forwarded += channel.process_event().unwrap();
        }
        assert_eq!(
            handler.events(),
            vec![Recorded::Pipe("status".into()), Recorded::Pipe("lig".into())]
        );
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_regular_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-fifo");
        std::fs::write(&path, "x").unwrap();
        let handler = Arc::new(RecordingHandler::new());

        let err = ControlChannel::open(&path, Dispatcher::new(handler)).unwrap_err();
        assert!(matches!(err, ChannelError::NotAFifo { .. }));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_close_removes_fifo_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.fifo");
        let handler = Arc::new(RecordingHandler::new());
        let mut channel = ControlChannel::open(&path, Dispatcher::new(handler)).unwrap();
        assert!(path.exists());

        channel.close();
        assert!(!path.exists());
        assert!(!channel.is_open());
        channel.close();
        assert_eq!(channel.process_event().unwrap(), 0);
    }
}
