//! Pipe plumbing between the agent and the backend process.
//!
//! Each invocation uses three pipes. The child-facing ends are handed to
//! the launcher and dropped by the controller right after the process
//! starts; each parent-facing end is owned by its copy task and closed when
//! the copy finishes. Ownership replaces the manual close-after-start /
//! close-after-wait bookkeeping: dropping a value is the close.

use crate::output::BoundedBuffer;
use os_pipe::{PipeReader, PipeWriter};
use std::io;
use tokio::task::JoinHandle;
use tracing::debug;

/// A scheduled stdio copy, not yet running.
///
/// Created together with its pipe, begun only once the process has
/// started. Dropping a task that was never begun releases the parent-side
/// pipe end it owns.
pub(crate) struct CopyTask {
    stream: &'static str,
    work: Box<dyn FnOnce() -> io::Result<()> + Send + 'static>,
}

impl CopyTask {
    /// Move the copy onto the blocking pool.
    pub(crate) fn begin(self) -> RunningCopy {
        RunningCopy {
            stream: self.stream,
            handle: tokio::task::spawn_blocking(self.work),
        }
    }
}

/// A copy task that has been started.
pub(crate) struct RunningCopy {
    pub(crate) stream: &'static str,
    pub(crate) handle: JoinHandle<io::Result<()>>,
}

/// Pipe for the child's stdin plus the task that feeds it.
///
/// Returns the read end, which becomes the child's stdin. The write end is
/// owned by the task and dropped as soon as the payload is written,
/// signalling end-of-input to the child.
pub(crate) fn input_relay(payload: Vec<u8>) -> io::Result<(PipeReader, CopyTask)> {
    let (reader, mut writer) = os_pipe::pipe()?;
    let task = CopyTask {
        stream: "stdin",
        work: Box::new(move || {
            let result = io::copy(&mut payload.as_slice(), &mut writer);
            drop(writer);
            match result {
                Ok(written) => {
                    debug!("wrote {} payload bytes to backend stdin", written);
                    Ok(())
                }
                // The backend may exit without reading all of its input;
                // that surfaces here as a broken pipe and is not a failure.
                Err(e) if is_benign_peer_closed(&e) => {
                    debug!("backend closed stdin early: {}", e);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }),
    };
    Ok((reader, task))
}

/// Pipe for one child output stream plus the task that drains it.
///
/// Returns the write end, which becomes the child's stdout or stderr. The
/// read end is owned by the task; it sees EOF once the child has exited
/// and the controller has dropped the child-facing write end.
pub(crate) fn output_relay(
    stream: &'static str,
    sink: BoundedBuffer,
) -> io::Result<(PipeWriter, CopyTask)> {
    let (mut reader, writer) = os_pipe::pipe()?;
    let task = CopyTask {
        stream,
        work: Box::new(move || {
            let mut sink = sink;
            let drained = io::copy(&mut reader, &mut sink)?;
            debug!("drained {} bytes from backend {}", drained, stream);
            Ok(())
        }),
    };
    Ok((writer, task))
}

/// True when an IO error only says the peer already closed its end of the
/// pipe.
pub(crate) fn is_benign_peer_closed(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::BrokenPipe {
        return true;
    }
    #[cfg(windows)]
    {
        // ERROR_BROKEN_PIPE (109) and ERROR_NO_DATA (232): both mean the
        // read side is gone.
        if matches!(error.raw_os_error(), Some(109) | Some(232)) {
            return true;
        }
    }
    false
}
