//! Readiness detection over container log streams.
//!
//! The in-container init process reports progress on its combined
//! stdout/stderr. Two waits happen during provisioning: one for the
//! initialization marker (before material installation) and one for the
//! ready marker (after). The waits are unbounded in stream position; the
//! orchestrator bounds them with the attempt deadline.

use anyhow::Result;
use anyhow::bail;
use futures::Stream;
use futures::StreamExt;

/// Marker logged when in-container initialization has finished.
const INITIALIZED_MARKER: &str = "DOJO_INIT_INITIALIZED";

/// Bare line accepted as the initialization marker.
const INITIALIZED_LINE: &str = "Initialized.";

/// Marker logged when the workspace is ready for the user.
const READY_MARKER: &str = "DOJO_INIT_READY";

/// Bare line accepted as the ready marker.
const READY_LINE: &str = "Ready.";

/// Marker logged when in-container initialization failed.
const FAILED_MARKER: &str = "DOJO_INIT_FAILED:";

/// Assembles byte chunks into complete lines.
#[derive(Debug, Default)]
struct LineAssembler {
    /// Bytes of the line currently being assembled.
    buffer: Vec<u8>,
}

impl LineAssembler {
    /// Feed a chunk, returning the lines it completed (without their
    /// trailing newline).
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                self.buffer.clear();
            } else {
                self.buffer.push(*byte);
            }
        }
        lines
    }

    /// The unterminated remainder, if any.
    fn remainder(self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buffer).into_owned())
        }
    }
}

/// Wait for the initialization marker.
///
/// # Errors
///
/// Returns an error if the stream fails or ends before the marker.
pub async fn await_initialized<S>(stream: S) -> Result<()>
where
    S: Stream<Item = Result<Vec<u8>>>,
{
    tokio::pin!(stream);
    let mut assembler = LineAssembler::default();

    while let Some(chunk) = stream.next().await {
        for line in assembler.push(&chunk?) {
            if is_initialized(&line) {
                return Ok(());
            }
        }
    }

    if assembler.remainder().is_some_and(|line| is_initialized(&line)) {
        return Ok(());
    }

    bail!("Workspace failed to initialize")
}

/// Wait for the ready marker, failing fast on a failure marker.
///
/// # Errors
///
/// Returns an error carrying the init process's cause if it reported a
/// failure, or a generic error if the stream fails or ends first.
pub async fn await_ready<S>(stream: S) -> Result<()>
where
    S: Stream<Item = Result<Vec<u8>>>,
{
    tokio::pin!(stream);
    let mut assembler = LineAssembler::default();

    while let Some(chunk) = stream.next().await {
        for line in assembler.push(&chunk?) {
            check_ready_line(&line)?;
            if is_ready(&line) {
                return Ok(());
            }
        }
    }

    if let Some(line) = assembler.remainder() {
        check_ready_line(&line)?;
        if is_ready(&line) {
            return Ok(());
        }
    }

    bail!("Workspace failed to become ready")
}

/// Whether a line carries the initialization marker.
fn is_initialized(line: &str) -> bool {
    line.contains(INITIALIZED_MARKER) || line == INITIALIZED_LINE
}

/// Whether a line carries the ready marker.
fn is_ready(line: &str) -> bool {
    line.contains(READY_MARKER) || line == READY_LINE
}

/// Fail if a line carries the failure marker, propagating its cause.
fn check_ready_line(line: &str) -> Result<()> {
    if let Some(position) = line.find(FAILED_MARKER) {
        let cause = &line[position + FAILED_MARKER.len()..];
        bail!("DOJO_INIT_FAILED: {cause}");
    }
    Ok(())
}
