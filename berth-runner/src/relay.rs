//! Container log relay
//!
//! Copies an attached container's output into the log sink from a background
//! task, one line at a time. The task reports its result exactly once, and
//! the attach stream is dropped (closing the connection) when the relay
//! finishes, is cancelled, or the `LogRelay` handle goes away.

use std::sync::Arc;

use berth_core::{LineBuffer, LogSink};
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::runtime::{OutputFrame, OutputStream, RuntimeError};

/// How a relay ended, as observed by `LogRelay::finish`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RelayOutcome {
    /// The output stream ended cleanly
    Completed,
    /// The output stream failed
    Failed(RuntimeError),
    /// The waiter gave up before the stream ended
    Cancelled,
}

/// Handle to a running log relay
pub(crate) struct LogRelay {
    done: oneshot::Receiver<Result<(), RuntimeError>>,
    _close: DropGuard,
}

impl LogRelay {
    /// Spawns the relay task for `service`
    pub(crate) fn spawn(service: &str, output: OutputStream, sink: Arc<dyn LogSink>) -> Self {
        let close = CancellationToken::new();
        let (done_tx, done) = oneshot::channel();

        let stdout = format!("container \"{}\" STDOUT", service);
        let stderr = format!("container \"{}\" STDERR", service);
        let token = close.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                result = relay(output, sink.as_ref(), &stdout, &stderr) => result,
                _ = token.cancelled() => Ok(()),
            };
            // Nobody listening means the runner is gone
            let _ = done_tx.send(result);
        });

        Self {
            done,
            _close: close.drop_guard(),
        }
    }

    /// Waits for the relay to end or for `cancel`, then closes the stream
    pub(crate) async fn finish(self, cancel: &CancellationToken) -> RelayOutcome {
        let Self { done, _close: close } = self;

        let outcome = tokio::select! {
            biased;
            result = done => match result {
                Ok(Ok(())) => RelayOutcome::Completed,
                Ok(Err(err)) => RelayOutcome::Failed(err),
                Err(_) => RelayOutcome::Failed(RuntimeError::Api(
                    "log relay ended without reporting".to_string(),
                )),
            },
            _ = cancel.cancelled() => RelayOutcome::Cancelled,
        };

        drop(close);
        outcome
    }
}

async fn relay(
    mut output: OutputStream,
    sink: &dyn LogSink,
    stdout_source: &str,
    stderr_source: &str,
) -> Result<(), RuntimeError> {
    let mut stdout = LineBuffer::new();
    let mut stderr = LineBuffer::new();

    let result = loop {
        let (buffer, source, data) = match output.next().await {
            Some(Ok(OutputFrame::Stdout(data))) => (&mut stdout, stdout_source, data),
            Some(Ok(OutputFrame::Stderr(data))) => (&mut stderr, stderr_source, data),
            Some(Err(err)) => break Err(err),
            None => break Ok(()),
        };
        for line in buffer.push(&data) {
            sink.write_line(source, &line);
        }
    };

    for (buffer, source) in [(&mut stdout, stdout_source), (&mut stderr, stderr_source)] {
        let dropped = buffer.discard();
        if dropped > 0 {
            debug!("Dropped {} bytes of unterminated output from {}", dropped, source);
        }
    }

    result
}
