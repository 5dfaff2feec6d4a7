//! Background task draining the evaluator's combined output pipe.
//!
//! Chunks are pushed into an unbounded queue in the order they were read.
//! The task stops once the process has exited (after a final drain) or the
//! consuming side of the queue is gone.

use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::supervisor::ProcessState;
use crate::config::EvaluatorOptions;

/// Upper bound on reads performed after the process has exited.
const MAX_DRAIN_READS: usize = 64;

/// Handle to a running output reader task.
///
/// Dropping the handle detaches the task; it still runs until the process
/// exits or the queue's receiver is gone.
#[derive(Debug)]
pub struct OutputReaderHandle {
    join_handle: JoinHandle<()>,
}

impl OutputReaderHandle {
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

/// Spawn the reader over `output`.
pub fn spawn_output_reader<R>(
    output: R,
    process_state: watch::Receiver<ProcessState>,
    queue: mpsc::UnboundedSender<Vec<u8>>,
    options: EvaluatorOptions,
) -> OutputReaderHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let join_handle = tokio::spawn(read_loop(
        output,
        process_state,
        queue,
        options.read_buffer_size.max(1),
        options.poll_interval,
    ));
    OutputReaderHandle { join_handle }
}

async fn read_loop<R>(
    mut output: R,
    process_state: watch::Receiver<ProcessState>,
    queue: mpsc::UnboundedSender<Vec<u8>>,
    buffer_size: usize,
    interval: Duration,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    // A short read means the evaluator is producing slowly; back off.
    let low_water = buffer_size * 4 / 5;

    while !process_state.borrow().is_exited() {
        match tokio::time::timeout(interval, output.read(&mut buf)).await {
            Err(_elapsed) => continue,
            Ok(Ok(0)) => tokio::time::sleep(interval).await,
            Ok(Ok(n)) => {
                if queue.send(buf[..n].to_vec()).is_err() {
                    debug!(
                        target: "swankbridge::reader",
                        "Output queue closed, stopping reader"
                    );
                    return;
                }
                if n < low_water {
                    tokio::time::sleep(interval).await;
                }
            }
            Ok(Err(e)) => {
                warn!(
                    target: "swankbridge::reader",
                    "Failed to read evaluator output: {}",
                    e
                );
                tokio::time::sleep(interval).await;
            }
        }
    }

    // Deliver whatever the process wrote before it exited
    for _ in 0..MAX_DRAIN_READS {
        match tokio::time::timeout(interval, output.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => {
                if queue.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            _ => break,
        }
    }

    debug!(
        target: "swankbridge::reader",
        "Evaluator exited, output reader stopped"
    );
}
