//! Consumer task: drains the queue into the network sender.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use super::{PipelineShared, LOG_EVERY_N_FRAMES};
use crate::net::NetworkSender;
use crate::{BoundedAsyncQueue, Frame, UplinkEvent};

/// Why the consumer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UplinkEnd {
    /// The queue was closed.
    QueueClosed,
    /// Consecutive send failures went past the configured limit.
    TooManySendFailures(u32),
}

/// Sends frames strictly in queue order, one at a time.
///
/// The sender lock is held for the duration of each send, so shutdown can
/// wait for an in-flight frame by taking the lock.
pub(crate) struct Uplink {
    queue: BoundedAsyncQueue<Frame>,
    sender: Arc<AsyncMutex<NetworkSender>>,
    shared: Arc<PipelineShared>,
    max_consecutive_failures: Option<u32>,
}

impl Uplink {
    pub(crate) fn new(
        queue: BoundedAsyncQueue<Frame>,
        sender: Arc<AsyncMutex<NetworkSender>>,
        shared: Arc<PipelineShared>,
        max_consecutive_failures: Option<u32>,
    ) -> Self {
        Self {
            queue,
            sender,
            shared,
            max_consecutive_failures,
        }
    }

    pub(crate) async fn run(self) -> UplinkEnd {
        let mut consecutive_failures = 0u32;

        while let Ok(frame) = self.queue.get().await {
            let result = self.sender.lock().await.send(&frame).await;
            let sequence = frame.sequence();

            match result {
                Ok(()) => {
                    consecutive_failures = 0;
                    let stats = &self.shared.stats;
                    stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    stats
                        .bytes_sent
                        .fetch_add(frame.len() as u64 * 2, Ordering::Relaxed);
                    if sequence % LOG_EVERY_N_FRAMES == 0 {
                        tracing::debug!("Sent frame {} ({} samples)", sequence, frame.len());
                    }
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.shared
                        .stats
                        .frames_failed
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Frame {} lost: {}", sequence, e);
                    self.shared.emit(UplinkEvent::FrameSendFailed {
                        sequence,
                        error: e.to_string(),
                    });

                    if self
                        .max_consecutive_failures
                        .is_some_and(|max| consecutive_failures > max)
                    {
                        tracing::error!(
                            "{} consecutive frame sends failed, giving up",
                            consecutive_failures
                        );
                        return UplinkEnd::TooManySendFailures(consecutive_failures);
                    }
                }
            }
        }

        UplinkEnd::QueueClosed
    }
}
