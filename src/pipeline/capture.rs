//! Producer task: reads the capture stream, cuts frames, feeds the queue.
//!
//! The device callback never touches the queue directly. Whatever the
//! source delivers arrives here as [`CaptureEvent`]s, goes through the
//! [`FrameBuffer`] and is handed over with `put`, which suspends while the
//! queue is full.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{FrameBuffer, PipelineShared, LOG_EVERY_N_FRAMES};
use crate::source::{CaptureEvent, SampleStream, StopSignal};
use crate::{BoundedAsyncQueue, Frame, UplinkEvent};

/// Why the producer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CaptureEnd {
    /// The stream ran out of audio.
    Exhausted,
    /// The device went away.
    DeviceLost(String),
    /// The pipeline shut the producer down or closed the queue.
    Shutdown,
}

pub(crate) struct CaptureTask {
    stream: Box<dyn SampleStream>,
    buffer: FrameBuffer,
    queue: BoundedAsyncQueue<Frame>,
    shared: Arc<PipelineShared>,
    shutdown: Arc<StopSignal>,
    flush_partial: bool,
}

impl CaptureTask {
    pub(crate) fn new(
        stream: Box<dyn SampleStream>,
        buffer: FrameBuffer,
        queue: BoundedAsyncQueue<Frame>,
        shared: Arc<PipelineShared>,
        shutdown: Arc<StopSignal>,
        flush_partial: bool,
    ) -> Self {
        Self {
            stream,
            buffer,
            queue,
            shared,
            shutdown,
            flush_partial,
        }
    }

    pub(crate) async fn run(mut self) -> CaptureEnd {
        let end = self.pump().await;
        tracing::debug!("Capture producer finished: {:?}", end);
        self.finish_partial().await;
        end
    }

    async fn pump(&mut self) -> CaptureEnd {
        loop {
            let event = tokio::select! {
                event = self.stream.next_event() => event,
                () = self.shutdown.wait() => return CaptureEnd::Shutdown,
            };

            match event {
                None => return CaptureEnd::Exhausted,
                Some(CaptureEvent::Samples(samples)) => {
                    self.shared
                        .stats
                        .samples_captured
                        .fetch_add(samples.len() as u64, Ordering::Relaxed);
                    for frame in self.buffer.push(&samples) {
                        if !self.enqueue(frame).await {
                            return CaptureEnd::Shutdown;
                        }
                    }
                }
                Some(CaptureEvent::Overflow { dropped_samples }) => {
                    self.shared
                        .stats
                        .overflow_samples
                        .fetch_add(dropped_samples, Ordering::Relaxed);
                    tracing::warn!("Capture overflow: {} samples dropped", dropped_samples);
                    self.shared
                        .emit(UplinkEvent::CaptureOverflow { dropped_samples });
                }
                Some(CaptureEvent::DeviceLost { reason }) => {
                    tracing::error!("Capture device lost: {}", reason);
                    self.shared.emit(UplinkEvent::DeviceLost {
                        reason: reason.clone(),
                    });
                    return CaptureEnd::DeviceLost(reason);
                }
            }
        }
    }

    /// Hands a frame to the queue. Returns `false` once the queue is closed.
    async fn enqueue(&mut self, frame: Frame) -> bool {
        let sequence = frame.sequence();
        self.shared
            .stats
            .frames_produced
            .fetch_add(1, Ordering::Relaxed);
        if self.queue.put(frame).await.is_err() {
            tracing::debug!("Queue closed, frame {} dropped", sequence);
            return false;
        }
        if sequence % LOG_EVERY_N_FRAMES == 0 {
            tracing::debug!("Queued frame {} ({} waiting)", sequence, self.queue.len());
        }
        true
    }

    async fn finish_partial(&mut self) {
        if self.flush_partial {
            if let Some(frame) = self.buffer.flush() {
                tracing::debug!("Flushing partial frame of {} samples", frame.len());
                self.enqueue(frame).await;
            }
            return;
        }

        let dropped = self.buffer.discard();
        if dropped > 0 {
            tracing::debug!("Discarding partial frame of {} samples", dropped);
            self.shared
                .emit(UplinkEvent::PartialFrameDiscarded { samples: dropped });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CaptureFormat, CaptureSource, ScriptedSource};
    use crate::event_callback;
    use parking_lot::Mutex;

    async fn task_for(
        mut script: ScriptedSource,
        queue: &BoundedAsyncQueue<Frame>,
        flush_partial: bool,
        events: Option<crate::EventCallback>,
    ) -> (CaptureTask, Arc<PipelineShared>, Arc<StopSignal>) {
        let stream = script.start(CaptureFormat::default()).await.unwrap();
        let shared = Arc::new(PipelineShared::new(events));
        let shutdown = Arc::new(StopSignal::default());
        let task = CaptureTask::new(
            stream,
            FrameBuffer::new(16000, 1600),
            queue.clone(),
            Arc::clone(&shared),
            Arc::clone(&shutdown),
            flush_partial,
        );
        (task, shared, shutdown)
    }

    #[tokio::test]
    async fn test_frames_reach_queue_and_partial_is_discarded() {
        let mut script = ScriptedSource::transcription();
        script.generate_silence(250);
        let queue = BoundedAsyncQueue::unbounded();

        let discarded = Arc::new(Mutex::new(None));
        let callback = {
            let discarded = Arc::clone(&discarded);
            event_callback(move |event| {
                if let UplinkEvent::PartialFrameDiscarded { samples } = event {
                    *discarded.lock() = Some(samples);
                }
            })
        };
        let (task, shared, _) = task_for(script, &queue, false, Some(callback)).await;

        assert_eq!(task.run().await, CaptureEnd::Exhausted);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.unwrap().sequence(), 0);
        assert_eq!(queue.get().await.unwrap().sequence(), 1);
        assert_eq!(*discarded.lock(), Some(800));
        assert_eq!(shared.stats.snapshot().samples_captured, 4000);
        assert_eq!(shared.stats.snapshot().frames_produced, 2);
    }

    #[tokio::test]
    async fn test_flush_partial_on_stop() {
        let mut script = ScriptedSource::transcription();
        script.generate_silence(250);
        let queue = BoundedAsyncQueue::unbounded();
        let (task, _, _) = task_for(script, &queue, true, None).await;

        task.run().await;
        let sizes: Vec<usize> = queue.close().iter().map(Frame::len).collect();
        assert_eq!(sizes, vec![1600, 1600, 800]);
    }

    #[tokio::test]
    async fn test_device_lost_ends_producer() {
        let mut script = ScriptedSource::transcription()
            .chunk_duration(std::time::Duration::from_millis(100))
            .lose_device_after(1, "unplugged");
        script.generate_silence(500);
        let queue = BoundedAsyncQueue::unbounded();
        let (task, _, _) = task_for(script, &queue, false, None).await;

        assert_eq!(
            task.run().await,
            CaptureEnd::DeviceLost("unplugged".to_string())
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_unblocks_parked_put() {
        let mut script = ScriptedSource::transcription();
        script.generate_silence(1000);
        let queue = BoundedAsyncQueue::bounded(1);
        let (task, _, _) = task_for(script, &queue, false, None).await;

        let producer = tokio::spawn(task.run());
        while queue.waiting_producers() == 0 {
            tokio::task::yield_now().await;
        }

        let leftover = queue.close();
        assert_eq!(leftover.len(), 2);
        assert_eq!(producer.await.unwrap(), CaptureEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_idle_stream() {
        let script = ScriptedSource::transcription().hold_open(true);
        let queue = BoundedAsyncQueue::unbounded();
        let (task, _, shutdown) = task_for(script, &queue, false, None).await;

        let producer = tokio::spawn(task.run());
        tokio::task::yield_now().await;
        shutdown.stop();
        assert_eq!(producer.await.unwrap(), CaptureEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_overflow_is_counted() {
        let (mut source, feeder) = crate::source::CallbackSource::new(16000, 1, 1);
        let stream = source.start(CaptureFormat::default()).await.unwrap();
        let shared = Arc::new(PipelineShared::new(None));
        let shutdown = Arc::new(StopSignal::default());
        let task = CaptureTask::new(
            stream,
            FrameBuffer::new(16000, 1600),
            BoundedAsyncQueue::unbounded(),
            Arc::clone(&shared),
            Arc::clone(&shutdown),
            false,
        );

        assert!(feeder.feed(&[0.0; 10]));
        assert!(!feeder.feed(&[0.0; 30]));
        source.stop().await;

        let _ = task.run().await;
        let stats = shared.stats.snapshot();
        assert_eq!(stats.overflow_samples, 30);
        assert_eq!(stats.samples_captured, 10);
    }
}
