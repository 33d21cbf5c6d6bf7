//! Integration tests for audio-uplink.
//!
//! Everything here runs without hardware: sources are scripted and the
//! network is either in memory or a loopback WebSocket. Tests that require
//! an actual audio device are marked with `#[ignore]` and should be run
//! manually.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use audio_uplink::net::{MemoryTransport, WebSocketTransport};
use audio_uplink::source::{
    CallbackSource, CaptureFormat, CaptureSource, DeviceSource, SampleStream, ScriptedSource,
};
use audio_uplink::{
    AudioUplink, ConnectionState, DrainPolicy, Frame, FrameBuffer, NetworkSender, PipelineState,
    SendError, UplinkError, UplinkEvent,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Wraps a scripted source and counts `start` calls.
struct CountingSource {
    inner: ScriptedSource,
    starts: Arc<AtomicUsize>,
}

#[async_trait]
impl CaptureSource for CountingSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn start(&mut self, format: CaptureFormat) -> Result<Box<dyn SampleStream>, UplinkError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.inner.start(format).await
    }

    async fn stop(&mut self) {
        self.inner.stop().await;
    }
}

fn ramp(len: usize) -> Vec<i16> {
    (0..len).map(|i| (i % 30000) as i16).collect()
}

#[tokio::test]
async fn test_frames_arrive_in_order_with_exact_samples() {
    let samples = ramp(4800);
    let mut script = ScriptedSource::transcription();
    script.add_i16_samples(&samples);
    let transport = MemoryTransport::new();

    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://e2e")
        .source(script)
        .transport(transport.clone())
        .start()
        .await
        .unwrap();
    pipeline.wait().await.unwrap();

    let sent = transport.sent_samples();
    assert_eq!(sent.len(), 3);
    for (i, frame) in sent.iter().enumerate() {
        assert_eq!(frame.as_slice(), &samples[i * 1600..(i + 1) * 1600]);
    }
    assert!(transport.is_closed());
}

#[tokio::test]
async fn test_frame_buffer_and_queue_scenario() {
    // 16kHz, 100ms frames: 4000 samples give two frames and 800 staged.
    let mut buffer = FrameBuffer::with_duration(16000, Duration::from_millis(100));
    let frames = buffer.push(&vec![0.25; 4000]);
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.len() == 1600));
    assert_eq!(buffer.staged_len(), 800);

    // Capacity 1 with a stalled consumer: the second put suspends until a get.
    let queue = audio_uplink::BoundedAsyncQueue::bounded(1);
    let mut frames = frames.into_iter();
    queue.put(frames.next().unwrap()).await.unwrap();

    let producer = {
        let queue = queue.clone();
        let frame = frames.next().unwrap();
        tokio::spawn(async move { queue.put(frame).await })
    };
    while queue.waiting_producers() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(!producer.is_finished());

    assert_eq!(queue.get().await.unwrap().sequence(), 0);
    producer.await.unwrap().unwrap();
    assert_eq!(queue.get().await.unwrap().sequence(), 1);
}

#[tokio::test]
async fn test_stalled_sender_applies_backpressure() {
    let mut script = ScriptedSource::transcription().hold_open(true);
    script.generate_sine(440.0, 400);
    let transport = MemoryTransport::new();
    transport.stall_sends();

    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://slow")
        .queue_capacity(1)
        .source(script)
        .transport(transport.clone())
        .start()
        .await
        .unwrap();

    // Frame 0 is stuck in the sender, frame 1 fills the queue, frame 2 waits.
    while pipeline.stats().frames_produced < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pipeline.stats().frames_produced, 3);
    assert_eq!(transport.sent_count(), 0);

    transport.resume_sends();
    transport.wait_for_sent(4).await;
    pipeline.stop().await.unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.frames_sent, 4);
    assert_eq!(stats.frames_discarded, 0);
}

#[tokio::test]
async fn test_stop_releases_parked_producer_within_drain_timeout() {
    let mut script = ScriptedSource::transcription().hold_open(true);
    script.generate_silence(1000);
    let transport = MemoryTransport::new();
    transport.stall_sends();

    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://stalled")
        .queue_capacity(1)
        .drain_timeout(Duration::from_millis(100))
        .source(script)
        .transport(transport.clone())
        .start()
        .await
        .unwrap();

    while pipeline.stats().frames_produced < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tokio::time::timeout(Duration::from_secs(2), pipeline.stop())
        .await
        .expect("stop hung on a parked put")
        .unwrap();

    let stats = pipeline.stats();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(stats.frames_sent, 0);
    assert_eq!(stats.frames_discarded, stats.frames_produced);
}

#[tokio::test]
async fn test_best_effort_drain_sends_queued_frames() {
    let mut script = ScriptedSource::transcription().hold_open(true);
    script.generate_silence(500);
    let transport = MemoryTransport::new();
    transport.stall_sends();

    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://drain")
        .drain_timeout(Duration::from_secs(2))
        .source(script)
        .transport(transport.clone())
        .start()
        .await
        .unwrap();

    while pipeline.stats().frames_produced < 5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let resumer = {
        let transport = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            transport.resume_sends();
        })
    };

    pipeline.stop().await.unwrap();
    resumer.await.unwrap();
    assert_eq!(transport.sent_count(), 5);
    assert_eq!(pipeline.stats().frames_discarded, 0);
}

#[tokio::test]
async fn test_discard_policy_reports_dropped_frames() {
    let mut script = ScriptedSource::transcription().hold_open(true);
    script.generate_silence(500);
    let transport = MemoryTransport::new();
    transport.stall_sends();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://discard")
        .drain_policy(DrainPolicy::Discard)
        .source(script)
        .transport(transport.clone())
        .on_event(move |event| {
            if let UplinkEvent::FramesDiscarded { count } = event {
                let _ = tx.send(count);
            }
        })
        .start()
        .await
        .unwrap();

    while pipeline.stats().frames_produced < 5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    pipeline.stop().await.unwrap();

    // One frame was in flight; the other four were still queued.
    assert_eq!(rx.recv().await, Some(4));
    assert_eq!(pipeline.stats().frames_discarded, 5);
}

#[tokio::test]
async fn test_connection_failure_never_starts_capture() {
    let starts = Arc::new(AtomicUsize::new(0));
    let source = CountingSource {
        inner: ScriptedSource::transcription(),
        starts: Arc::clone(&starts),
    };
    let transport = MemoryTransport::new();
    transport.fail_connect("connection refused");

    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://down")
        .source(source)
        .transport(transport)
        .build()
        .unwrap();

    let err = pipeline.start().await.unwrap_err();
    assert!(matches!(err, UplinkError::ConnectionFailed { .. }));
    assert_eq!(starts.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.terminal_cause(), Some(err));
}

#[tokio::test]
async fn test_permission_denied_aborts_start_and_closes_connection() {
    let transport = MemoryTransport::new();

    let result = AudioUplink::builder()
        .endpoint("memory://mic")
        .source(ScriptedSource::transcription().fail_start(UplinkError::PermissionDenied))
        .transport(transport.clone())
        .start()
        .await;

    assert_eq!(result.err(), Some(UplinkError::PermissionDenied));
    assert_eq!(transport.connect_count(), 1);
    assert!(transport.is_closed());
}

#[tokio::test]
async fn test_device_lost_is_fatal() {
    let mut script = ScriptedSource::transcription()
        .chunk_duration(Duration::from_millis(100))
        .lose_device_after(3, "USB microphone unplugged")
        .hold_open(true);
    script.generate_silence(2000);
    let transport = MemoryTransport::new();

    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://lost")
        .source(script)
        .transport(transport.clone())
        .start()
        .await
        .unwrap();

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(
        err,
        UplinkError::DeviceLost {
            reason: "USB microphone unplugged".to_string()
        }
    );
    // Frames cut before the loss are still delivered.
    assert_eq!(transport.sent_count(), 3);
    assert_eq!(pipeline.stop().await, Err(err));
}

#[tokio::test]
async fn test_remote_close_stops_pipeline() {
    let mut script = ScriptedSource::transcription().hold_open(true);
    script.generate_silence(200);
    let transport = MemoryTransport::new();

    let pipeline = AudioUplink::builder()
        .endpoint("memory://remote")
        .source(script)
        .transport(transport.clone())
        .start()
        .await
        .unwrap();

    transport.wait_for_sent(2).await;
    transport.close_remote("session expired");

    assert_eq!(
        pipeline.wait().await,
        Err(UplinkError::ConnectionLost {
            reason: "session expired".to_string()
        })
    );
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn test_repeated_send_failures_are_fatal() {
    let mut script = ScriptedSource::transcription().hold_open(true);
    script.generate_silence(1000);
    let transport = MemoryTransport::new();
    transport.fail_next_sends(100);
    let failures = Arc::new(AtomicUsize::new(0));

    let pipeline = AudioUplink::builder()
        .endpoint("memory://flaky")
        .max_consecutive_send_failures(Some(2))
        .source(script)
        .transport(transport)
        .on_event({
            let failures = Arc::clone(&failures);
            move |event| {
                if matches!(event, UplinkEvent::FrameSendFailed { .. }) {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
        .start()
        .await
        .unwrap();

    assert_eq!(
        pipeline.wait().await,
        Err(UplinkError::TooManySendFailures { count: 3 })
    );
    assert_eq!(failures.load(Ordering::SeqCst), 3);
    assert_eq!(pipeline.stats().frames_failed, 3);
}

#[tokio::test]
async fn test_send_while_disconnected_is_not_retried() {
    let transport = MemoryTransport::new();
    let mut sender = NetworkSender::new(Arc::new(transport.clone()));
    let frame = Frame::new(0, vec![0; 1600], Duration::ZERO, 16000);

    assert_eq!(sender.state(), ConnectionState::Disconnected);
    assert_eq!(sender.send(&frame).await, Err(SendError::NotConnected));

    sender.connect("memory://later").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.sent_count(), 0);
}

#[tokio::test]
async fn test_callback_source_resamples_into_frames() {
    let (source, feeder) = CallbackSource::new(48000, 2, 64);
    let transport = MemoryTransport::new();

    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://worklet")
        .source(source)
        .transport(transport.clone())
        .start()
        .await
        .unwrap();

    // 300ms of 48kHz stereo in 10ms callbacks.
    for _ in 0..30 {
        assert!(feeder.feed(&[0.5; 960]));
        tokio::task::yield_now().await;
    }
    transport.wait_for_sent(2).await;
    pipeline.stop().await.unwrap();

    let sent = transport.sent_samples();
    assert!(sent.len() >= 2);
    assert!(sent.iter().all(|f| f.len() == 1600));
    assert!((16380..=16385).contains(&sent[1][800]));
    assert!(!feeder.is_accepting());
}

#[tokio::test]
async fn test_partial_frame_flushed_on_stop() {
    let mut script = ScriptedSource::transcription();
    script.generate_silence(150);
    let transport = MemoryTransport::new();

    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://flush")
        .flush_partial_on_stop(true)
        .source(script)
        .transport(transport.clone())
        .start()
        .await
        .unwrap();
    pipeline.wait().await.unwrap();

    let lens: Vec<usize> = transport.sent_samples().iter().map(Vec::len).collect();
    assert_eq!(lens, vec![1600, 800]);
    assert_eq!(pipeline.stats().samples_captured, 2400);
}

#[tokio::test]
async fn test_partial_frame_discarded_by_default() {
    let mut script = ScriptedSource::transcription();
    script.generate_silence(150);
    let transport = MemoryTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let pipeline = AudioUplink::builder()
        .endpoint("memory://partial")
        .source(script)
        .transport(transport.clone())
        .on_event(move |event| {
            if let UplinkEvent::PartialFrameDiscarded { samples } = event {
                let _ = tx.send(samples);
            }
        })
        .start()
        .await
        .unwrap();
    pipeline.wait().await.unwrap();

    assert_eq!(transport.sent_count(), 1);
    assert_eq!(rx.recv().await, Some(800));
}

#[tokio::test]
async fn test_stop_before_start_and_twice() {
    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://idle")
        .source(ScriptedSource::transcription())
        .transport(MemoryTransport::new())
        .build()
        .unwrap();

    pipeline.stop().await.unwrap();
    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[tokio::test]
async fn test_websocket_loopback() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let auth = Arc::new(parking_lot::Mutex::new(None));
        let seen_auth = Arc::clone(&auth);
        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                *seen_auth.lock() = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(response)
            },
        )
        .await
        .unwrap();

        ws.send(Message::Text(r#"{"transcript":"ready"}"#.to_string()))
            .await
            .unwrap();

        let mut binary = Vec::new();
        let mut text = Vec::new();
        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Binary(payload) => binary.push(payload),
                Message::Text(body) => text.push(body),
                Message::Close(_) => break,
                _ => {}
            }
        }
        let auth = auth.lock().clone();
        (binary, text, auth)
    });

    let mut script = ScriptedSource::transcription().hold_open(true);
    script.generate_silence(300);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut pipeline = AudioUplink::builder()
        .endpoint(format!("ws://{addr}/ws/audio"))
        .source(script)
        .transport(
            WebSocketTransport::new()
                .with_auth_token("test-key")
                .with_close_message(r#"{"type":"CloseStream"}"#),
        )
        .on_event(move |event| {
            if let UplinkEvent::ServerMessage { text } = event {
                let _ = tx.send(text);
            }
        })
        .start()
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), r#"{"transcript":"ready"}"#);
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.stop().await.unwrap();

    let (binary, text, auth) = server.await.unwrap();
    assert_eq!(binary.len(), 3);
    assert!(binary.iter().all(|payload| payload.len() == 3200));
    assert_eq!(text, vec![r#"{"type":"CloseStream"}"#.to_string()]);
    assert_eq!(auth.as_deref(), Some("Token test-key"));
    assert_eq!(pipeline.stats().bytes_sent, 9600);
}

#[tokio::test]
#[ignore = "requires audio hardware"]
async fn test_real_capture() {
    let transport = MemoryTransport::new();
    let mut pipeline = AudioUplink::builder()
        .endpoint("memory://mic")
        .source(DeviceSource::default_device())
        .transport(transport.clone())
        .start()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.stop().await.unwrap();

    assert!(transport.sent_count() >= 3);
}
