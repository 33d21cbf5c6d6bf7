//! Stream the microphone to a WebSocket endpoint.
//!
//! Captures the default input device (or the one named by `UPLINK_DEVICE`),
//! sends 100ms frames of 16kHz PCM and prints whatever text the server sends
//! back. Press Ctrl-C to stop.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example stream_mic -- ws://localhost:8000/ws/audio
//!
//! # With an API key and verbose logs:
//! UPLINK_TOKEN=secret RUST_LOG=audio_uplink=debug \
//!     cargo run --example stream_mic -- wss://api.example.com/v1/listen
//! ```

use std::time::Duration;

use audio_uplink::net::WebSocketTransport;
use audio_uplink::{list_input_devices, AudioUplink, UplinkEvent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("UPLINK_ENDPOINT").ok())
        .unwrap_or_else(|| "ws://localhost:8000/ws/audio".to_string());

    println!("Input devices:");
    for name in list_input_devices()? {
        println!("  - {name}");
    }

    let mut transport = WebSocketTransport::new().with_close_message(r#"{"type":"CloseStream"}"#);
    if let Ok(token) = std::env::var("UPLINK_TOKEN") {
        transport = transport.with_auth_token(token);
    }

    let mut builder = AudioUplink::builder()
        .endpoint(&endpoint)
        .queue_capacity(50)
        .drain_timeout(Duration::from_secs(2))
        .transport(transport)
        .on_event(|event| match event {
            UplinkEvent::ServerMessage { text } => println!("<< {text}"),
            UplinkEvent::FrameSendFailed { .. }
            | UplinkEvent::CaptureOverflow { .. }
            | UplinkEvent::DeviceLost { .. } => tracing::warn!(?event, "uplink problem"),
            other => tracing::debug!(?other, "uplink event"),
        });
    if let Ok(device) = std::env::var("UPLINK_DEVICE") {
        builder = builder.device(device);
    }

    println!("Streaming to {endpoint}, press Ctrl-C to stop");
    let mut pipeline = builder.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("Stopping...");
        }
        result = pipeline.wait() => {
            if let Err(e) = result {
                eprintln!("Pipeline ended: {e}");
            }
        }
    }

    let result = pipeline.stop().await;
    let stats = pipeline.stats();
    println!(
        "Sent {} frames ({} bytes), {} failed, {} discarded",
        stats.frames_sent, stats.bytes_sent, stats.frames_failed, stats.frames_discarded
    );
    result?;
    Ok(())
}
