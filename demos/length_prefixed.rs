//! Length-prefixed echo server.
//!
//! This example demonstrates:
//! - Building a two-stage grammar (4-byte length, then payload)
//! - Echoing every frame back through the encode path
//! - Opening a streaming session for `count <n>` requests
//! - Closing the connection after a `quit` reply via the disconnect signal
//!
//! # Running
//!
//! ```text
//! RUST_LOG=stagewire=debug cargo run --example length_prefixed
//! ```
//!
//! Then connect with any client that speaks `u32 length + payload` frames.

use bytes::{BufMut, Bytes, BytesMut};
use stagewire::decode::{stage, Outcome, StageRef};
use stagewire::encode::{encoder, Encoder, SignalFlags, Signaled};
use stagewire::{Connection, Engine};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Largest payload accepted from a client.
const MAX_PAYLOAD: u32 = 1024 * 1024;

fn frame_stage() -> StageRef<Bytes> {
    stage::from_fn(|input| {
        let Some(len) = input.take_u32() else {
            return Ok(Outcome::Incomplete);
        };
        if len > MAX_PAYLOAD {
            return Err(stagewire::StagewireError::protocol(format!(
                "Payload size {} exceeds maximum {}",
                len, MAX_PAYLOAD
            )));
        }
        Ok(Outcome::transition(move |input| {
            Ok(input
                .take(len as usize)
                .map_or(Outcome::Incomplete, Outcome::Produce))
        }))
    })
}

fn frame_encoder() -> std::sync::Arc<dyn Encoder<Signaled<Bytes>>> {
    encoder::from_fn(|payload: &Signaled<Bytes>, ctl| {
        // `count <n>` answers with a header frame, then n streamed frames.
        if let Some(n) = payload
            .strip_prefix(b"count ")
            .and_then(|n| std::str::from_utf8(n).ok())
            .and_then(|n| n.trim().parse::<u32>().ok())
        {
            let session = ctl.start_streaming()?;
            tokio::spawn(async move {
                for i in 0..n {
                    let chunk = Bytes::from(format!("chunk {}", i));
                    if session.send(Signaled::plain(chunk)).await.is_err() {
                        break;
                    }
                }
            });
        }

        let mut out = BytesMut::with_capacity(4 + payload.len());
        out.put_u32(payload.len() as u32);
        out.put_slice(payload);
        Ok(Some(out.freeze()))
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:7000").await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::info!("Accepted {}", peer);

        tokio::spawn(async move {
            let engine = Engine::builder(frame_stage(), frame_encoder()).build();
            let mut conn = Connection::builder(engine).start(socket);

            while let Some(payload) = conn.recv().await {
                let flags = if &payload[..] == b"quit" {
                    SignalFlags::DISCONNECT
                } else {
                    SignalFlags::empty()
                };
                if let Err(e) = conn.send(Signaled::new(payload, flags)).await {
                    tracing::warn!("{}: send failed: {}", peer, e);
                    break;
                }
            }

            if let Err(e) = conn.wait_for_shutdown().await {
                tracing::warn!("{}: connection ended with error: {}", peer, e);
            }
        });
    }
}
