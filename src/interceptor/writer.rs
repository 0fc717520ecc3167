//! Dedicated response writer
//!
//! One task per streamed response drains the packet channel in FIFO order
//! and writes each frame into the downstream body. Dropping all packet
//! senders signals stop: the writer finishes the pending queue and exits,
//! and completion is observable on the returned receiver. A downstream
//! disconnect ends the writer without an error; that cancellation is
//! normal teardown.

use super::packet::{render, ResponsePacket};
use axum::body::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub fn spawn(
    mut packets: mpsc::Receiver<ResponsePacket>,
    body: mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        while let Some(packet) = packets.recv().await {
            let bytes = Bytes::from(render(&packet));
            if body.send(Ok(bytes)).await.is_err() {
                debug!("downstream closed, stopping response writer");
                break;
            }
        }
        let _ = done_tx.send(());
    });

    done_rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::packet::PacketKind;

    fn packet(raw: &str) -> ResponsePacket {
        ResponsePacket {
            kind: PacketKind::Stream,
            is_sse: true,
            prefix: "data".to_string(),
            message_path: None,
            raw: raw.to_string(),
        }
    }

    #[tokio::test]
    async fn test_writer_preserves_order_and_drains() {
        let (packet_tx, packet_rx) = mpsc::channel(4);
        let (body_tx, mut body_rx) = mpsc::channel(4);
        let done = spawn(packet_rx, body_tx);

        packet_tx.send(packet("one")).await.unwrap();
        packet_tx.send(packet("two")).await.unwrap();
        drop(packet_tx);

        let first = body_rx.recv().await.unwrap().unwrap();
        let second = body_rx.recv().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from("data: one\n\n"));
        assert_eq!(second, Bytes::from("data: two\n\n"));
        assert!(body_rx.recv().await.is_none());
        done.await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_exits_on_disconnect() {
        let (packet_tx, packet_rx) = mpsc::channel(4);
        let (body_tx, body_rx) = mpsc::channel(4);
        let done = spawn(packet_rx, body_tx);

        drop(body_rx); // downstream gone
        packet_tx.send(packet("ignored")).await.unwrap();
        done.await.unwrap();
    }
}
