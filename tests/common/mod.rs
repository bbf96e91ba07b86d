#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use codec::frame::{Decoder, encode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Installs a log sink so failing tests leave a trace of what the node did.
/// Safe to call repeatedly; only the first call wins.
pub fn init_logging() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .env()
        .init();
}

/// Raw framed client used to observe the exact frames on the wire, byte for
/// byte.
pub struct TestClient {
    stream: TcpStream,
    decoder: Decoder,
    buffer: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        init_logging();
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        Self {
            stream,
            decoder: Decoder::default(),
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Connects to a curve listener: presents `pubkey` in the transport
    /// preamble and returns the listener's identity.
    pub async fn connect_curve(addr: SocketAddr, pubkey: [u8; 32]) -> (Self, [u8; 32]) {
        let mut client = Self::connect(addr).await;
        client.stream.write_all(&pubkey).await.unwrap();

        let mut remote = [0u8; 32];
        client.stream.read_exact(&mut remote).await.unwrap();
        (client, remote)
    }

    /// Performs the HI/HELLO handshake and asserts the reply is a single
    /// HELLO frame.
    pub async fn handshake(&mut self) {
        self.send(&[b"HI"]).await;
        assert_eq!(self.recv().await, frames(&[b"HELLO"]));
    }

    pub async fn send(&mut self, parts: &[&[u8]]) {
        let parts: Vec<Bytes> = parts.iter().map(|part| Bytes::copy_from_slice(part)).collect();
        let mut wire = BytesMut::new();
        encode(&parts, &mut wire);
        self.stream.write_all(&wire).await.expect("send failed");
    }

    /// Receives one complete multipart message.
    pub async fn recv(&mut self) -> Vec<Bytes> {
        tokio::time::timeout(RESPONSE_TIMEOUT, async {
            loop {
                if let Some(message) = self
                    .decoder
                    .decode(&mut self.buffer)
                    .expect("framing violation from server")
                {
                    return message;
                }

                let read = self
                    .stream
                    .read_buf(&mut self.buffer)
                    .await
                    .expect("read failed");
                assert!(read > 0, "server closed the connection");
            }
        })
        .await
        .expect("timed out waiting for a response")
    }

    /// Asserts the server closes the connection without sending anything.
    pub async fn expect_close(&mut self) {
        tokio::time::timeout(RESPONSE_TIMEOUT, async {
            loop {
                let read = self.stream.read_buf(&mut self.buffer).await.expect("read failed");
                if read == 0 {
                    assert!(self.buffer.is_empty(), "server sent data before closing");
                    return;
                }
            }
        })
        .await
        .expect("timed out waiting for the server to close")
    }
}

pub fn frames(parts: &[&[u8]]) -> Vec<Bytes> {
    parts.iter().map(|part| Bytes::copy_from_slice(part)).collect()
}
