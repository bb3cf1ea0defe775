// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

//! One-shot request/reply message channel.
//!
//! Every protocol exchange is a single round-trip: the caller connects,
//! writes one frame, awaits one frame and closes. A frame is a `u32-le`
//! length prefix followed by the `Serializable` bytes of a [`Message`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use node_data::message::{Message, Metadata};
use node_data::Serializable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Upper bound on a single frame. A cluster model for a large network fits
/// well below this; anything larger is a protocol violation.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Default per-call timeout covering connect, send and reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Performs one request/reply round-trip.
    ///
    /// Returns `None` when the peer is unreachable, misbehaves or does not
    /// answer within the call timeout. Callers fall back to their own
    /// retry/backoff policies; a silent peer is never an abort.
    async fn call(&self, addr: SocketAddr, msg: &Message) -> Option<Message>;

    /// Checks whether a peer accepts connections at all.
    async fn reachable(&self, addr: SocketAddr) -> bool;
}

/// TCP implementation of [`Channel`]. Stateless: every call opens a fresh
/// connection.
#[derive(Debug, Clone)]
pub struct TcpChannel {
    call_timeout: Duration,
}

impl Default for TcpChannel {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl TcpChannel {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    async fn call_inner(
        &self,
        addr: SocketAddr,
        msg: &Message,
    ) -> anyhow::Result<Message> {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, msg).await?;
        stream.shutdown().await.ok();

        let reply = read_frame(&mut stream).await?;
        Ok(reply)
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn call(&self, addr: SocketAddr, msg: &Message) -> Option<Message> {
        let fut = self.call_inner(addr, msg);
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(e)) => {
                debug!(event = "call_failed", peer = %addr, err = %e);
                None
            }
            Err(_) => {
                debug!(event = "call_timeout", peer = %addr);
                None
            }
        }
    }

    async fn reachable(&self, addr: SocketAddr) -> bool {
        tokio::time::timeout(self.call_timeout, TcpStream::connect(addr))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(w: &mut W, msg: &Message) -> anyhow::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    msg.write(&mut buf)?;

    w.write_all(&(buf.len() as u32).to_le_bytes()).await?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R>(r: &mut R) -> anyhow::Result<Message>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame of {len} bytes exceeds the frame limit");
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;

    Ok(Message::read(&mut &buf[..])?)
}

/// Resolves a `host:port` string to a socket address.
pub fn resolve(addr: &str) -> Option<SocketAddr> {
    use std::net::ToSocketAddrs;
    addr.to_socket_addrs().ok()?.next()
}

/// Best-effort detection of the outbound interface IP. No packet is sent;
/// connecting a UDP socket only selects a route.
pub fn detect_local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".into())
}

/// One-message-in/one-reply-out endpoint handler.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produces the reply for an inbound message. `None` closes the
    /// connection without replying.
    async fn handle(&self, msg: Message) -> Option<Message>;
}

/// Runs an accept loop on an already-bound listener, dispatching one task
/// per inbound connection. Concurrency is bounded to shield the handler
/// from connection floods.
///
/// An error inside one connection never aborts the loop; it is logged and
/// the connection is dropped.
pub async fn serve<H: RequestHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    max_inflight: usize,
) -> anyhow::Result<usize> {
    let permits = Arc::new(Semaphore::new(max_inflight));

    loop {
        let permit = permits.clone().acquire_owned().await?;
        let (stream, peer) = listener.accept().await?;
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer, handler).await {
                debug!(event = "conn_failed", peer = %peer, err = %e);
            }
            drop(permit);
        });
    }
}

async fn serve_connection<H: RequestHandler>(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
) -> anyhow::Result<()> {
    let mut msg = match read_frame(&mut stream).await {
        Ok(msg) => msg,
        Err(e) => {
            // Protocol mismatch: reply with an error frame, no state change.
            warn!(event = "malformed_request", peer = %peer, err = %e);
            let reply = Message::new_error("malformed request");
            write_frame(&mut stream, &reply).await.ok();
            return Ok(());
        }
    };
    msg.metadata = Some(Metadata { src_addr: peer });

    if let Some(reply) = handler.handle(msg).await {
        write_frame(&mut stream, &reply).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_data::message::Payload;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, msg: Message) -> Option<Message> {
            assert!(msg.metadata.is_some());
            Some(Message::from_marker(Payload::Ack))
        }
    }

    #[tokio::test]
    async fn round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(Echo), 8));

        let channel = TcpChannel::default();
        let reply = channel
            .call(addr, &Message::new_polling(1, "agent-a"))
            .await
            .expect("peer replies");
        assert!(matches!(reply.payload, Payload::Ack));
    }

    #[tokio::test]
    async fn silent_peer_yields_none() {
        // Nothing listens on this port.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let channel = TcpChannel::new(Duration::from_millis(200));
        assert!(channel
            .call(addr, &Message::new_polling(0, "agent-a"))
            .await
            .is_none());
        assert!(!channel.reachable(addr).await);
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(Echo), 8));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Length says 3 bytes, body is an unknown topic.
        stream.write_all(&3u32.to_le_bytes()).await.unwrap();
        stream.write_all(&[0xAA, 0x01, 0x02]).await.unwrap();

        let reply = read_frame(&mut stream).await.unwrap();
        assert!(matches!(reply.payload, Payload::Error(_)));
    }
}
