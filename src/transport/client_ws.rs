//! Byte-stream view over a client-dialed WebSocket connection.
//!
//! The server side has axum's `WebSocket` to lean on (see [`super::ws_adapter`]);
//! the client side only has the hand-rolled [`super::websocket::WebSocketStream`]
//! frame codec, whose own `AsyncRead`/`AsyncWrite` impls are a raw passthrough
//! and don't do any framing. This wraps `read_frame`/`write_frame` into a
//! poll-based adapter the same way `AxumWsStream` wraps axum's `Stream`/`Sink`,
//! so the relay engine (C3) can drive either side identically.
//!
//! Frames move in and out by value: each pending operation takes `inner` out
//! of `self` and moves it into a boxed future, handing it back once the
//! future resolves. Only one of a read or a write is ever in flight against
//! `self` at a time (`tokio::io::split` serializes access through its own
//! lock), so this never needs to reconcile concurrent borrows of `inner`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::websocket::{OpCode, WebSocketStream};
use crate::Result;

type ReadFut<S> = Pin<Box<dyn Future<Output = (WebSocketStream<S>, Result<(OpCode, Vec<u8>)>)> + Send>>;
type WriteFut<S> = Pin<Box<dyn Future<Output = (WebSocketStream<S>, Result<()>)> + Send>>;

pub struct ClientWsStream<S> {
    inner: Option<WebSocketStream<S>>,
    pending: BytesMut,
    read_fut: Option<ReadFut<S>>,
    write_fut: Option<WriteFut<S>>,
}

impl<S> ClientWsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        ClientWsStream {
            inner: Some(inner),
            pending: BytesMut::new(),
            read_fut: None,
            write_fut: None,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncRead for ClientWsStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = std::cmp::min(buf.remaining(), self.pending.len());
                buf.put_slice(&self.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            if self.read_fut.is_none() {
                let mut ws = self
                    .inner
                    .take()
                    .expect("ClientWsStream: inner missing while idle");
                self.read_fut = Some(Box::pin(async move {
                    let result = ws.read_frame().await;
                    (ws, result)
                }));
            }

            let fut = self.read_fut.as_mut().unwrap();
            match fut.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready((ws, result)) => {
                    self.inner = Some(ws);
                    self.read_fut = None;
                    match result {
                        Ok((OpCode::Binary, data)) | Ok((OpCode::Text, data)) => {
                            self.pending.extend_from_slice(&data);
                        }
                        Ok((OpCode::Close, _)) => return Poll::Ready(Ok(())),
                        Ok((OpCode::Ping, _)) | Ok((OpCode::Pong, _)) | Ok((OpCode::Continuation, _)) => {}
                        Err(e) => return Poll::Ready(Err(std::io::Error::other(e.to_string()))),
                    }
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncWrite for ClientWsStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_fut.is_none() {
            let mut ws = self
                .inner
                .take()
                .expect("ClientWsStream: inner missing while idle");
            let data = buf.to_vec();
            self.write_fut = Some(Box::pin(async move {
                let result = ws.write_frame(OpCode::Binary, &data, true).await;
                (ws, result)
            }));
        }

        let fut = self.write_fut.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready((ws, result)) => {
                self.inner = Some(ws);
                self.write_fut = None;
                match result {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
                }
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if let Some(fut) = self.write_fut.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready((ws, result)) => {
                    self.inner = Some(ws);
                    self.write_fut = None;
                    if let Err(e) = result {
                        return Poll::Ready(Err(std::io::Error::other(e.to_string())));
                    }
                }
            }
        }
        match self.inner.as_mut() {
            Some(ws) => Pin::new(ws).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        match self.inner.as_mut() {
            Some(ws) => Pin::new(ws).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn round_trips_a_binary_message() {
        let (client_raw, mut server_raw) = tokio::io::duplex(4096);
        let mut client = ClientWsStream::new(WebSocketStream::new(client_raw));

        let server_task = tokio::spawn(async move {
            // Read the masked client frame header + payload by hand.
            let mut header = [0u8; 2];
            server_raw.read_exact(&mut header).await.unwrap();
            let len = (header[1] & 0x7F) as usize;
            let mut key = [0u8; 4];
            server_raw.read_exact(&mut key).await.unwrap();
            let mut payload = vec![0u8; len];
            server_raw.read_exact(&mut payload).await.unwrap();
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= key[i % 4];
            }
            payload
        });

        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();
        let received = server_task.await.unwrap();
        assert_eq!(received, b"hello");
    }
}
