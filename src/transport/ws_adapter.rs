//! Byte-stream view over an axum WebSocket connection.
//!
//! axum's `WebSocket` is a `Stream`/`Sink` of [`Message`]; the relay engine
//! (C3) wants a plain `AsyncRead + AsyncWrite`. This re-chunks the
//! stream-of-messages into a byte-stream view per the design note in §9:
//! non-binary control frames (ping/pong/close) are consumed transparently,
//! and each inbound binary message's payload is handed out across however
//! many `poll_read` calls it takes to drain it.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct AxumWsStream {
    inner: WebSocket,
    pending: BytesMut,
}

impl AxumWsStream {
    pub fn new(inner: WebSocket) -> Self {
        AxumWsStream {
            inner,
            pending: BytesMut::new(),
        }
    }
}

impl AsyncRead for AxumWsStream {
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

            let item = match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(item)) => item,
                Poll::Ready(None) => return Poll::Ready(Ok(())), // EOF
                Poll::Pending => return Poll::Pending,
            };

            let message = match item {
                Ok(m) => m,
                Err(e) => return Poll::Ready(Err(std::io::Error::other(e.to_string()))),
            };

            match message {
                Message::Binary(data) => {
                    self.pending.extend_from_slice(&data);
                }
                Message::Text(text) => {
                    self.pending.extend_from_slice(text.as_bytes());
                }
                Message::Close(_) => return Poll::Ready(Ok(())), // EOF
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }
}

impl AsyncWrite for AxumWsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(std::io::Error::other(e.to_string()))),
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec().into())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}
