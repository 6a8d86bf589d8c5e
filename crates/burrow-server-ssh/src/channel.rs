//! Byte-stream adapters over a russh session channel
//!
//! russh delivers channel traffic as messages. The broker session wants an
//! `AsyncRead` for what the operator sends and an `AsyncWrite` for what the
//! operator sees; each adapter runs a small pump task to bridge the two.

use bytes::{Buf, Bytes};
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Chunks buffered between the channel and the reader
const INPUT_QUEUE_DEPTH: usize = 32;

/// Operator input: channel data until EOF or close
pub struct ChannelInput {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    pump: Option<JoinHandle<()>>,
}

impl ChannelInput {
    pub fn new(channel: Channel<Msg>) -> Self {
        let (tx, rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let pump = tokio::spawn(pump_input(channel, tx));

        Self {
            rx,
            pending: Bytes::new(),
            pump: Some(pump),
        }
    }

    /// Input fed from `rx` directly; the stream ends when every sender is gone
    pub fn from_receiver(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
            pump: None,
        }
    }
}

async fn pump_input(mut channel: Channel<Msg>, tx: mpsc::Sender<Bytes>) {
    let id = channel.id();

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => {
                if data.is_empty() {
                    continue;
                }
                if tx.send(Bytes::copy_from_slice(data)).await.is_err() {
                    break;
                }
            }
            ChannelMsg::Eof => {
                debug!("EOF on channel {:?}", id);
                break;
            }
            ChannelMsg::Close => break,
            other => trace!("Ignoring channel message {:?}", other),
        }
    }
}

impl AsyncRead for ChannelInput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending = chunk,
                // Sender gone: end of stream
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);

        Poll::Ready(Ok(()))
    }
}

impl Drop for ChannelInput {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Operator output: writes become channel data; shutdown sends EOF and closes
pub struct ChannelOutput {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ChannelOutput {
    pub fn new(handle: Handle, id: ChannelId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_output(handle, id, rx));

        Self { tx: Some(tx) }
    }

    /// Output delivered to `tx` directly; shutdown drops the sender
    pub fn from_sender(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx: Some(tx) }
    }
}

async fn pump_output(
    handle: Handle,
    id: ChannelId,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(chunk) = rx.recv().await {
        if handle.data(id, CryptoVec::from_slice(&chunk)).await.is_err() {
            debug!("Channel {:?} gone, dropping session output", id);
            return;
        }
    }

    // Writer shut down or dropped
    let _ = handle.eof(id).await;
    let _ = handle.close(id).await;
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")
}

impl AsyncWrite for ChannelOutput {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let Some(tx) = self.tx.as_ref() else {
            return Poll::Ready(Err(closed()));
        };

        match tx.send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.take();
        Poll::Ready(Ok(()))
    }
}
