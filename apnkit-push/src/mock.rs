//! In-memory connector for tests and dry runs.
//!
//! Sessions record every byte written, serve scripted feedback bytes,
//! and remember whether they were shut down.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::connection::{Connector, Gateway, Session, Timeouts};
use crate::{Credential, PushError, Result};

#[derive(Default)]
struct MockState {
    written: Vec<u8>,
    feedback: Vec<u8>,
    connections: Vec<(Gateway, Credential)>,
    closed: usize,
    writes: usize,
    refuse: bool,
    fail_after_writes: Option<usize>,
    read_chunk: Option<usize>,
}

/// Connector handing out in-memory sessions.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// Create a connector that accepts every session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bytes` to every feedback session.
    pub fn with_feedback(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.state.lock().feedback = bytes.into();
        self
    }

    /// Fail every connection attempt with a connection error.
    pub fn refuse_connections(self) -> Self {
        self.state.lock().refuse = true;
        self
    }

    /// Break the socket after `count` successful writes.
    pub fn fail_after_writes(self, count: usize) -> Self {
        self.state.lock().fail_after_writes = Some(count);
        self
    }

    /// Return at most `size` bytes per read.
    pub fn read_chunk(self, size: usize) -> Self {
        self.state.lock().read_chunk = Some(size.max(1));
        self
    }

    /// All bytes written across sessions.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Number of sessions opened.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Gateways sessions were opened for, in order.
    pub fn gateways(&self) -> Vec<Gateway> {
        self.state.lock().connections.iter().map(|(g, _)| *g).collect()
    }

    /// Credentials sessions were opened with, in order.
    pub fn credentials(&self) -> Vec<Credential> {
        self.state.lock().connections.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Whether every opened session was shut down.
    pub fn all_closed(&self) -> bool {
        let state = self.state.lock();
        state.closed == state.connections.len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, credential: &Credential, gateway: Gateway) -> Result<Session> {
        let feedback = {
            let mut state = self.state.lock();
            if state.refuse {
                return Err(PushError::Connection("connection refused".into()));
            }
            state.connections.push((gateway, credential.clone()));
            match gateway {
                Gateway::Feedback => state.feedback.clone(),
                Gateway::Delivery => Vec::new(),
            }
        };

        let stream = MockStream {
            state: self.state.clone(),
            input: feedback,
            position: 0,
        };
        Ok(Session::new(stream, gateway, Timeouts::default()))
    }
}

struct MockStream {
    state: Arc<Mutex<MockState>>,
    input: Vec<u8>,
    position: usize,
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let chunk = self.state.lock().read_chunk.unwrap_or(usize::MAX);
        let remaining = &self.input[self.position..];
        let n = remaining.len().min(buf.remaining()).min(chunk);
        buf.put_slice(&remaining[..n]);
        self.position += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        if let Some(limit) = state.fail_after_writes {
            if state.writes >= limit {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "connection reset by gateway",
                )));
            }
        }
        state.writes += 1;
        state.written.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.state.lock().closed += 1;
        Poll::Ready(Ok(()))
    }
}
