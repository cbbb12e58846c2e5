//! Per-connection input buffering and the query protocol (§4.7).
//!
//! A client may pipeline several newline-terminated queries on one
//! connection. [`ClientBuffer::service`] corresponds to exactly one
//! readiness notification from the Connection multiplexer: read whatever is
//! currently available, answer every query line that's now complete, and
//! shift the unconsumed tail to the front. The buffer never shrinks while
//! the connection is open.

use std::io;

use async_recursion::async_recursion;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::path_util;
use crate::tree::{self, NodeRef};

const INITIAL_CAPACITY: usize = 1024;

pub struct ClientBuffer {
    stream: UnixStream,
    buf: Vec<u8>,
    used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Close,
}

impl ClientBuffer {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buf: vec![0; INITIAL_CAPACITY],
            used: 0,
        }
    }

    /// Reads one batch of input, answers every complete query line it
    /// produces, and compacts the buffer. Returns `Close` on hang-up or on
    /// a non-retryable I/O error, in which case the caller drops this
    /// connection without calling `service` on it again.
    pub async fn service(&mut self, root: &NodeRef) -> Outcome {
        // Always keep one trailing byte free — the buffer's line-extraction
        // terminator slot (§3 Client buffer invariant) — in addition to at
        // least one byte of read room.
        if self.buf.len() - self.used <= 1 {
            self.grow();
        }

        let read_to = self.buf.len() - 1;
        let n = match self.stream.read(&mut self.buf[self.used..read_to]).await {
            Ok(0) => return Outcome::Close,
            Ok(n) => n,
            Err(why) if is_retryable(&why) => return Outcome::Continue,
            Err(_) => return Outcome::Close,
        };
        self.used += n;

        loop {
            let newline = match self.buf[..self.used].iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => break,
            };
            let query: Vec<u8> = self.buf[..newline].to_vec();
            if self.answer(root, &query).await == Outcome::Close {
                return Outcome::Close;
            }
            let tail_len = self.used - (newline + 1);
            self.buf.copy_within(newline + 1..self.used, 0);
            self.used = tail_len;
        }

        Outcome::Continue
    }

    /// Runs the substring traversal for one query line, streaming matches
    /// back as they're found, then writes the end-of-results blank line.
    async fn answer(&mut self, root: &NodeRef, query: &[u8]) -> Outcome {
        if stream_matches(&mut self.stream, root, query).await.is_err() {
            return Outcome::Close;
        }
        if write_retrying(&mut self.stream, b"\n").await.is_err() {
            return Outcome::Close;
        }
        Outcome::Continue
    }

    fn grow(&mut self) {
        let new_len = (self.buf.len() * 2).max(INITIAL_CAPACITY);
        self.buf.resize(new_len, 0);
    }
}

#[async_recursion(?Send)]
async fn stream_matches(stream: &mut UnixStream, node: &NodeRef, query: &[u8]) -> Result<(), ()> {
    let path = tree::absolute_name(node);
    if path_util::contains_subslice(&path, query) {
        write_retrying(stream, &path).await?;
        write_retrying(stream, b"\n").await?;
    }
    let children: Option<Vec<NodeRef>> = node.borrow().dir.as_ref().map(|d| d.children.clone());
    if let Some(children) = children {
        for child in &children {
            stream_matches(stream, child, query).await?;
        }
    }
    Ok(())
}

/// Writes `bytes` fully, transparently retrying on interruption or
/// temporary unavailability (§4.7); any other error aborts the traversal
/// and the caller disconnects the client.
async fn write_retrying(stream: &mut UnixStream, bytes: &[u8]) -> Result<(), ()> {
    loop {
        match stream.write_all(bytes).await {
            Ok(()) => return Ok(()),
            Err(why) if is_retryable(&why) => continue,
            Err(_) => return Err(()),
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::new_node;

    #[tokio::test]
    async fn service_closes_on_clean_hang_up() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(client);
        let mut buf = ClientBuffer::new(server);
        let root = crate::tree::new_root();
        assert_eq!(buf.service(&root).await, Outcome::Close);
    }

    #[tokio::test]
    async fn answer_streams_matches_then_blank_line() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let root = crate::tree::new_root();
        let a = new_node(b"a".to_vec());
        a.borrow_mut().indexed = true;
        crate::tree::add_child(&root, a);

        let mut buf = ClientBuffer::new(server);
        client.write_all(b"a\n").await.unwrap();

        buf.service(&root).await;

        let mut out = [0u8; 64];
        let n = client.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"/a\n\n");
    }
}
