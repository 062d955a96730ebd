//! Stream wrapper that can look ahead without losing bytes
use bytes::BytesMut;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const INITIAL_CAPACITY: usize = 4 * 1024;

/// Buffers the start of a stream for inspection and replays it to readers.
///
/// Bytes pulled in with [`Prebuffered::buffer_more`] stay in the buffer until
/// consumed, either explicitly or by reading through the wrapper. Writes go
/// straight to the inner stream.
#[derive(Debug)]
pub struct Prebuffered<S> {
  inner: S,
  buf: BytesMut,
  max_len: usize,
}

impl<S: AsyncRead + Unpin> Prebuffered<S> {
  /// Wrap `inner`, buffering at most `max_len` bytes ahead.
  pub fn new(inner: S, max_len: usize) -> Self {
    Prebuffered {
      inner,
      buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
      max_len,
    }
  }

  /// Buffered bytes not yet consumed.
  pub fn buffer(&self) -> &[u8] {
    &self.buf
  }

  /// Whether the look-ahead bound has been reached.
  pub fn is_full(&self) -> bool {
    self.buf.len() >= self.max_len
  }

  /// Drop `n` buffered bytes from the front.
  pub fn consume(&mut self, n: usize) {
    let n = n.min(self.buf.len());
    let _ = self.buf.split_to(n);
  }

  /// Read more from the inner stream into the buffer. Returns 0 at EOF or
  /// when the buffer is full.
  pub async fn buffer_more(&mut self) -> io::Result<usize> {
    let room = self.max_len.saturating_sub(self.buf.len());
    if room == 0 {
      return Ok(0);
    }
    (&mut self.inner)
      .take(room as u64)
      .read_buf(&mut self.buf)
      .await
  }

  /// Buffer until at least `n` bytes are available. Returns false on EOF.
  pub async fn fill_to(&mut self, n: usize) -> io::Result<bool> {
    while self.buf.len() < n {
      if self.buffer_more().await? == 0 {
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// The wrapped stream.
  pub fn get_ref(&self) -> &S {
    &self.inner
  }

  /// Split into the inner stream and the unconsumed bytes.
  pub fn into_parts(self) -> (S, BytesMut) {
    (self.inner, self.buf)
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    out: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    if out.remaining() == 0 {
      return Poll::Ready(Ok(()));
    }
    if self.buf.is_empty() {
      return Pin::new(&mut self.inner).poll_read(cx, out);
    }
    let n = self.buf.len().min(out.remaining());
    let chunk = self.buf.split_to(n);
    out.put_slice(&chunk);
    Poll::Ready(Ok(()))
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[tokio::test]
  async fn buffered_bytes_are_replayed() {
    let mut p = Prebuffered::new(Cursor::new(b"CONNECT a:443".to_vec()), 7);
    assert_eq!(p.buffer_more().await.unwrap(), 7);
    assert_eq!(p.buffer(), b"CONNECT");
    assert!(p.is_full());
    assert_eq!(p.buffer_more().await.unwrap(), 0);
    let mut out = Vec::new();
    p.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"CONNECT a:443");
  }

  #[tokio::test]
  async fn consume_skips_inspected_prefix() {
    let mut p = Prebuffered::new(Cursor::new(b"abcdef".to_vec()), 64);
    assert!(p.fill_to(4).await.unwrap());
    p.consume(2);
    let mut out = Vec::new();
    p.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"cdef");
  }

  #[tokio::test]
  async fn fill_to_reports_eof() {
    let mut p = Prebuffered::new(Cursor::new(b"ab".to_vec()), 64);
    assert!(!p.fill_to(3).await.unwrap());
    assert_eq!(p.buffer(), b"ab");
  }
}
