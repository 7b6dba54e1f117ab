//! Stream filters
//!
//! A filter wraps one direction of a channel's byte stream. The wrapper owns
//! the inner reader, so dropping it drops the original; reads are forwarded
//! as they arrive and never buffered beyond a single carried-over byte.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::config::FilterKind;

/// Owned, type-erased byte source
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Transform applied to a readable byte stream
pub trait StreamFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn wrap(&self, inner: BoxedReader) -> BoxedReader;
}

/// Filter for the configured kind
pub fn filter_for(kind: FilterKind) -> Arc<dyn StreamFilter> {
    match kind {
        FilterKind::Crlf => Arc::new(LineEndings),
        FilterKind::None => Arc::new(Passthrough),
    }
}

/// Byte-identical pass-through
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl StreamFilter for Passthrough {
    fn name(&self) -> &'static str {
        "none"
    }

    fn wrap(&self, inner: BoxedReader) -> BoxedReader {
        inner
    }
}

/// Rewrites every `\n` as `\r\n`
#[derive(Debug, Clone, Copy, Default)]
pub struct LineEndings;

impl StreamFilter for LineEndings {
    fn name(&self) -> &'static str {
        "crlf"
    }

    fn wrap(&self, inner: BoxedReader) -> BoxedReader {
        Box::new(LineEndingsReader::new(inner))
    }
}

/// Reader behind [`LineEndings`]
pub struct LineEndingsReader<R> {
    inner: R,
    scratch: Vec<u8>,
    /// `\n` still owed from a previous read whose buffer ran out after `\r`
    pending_newline: bool,
}

impl<R> LineEndingsReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
            pending_newline: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LineEndingsReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.pending_newline {
            buf.put_slice(b"\n");
            this.pending_newline = false;
            return Poll::Ready(Ok(()));
        }

        // Each input byte expands to at most two, so reading half the free
        // space (rounded up) overflows by at most the final `\n`.
        let want = buf.remaining().div_ceil(2);
        if this.scratch.len() < want {
            this.scratch.resize(want, 0);
        }

        let mut inner_buf = ReadBuf::new(&mut this.scratch[..want]);
        match Pin::new(&mut this.inner).poll_read(cx, &mut inner_buf) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        for &byte in inner_buf.filled() {
            if byte == b'\n' {
                buf.put_slice(b"\r");
                if buf.remaining() == 0 {
                    this.pending_newline = true;
                    break;
                }
            }
            buf.put_slice(&[byte]);
        }

        Poll::Ready(Ok(()))
    }
}
