//! Byte-chunk assembly
//!
//! Remote reads arrive as small chunks. Decoding works on larger units, so
//! chunks are accumulated until a threshold is crossed and then handed on as
//! one buffer. Peak memory per read is bounded by `threshold + largest chunk`.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use pin_project_lite::pin_project;

use crate::error::Result;

/// Synchronous accumulator for one in-flight read
#[derive(Debug)]
pub struct ChunkBuffer {
    buf: BytesMut,
    threshold: usize,
}

impl ChunkBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a chunk; returns the accumulated buffer once it exceeds the threshold
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.threshold {
            Some(self.take())
        } else {
            None
        }
    }

    /// Flush whatever remains at end of input
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

pin_project! {
    /// Stream adapter turning a chunk stream into threshold-sized buffers.
    ///
    /// An error from the inner stream is forwarded and ends the assembly;
    /// bytes buffered before the error are discarded.
    pub struct ChunkAssembler<S> {
        #[pin]
        inner: S,
        buffer: ChunkBuffer,
        done: bool,
    }
}

impl<S> ChunkAssembler<S> {
    pub fn new(inner: S, threshold: usize) -> Self {
        Self {
            inner,
            buffer: ChunkBuffer::new(threshold),
            done: false,
        }
    }
}

impl<S> Stream for ChunkAssembler<S>
where
    S: Stream<Item = Result<Bytes>>,
{
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    if let Some(full) = this.buffer.push(&chunk) {
                        return Poll::Ready(Some(Ok(full)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    return Poll::Ready(this.buffer.finish().map(Ok));
                }
            }
        }
    }
}
