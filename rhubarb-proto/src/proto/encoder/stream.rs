#[cfg(feature = "std")]
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::util::BufList;

use super::{ClientOp, WriteFrame};

/// Payloads at least this large are kept as their own chunk instead of
/// being copied into the flattened buffer
const PAYLOAD_CHUNK_THRESHOLD: usize = 4096;

/// The outgoing write buffer
///
/// Frames are appended with [`StreamEncoder::enqueue_write_op`] and
/// drained through the [`Buf`] implementation. Short protocol text
/// accumulates in a single flattened `BytesMut`; large payloads ride
/// along as separate `Bytes` chunks so the transport can use vectored
/// writes without copying them.
#[derive(Debug)]
pub struct StreamEncoder {
    chunks: BufList<Bytes>,
    flattened: BytesMut,
}

impl StreamEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: BufList::new(),
            flattened: BytesMut::new(),
        }
    }

    pub fn enqueue_write_op(&mut self, item: &ClientOp) {
        super::encode(self, item);
    }

    #[cfg(test)]
    fn all_bytes(&mut self) -> alloc::vec::Vec<u8> {
        self.copy_to_bytes(self.remaining()).to_vec()
    }
}

impl Buf for StreamEncoder {
    fn remaining(&self) -> usize {
        self.chunks.remaining() + self.flattened.remaining()
    }

    fn has_remaining(&self) -> bool {
        self.chunks.has_remaining() || self.flattened.has_remaining()
    }

    fn chunk(&self) -> &[u8] {
        let chunk = self.chunks.chunk();
        if chunk.is_empty() {
            &self.flattened
        } else {
            chunk
        }
    }

    #[cfg(feature = "std")]
    fn chunks_vectored<'a>(&'a self, dst: &mut [io::IoSlice<'a>]) -> usize {
        let mut n = self.chunks.chunks_vectored(dst);
        n += self.flattened.chunks_vectored(&mut dst[n..]);
        n
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining());

        let mid = self.chunks.remaining().min(cnt);
        self.chunks.advance(mid);

        let rem = cnt - mid;
        if rem == self.flattened.len() {
            // Keeps the allocation reusable, unlike `advance`
            self.flattened.clear();
        } else {
            self.flattened.advance(rem);
        }
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        assert!(
            len <= self.remaining(),
            "copy_to_bytes out of range ({} <= {})",
            len,
            self.remaining()
        );

        if self.chunks.remaining() >= len {
            self.chunks.copy_to_bytes(len)
        } else if !self.chunks.has_remaining() {
            self.flattened.copy_to_bytes(len)
        } else {
            let rem = len - self.chunks.remaining();

            let mut bufs = BytesMut::with_capacity(len);
            bufs.put(&mut self.chunks);
            bufs.put_slice(&self.flattened[..rem]);

            if self.flattened.remaining() == rem {
                self.flattened.clear();
            } else {
                self.flattened.advance(rem);
            }

            bufs.freeze()
        }
    }
}

impl WriteFrame for StreamEncoder {
    fn put_small(&mut self, buf: &[u8]) {
        self.flattened.extend_from_slice(buf);
    }

    fn put_payload<B>(&mut self, buf: B)
    where
        B: Into<Bytes> + AsRef<[u8]>,
    {
        let b = buf.as_ref();

        let len = b.len();
        if len == 0 {
            return;
        }

        if len < PAYLOAD_CHUNK_THRESHOLD {
            self.flattened.extend_from_slice(b);
        } else {
            if !self.flattened.is_empty() {
                let buffered = self.flattened.split().freeze();
                self.chunks.push(buffered);
            }

            self.chunks.push(buf.into());
        }
    }
}

impl Default for StreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}
