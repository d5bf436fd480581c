use core::mem;

use bytes::{Buf, Bytes};

/// Iterate over `\r\n` separated chunks; a trailing chunk without the
/// terminator is yielded as-is.
pub(crate) fn lines_iter(bytes: Bytes) -> impl Iterator<Item = Bytes> {
    struct LinesIterator(Bytes);

    impl Iterator for LinesIterator {
        type Item = Bytes;

        fn next(&mut self) -> Option<Self::Item> {
            if self.0.is_empty() {
                return None;
            }

            Some(match memchr::memmem::find(&self.0, b"\r\n") {
                Some(i) => {
                    let chunk = self.0.split_to(i);
                    self.0.advance("\r\n".len());
                    chunk
                }
                None => mem::take(&mut self.0),
            })
        }
    }

    LinesIterator(bytes)
}
