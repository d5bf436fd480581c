use core::array;

use bytes::{Buf, Bytes};

/// Split a control line into at most 6 space or tab separated chunks,
/// collapsing runs of separators.
pub(crate) fn split_spaces(mut bytes: Bytes) -> impl Iterator<Item = Bytes> {
    let mut chunks = array::from_fn::<_, 6, _>(|_| Bytes::new());
    let mut found = 0;

    for chunk in &mut chunks {
        let Some(i) = memchr::memchr2(b' ', b'\t', &bytes) else {
            if !bytes.is_empty() {
                *chunk = bytes;
                found += 1;
            }
            break;
        };

        *chunk = bytes.split_to(i);
        found += 1;

        let separators = bytes
            .iter()
            .take_while(|b| matches!(b, b' ' | b'\t'))
            .count();
        bytes.advance(separators);
    }

    chunks.into_iter().take(found)
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use bytes::Bytes;

    use super::split_spaces;

    #[test]
    fn splits_and_collapses_separators() {
        let chunks: Vec<_> =
            split_spaces(Bytes::from_static(b"orders.created  9 \t _INBOX.a.1  11")).collect();
        assert_eq!(
            chunks,
            [
                Bytes::from_static(b"orders.created"),
                Bytes::from_static(b"9"),
                Bytes::from_static(b"_INBOX.a.1"),
                Bytes::from_static(b"11"),
            ]
        );
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert_eq!(0, split_spaces(Bytes::new()).count());
    }
}
