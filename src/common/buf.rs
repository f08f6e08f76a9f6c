use bytes::Bytes;

/// Copies `src` into a single `Bytes`, reusing it when already contiguous.
pub(crate) fn to_bytes(src: Vec<Bytes>) -> Bytes {
    match src.len() {
        0 => Bytes::new(),
        1 => src.into_iter().next().unwrap_or_else(Bytes::new),
        _ => {
            let len = src.iter().map(Bytes::len).sum();
            let mut out = Vec::with_capacity(len);
            for chunk in src {
                out.extend_from_slice(&chunk);
            }
            Bytes::from(out)
        }
    }
}
