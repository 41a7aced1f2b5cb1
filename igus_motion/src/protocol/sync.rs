/// Drops leading garbage from a reply buffer until it starts with `header`.
///
/// Returns true when the buffer now begins with the header. When the header
/// is not found, only the tail that could still be the beginning of a header
/// is kept.
pub fn align_to_header(buffer: &mut Vec<u8>, header: &[u8]) -> bool {
    if header.is_empty() || buffer.starts_with(header) {
        return true;
    }
    if let Some(pos) = buffer.windows(header.len()).position(|w| w == header) {
        buffer.drain(..pos);
        return true;
    }
    let keep = header.len() - 1;
    if buffer.len() > keep {
        let cut = buffer.len() - keep;
        buffer.drain(..cut);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discards_bytes_before_header() {
        let mut buf = vec![0x31, 0x5A, 0xFF, 10, 9, 0];
        assert!(align_to_header(&mut buf, &[0xFF, 10, 9]));
        assert_eq!(buf, vec![0xFF, 10, 9, 0]);
    }

    #[test]
    fn keeps_possible_partial_header() {
        let mut buf = vec![1, 2, 3, 0xFF, 10];
        assert!(!align_to_header(&mut buf, &[0xFF, 10, 9]));
        assert_eq!(buf, vec![0xFF, 10]);
    }
}
