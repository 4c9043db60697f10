//! CBOR push helpers for canonical encoders.
//!
//! Only definite-length items are emitted so that a given input always maps to
//! exactly one byte sequence.

pub fn push_map(buf: &mut Vec<u8>, len: u64) {
    push_header(buf, 5, len);
}

pub fn push_array(buf: &mut Vec<u8>, len: u64) {
    push_header(buf, 4, len);
}

pub fn push_text(buf: &mut Vec<u8>, text: &str) {
    let bytes = text.as_bytes();
    push_header(buf, 3, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn push_i64(buf: &mut Vec<u8>, value: i64) {
    if value >= 0 {
        push_header(buf, 0, value as u64);
    } else {
        // major type 1 encodes -1 - n
        push_header(buf, 1, (-1 - value) as u64);
    }
}

pub fn push_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(if value { 0xf5 } else { 0xf4 });
}

pub fn push_null(buf: &mut Vec<u8>) {
    buf.push(0xf6);
}

pub fn push_header(buf: &mut Vec<u8>, major: u8, len: u64) {
    assert!(major < 8);
    match len {
        0..=23 => buf.push((major << 5) | (len as u8)),
        24..=0xff => {
            buf.push((major << 5) | 24);
            buf.push(len as u8);
        }
        0x100..=0xffff => {
            buf.push((major << 5) | 25);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push((major << 5) | 26);
            buf.extend_from_slice(&(len as u32).to_be_bytes());
        }
        _ => {
            buf.push((major << 5) | 27);
            buf.extend_from_slice(&len.to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_uses_inline_length() {
        let mut buf = Vec::new();
        push_text(&mut buf, "io");
        assert_eq!(buf, vec![0x62, b'i', b'o']);
    }

    #[test]
    fn negative_integers_use_major_one() {
        let mut buf = Vec::new();
        push_i64(&mut buf, -1);
        push_i64(&mut buf, -500);
        assert_eq!(buf, vec![0x20, 0x39, 0x01, 0xf3]);
    }

    #[test]
    fn integers_decode_with_serde_cbor() {
        for n in [0i64, 23, 24, 255, 256, 65_536, -24, -25, i64::MAX, i64::MIN] {
            let mut buf = Vec::new();
            push_i64(&mut buf, n);
            let decoded: i64 = serde_cbor::from_slice(&buf).unwrap();
            assert_eq!(decoded, n);
        }
    }

    #[test]
    fn simple_values() {
        let mut buf = Vec::new();
        push_bool(&mut buf, true);
        push_bool(&mut buf, false);
        push_null(&mut buf);
        assert_eq!(buf, vec![0xf5, 0xf4, 0xf6]);
    }
}
