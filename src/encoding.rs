//! Text rendering of captured payload bytes.
//!
//! The output can be placed between double quotes on a single NDJSON line as-is: quotes,
//! backslashes and the common control characters get a backslash escape, printable ASCII is
//! kept verbatim, and everything else becomes `%XX`. A literal `%` is written as `%25` so the
//! percent escapes stay unambiguous.

const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x08 => out.push_str("\\b"),
            0x0C => out.push_str("\\f"),
            b'%' => out.push_str("%25"),
            0x20..=0x7E => out.push(byte as char),
            _ => {
                out.push('%');
                out.push(HEX_UPPER[(byte >> 4) as usize] as char);
                out.push(HEX_UPPER[(byte & 0x0F) as usize] as char);
            }
        }
    }
    out
}
