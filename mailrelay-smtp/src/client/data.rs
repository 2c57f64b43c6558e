//! Message body framing for the DATA phase.

/// Frames raw message bytes for transmission after `DATA`.
///
/// Line endings are normalized to CRLF, lines starting with `.` get an extra
/// leading dot (RFC 5321 section 4.5.2), and the terminating `.` line is
/// appended. The input is treated as opaque bytes, so 8-bit content passes
/// through untouched.
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 5);
    let mut at_line_start = true;
    let mut previous = None;

    for &byte in data {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }

        if byte == b'\n' && previous != Some(b'\r') {
            out.push(b'\r');
        }

        out.push(byte);
        at_line_start = byte == b'\n';
        previous = Some(byte);
    }

    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b".\r\n");
    out
}
