//! Request encoding
//!
//! A command is always sent as an array of bulk strings:
//! `*<argc>\r\n` followed by `$<len>\r\n<bytes>\r\n` per argument.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::OnceLock;

const CRLF: &[u8] = b"\r\n";

/// Decimal text for 0..=255, precomputed once so length prefixes of small
/// arguments avoid integer formatting on the hot path.
fn small_decimals() -> &'static [Vec<u8>; 256] {
    static TABLE: OnceLock<[Vec<u8>; 256]> = OnceLock::new();
    TABLE.get_or_init(|| std::array::from_fn(|i| i.to_string().into_bytes()))
}

fn put_decimal(buf: &mut BytesMut, n: usize) {
    if n < 256 {
        buf.put_slice(&small_decimals()[n]);
    } else {
        buf.put_slice(n.to_string().as_bytes());
    }
}

/// Encode one command (argument list, command token first) into `buf`.
///
/// A `None` argument encodes as the null bulk `$-1\r\n`; an empty argument
/// as the zero-length bulk `$0\r\n\r\n`.
pub fn encode_command(args: &[Option<Bytes>], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    put_decimal(buf, args.len());
    buf.put_slice(CRLF);

    for arg in args {
        match arg {
            None => buf.put_slice(b"$-1\r\n"),
            Some(arg) => {
                buf.put_u8(b'$');
                put_decimal(buf, arg.len());
                buf.put_slice(CRLF);
                buf.put_slice(arg);
                buf.put_slice(CRLF);
            }
        }
    }
}

/// Encode a command given as plain byte slices.
pub fn encode_args(args: &[&[u8]], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    put_decimal(buf, args.len());
    buf.put_slice(CRLF);

    for arg in args {
        buf.put_u8(b'$');
        put_decimal(buf, arg.len());
        buf.put_slice(CRLF);
        buf.put_slice(arg);
        buf.put_slice(CRLF);
    }
}
