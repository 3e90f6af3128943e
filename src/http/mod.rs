pub mod chunk;
pub mod parser;
pub mod url;

pub(crate) const CRLF: &[u8] = b"\r\n";

/// Splits one CRLF-terminated line off the front of `data`. Returns the line
/// (without its CRLF) and the remainder, or `None` when no full line has
/// arrived yet; the caller keeps the unconsumed tail for the next read.
pub(crate) fn split_line(data: &[u8]) -> Option<(&[u8], &[u8])> {
    use bstr::ByteSlice;

    let pos = data.find(CRLF)?;
    Some((&data[..pos], &data[pos + CRLF.len()..]))
}
