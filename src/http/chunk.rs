use anyhow::Result;
use bstr::{BString, ByteSlice};

use super::{CRLF, split_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    WaitingSize,
    WaitingData,
    Complete,
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies.
///
/// Bytes go in through [`feed`](ChunkParser::feed); payloads accumulate into
/// [`body`](ChunkParser::body). The state reaches `Complete` once the
/// zero-size chunk and its trailing CRLF have been consumed. Input that does
/// not yet form a complete size line or trailing CRLF is carried over to the
/// next call, so the decoded body does not depend on how the stream was
/// fragmented.
#[derive(Debug)]
pub struct ChunkParser {
    state: ChunkState,
    body: BString,
    chunk: BString,
    size: Option<usize>,
    pending: BString,
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkParser {
    pub fn new() -> Self {
        Self {
            state: ChunkState::WaitingSize,
            body: BString::default(),
            chunk: BString::default(),
            size: None,
            pending: BString::default(),
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// The concatenated chunk payloads decoded so far; the full body once
    /// `state` is `Complete`.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Consume `data`, advancing the state machine as far as the bytes allow.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(data);
        loop {
            match self.state {
                ChunkState::WaitingSize => {
                    let Some((line, _)) = split_line(&self.pending) else {
                        return Ok(());
                    };
                    let consumed = line.len() + CRLF.len();
                    // an empty size line reads as the terminal zero chunk
                    let size = if line.is_empty() { 0 } else { parse_size(line)? };
                    self.pending.drain(..consumed);
                    self.size = Some(size);
                    self.state = ChunkState::WaitingData;
                }
                ChunkState::WaitingData => {
                    let size = self.size.unwrap_or(0);
                    let take = (size - self.chunk.len()).min(self.pending.len());
                    self.chunk.extend_from_slice(&self.pending[..take]);
                    self.pending.drain(..take);
                    if self.chunk.len() < size || self.pending.len() < CRLF.len() {
                        // waiting for the rest of the payload or its CRLF
                        return Ok(());
                    }
                    self.pending.drain(..CRLF.len());
                    self.body.extend_from_slice(&self.chunk);
                    self.chunk.clear();
                    self.size = None;
                    self.state = if size == 0 {
                        ChunkState::Complete
                    } else {
                        ChunkState::WaitingSize
                    };
                }
                ChunkState::Complete => return Ok(()),
            }
        }
    }
}

fn parse_size(line: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| anyhow::anyhow!("invalid chunk size line: {:?}", line.as_bstr()))?;
    usize::from_str_radix(text.trim(), 16)
        .map_err(|_| anyhow::anyhow!("invalid chunk size line: {:?}", text.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk() {
        let mut parser = ChunkParser::new();
        parser.feed(b"5\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(parser.state(), ChunkState::Complete);
        assert_eq!(parser.body(), b"hello");
    }

    #[test]
    fn test_multiple_chunks_concatenate() {
        let mut parser = ChunkParser::new();
        parser.feed(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n").unwrap();
        assert_eq!(parser.state(), ChunkState::Complete);
        assert_eq!(parser.body(), b"Wikipedia");
    }

    #[test]
    fn test_hex_sizes_are_case_insensitive() {
        let mut parser = ChunkParser::new();
        parser.feed(b"A\r\n0123456789\r\n").unwrap();
        assert_eq!(parser.body(), b"0123456789");
        let mut parser = ChunkParser::new();
        parser.feed(b"a\r\n0123456789\r\n").unwrap();
        assert_eq!(parser.body(), b"0123456789");
    }

    #[test]
    fn test_byte_at_a_time_matches_one_shot() {
        let stream = b"6\r\nfoobar\r\n3\r\nbaz\r\n0\r\n\r\n";
        let mut whole = ChunkParser::new();
        whole.feed(stream).unwrap();

        let mut split = ChunkParser::new();
        for byte in stream {
            split.feed(std::slice::from_ref(byte)).unwrap();
        }

        assert_eq!(split.state(), whole.state());
        assert_eq!(split.body(), whole.body());
        assert_eq!(whole.body(), b"foobarbaz");
    }

    #[test]
    fn test_uneven_splits_match_one_shot() {
        let stream = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        for cut in 1..stream.len() {
            let mut parser = ChunkParser::new();
            parser.feed(&stream[..cut]).unwrap();
            parser.feed(&stream[cut..]).unwrap();
            assert_eq!(parser.state(), ChunkState::Complete, "cut at {cut}");
            assert_eq!(parser.body(), b"Wikipedia", "cut at {cut}");
        }
    }

    #[test]
    fn test_empty_size_line_terminates() {
        let mut parser = ChunkParser::new();
        parser.feed(b"\r\n\r\n").unwrap();
        assert_eq!(parser.state(), ChunkState::Complete);
        assert_eq!(parser.body(), b"");
    }

    #[test]
    fn test_malformed_size_is_an_error() {
        let mut parser = ChunkParser::new();
        assert!(parser.feed(b"zz\r\n").is_err());
    }

    #[test]
    fn test_incomplete_input_stays_pending() {
        let mut parser = ChunkParser::new();
        parser.feed(b"5\r\nhel").unwrap();
        assert_eq!(parser.state(), ChunkState::WaitingData);
        assert_eq!(parser.body(), b"");
        parser.feed(b"lo\r\n0\r\n\r\n").unwrap();
        assert_eq!(parser.state(), ChunkState::Complete);
        assert_eq!(parser.body(), b"hello");
    }
}
