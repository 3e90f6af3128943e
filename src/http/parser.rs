use anyhow::{Result, bail};
use bstr::{BStr, BString, ByteSlice};

use super::chunk::{ChunkParser, ChunkState};
use super::url::Url;
use super::{CRLF, split_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParseState {
    Initialized,
    LineRcvd,
    RcvingHeaders,
    HeadersComplete,
    RcvingBody,
    Complete,
}

/// Ordered header table: case-insensitive lookup, case-preserving emission.
/// A later header line with the same lowercased name overwrites the stored
/// name and value in place, keeping the original position.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    entries: Vec<HeaderEntry>,
}

#[derive(Debug, Clone)]
struct HeaderEntry {
    lower: BString,
    name: BString,
    value: BString,
}

impl Headers {
    pub fn set(&mut self, name: &[u8], value: &[u8]) {
        let lower = name.to_ascii_lowercase();
        match self
            .entries
            .iter_mut()
            .find(|e| e.lower.as_slice() == lower.as_slice())
        {
            Some(entry) => {
                entry.name = name.into();
                entry.value = value.into();
            }
            None => self.entries.push(HeaderEntry {
                lower: lower.into(),
                name: name.into(),
                value: value.into(),
            }),
        }
    }

    /// Look up by lowercased name.
    pub fn get(&self, lower: &[u8]) -> Option<&BStr> {
        self.entries
            .iter()
            .find(|e| e.lower.as_slice() == lower)
            .map(|e| e.value.as_bstr())
    }

    pub fn contains(&self, lower: &[u8]) -> bool {
        self.get(lower).is_some()
    }

    /// Stored (original-case name, value) pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&BStr, &BStr)> {
        self.entries
            .iter()
            .map(|e| (e.name.as_bstr(), e.value.as_bstr()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Incremental HTTP/1.1 message parser, shared between the request and
/// response sides of a session.
///
/// Bytes are pushed through [`feed`](HttpParser::feed); a partial trailing
/// line is carried over to the next call. `state` advances monotonically from
/// `Initialized` to `Complete`, after which the parsed message is frozen
/// (`raw` keeps growing so the total byte count stays observable).
///
/// A body is expected only for POST requests and for responses, framed by
/// `Content-Length` or `Transfer-Encoding: chunked`. A response with neither
/// framing header never completes here; the session ends it when the server
/// closes.
#[derive(Debug)]
pub struct HttpParser {
    kind: ParserKind,
    state: ParseState,
    raw: BString,
    buffer: BString,
    headers: Headers,
    body: Option<BString>,
    method: Option<BString>,
    url: Option<Url>,
    version: Option<BString>,
    code: Option<BString>,
    reason: Option<BString>,
    chunker: Option<ChunkParser>,
}

impl HttpParser {
    pub fn request() -> Self {
        Self::new(ParserKind::Request)
    }

    pub fn response() -> Self {
        Self::new(ParserKind::Response)
    }

    fn new(kind: ParserKind) -> Self {
        Self {
            kind,
            state: ParseState::Initialized,
            raw: BString::default(),
            buffer: BString::default(),
            headers: Headers::default(),
            body: None,
            method: None,
            url: None,
            version: None,
            code: None,
            reason: None,
            chunker: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn method(&self) -> Option<&BStr> {
        self.method.as_ref().map(|m| m.as_bstr())
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn version(&self) -> Option<&BStr> {
        self.version.as_ref().map(|v| v.as_bstr())
    }

    pub fn code(&self) -> Option<&BStr> {
        self.code.as_ref().map(|c| c.as_bstr())
    }

    pub fn reason(&self) -> Option<&BStr> {
        self.reason.as_ref().map(|r| r.as_bstr())
    }

    pub fn body(&self) -> Option<&BStr> {
        self.body.as_ref().map(|b| b.as_bstr())
    }

    /// Total bytes ever fed, including any consumed after completion.
    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_connect(&self) -> bool {
        self.method.as_ref().is_some_and(|m| m.as_slice() == b"CONNECT")
    }

    fn is_post(&self) -> bool {
        self.method.as_ref().is_some_and(|m| m.as_slice() == b"POST")
    }

    /// Feed one read's worth of bytes, advancing as far as they allow.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.raw.extend_from_slice(data);

        let mut chunk: Vec<u8> = std::mem::take(&mut self.buffer).into();
        chunk.extend_from_slice(data);

        let mut more = !chunk.is_empty();
        while more {
            (more, chunk) = self.process(chunk)?;
        }
        self.buffer = chunk.into();
        Ok(())
    }

    fn process(&mut self, mut data: Vec<u8>) -> Result<(bool, Vec<u8>)> {
        if self.state == ParseState::Complete {
            // message is frozen; surplus bytes only count toward raw
            return Ok((false, Vec::new()));
        }

        let expects_body = self.state >= ParseState::HeadersComplete
            && (self.kind == ParserKind::Response || self.is_post());
        if expects_body {
            self.process_body(&data)?;
            return Ok((false, Vec::new()));
        }

        let Some((line, _)) = split_line(&data) else {
            return Ok((false, data));
        };
        let consumed = line.len() + CRLF.len();
        let line_was_empty = line.is_empty();
        if self.state < ParseState::LineRcvd {
            self.process_line(&data[..line.len()])?;
        } else if self.state < ParseState::HeadersComplete {
            self.process_header(&data[..line.len()]);
        }
        data.drain(..consumed);

        // a bodyless request is done as soon as its blank line is on the
        // wire; a request with no headers at all completes off the same
        // blank line from RcvingHeaders
        if self.kind == ParserKind::Request
            && !self.is_post()
            && self.raw.ends_with(b"\r\n\r\n")
            && (self.state == ParseState::HeadersComplete
                || (self.state == ParseState::RcvingHeaders && line_was_empty))
        {
            self.state = ParseState::Complete;
        }

        Ok((!data.is_empty(), data))
    }

    fn process_body(&mut self, data: &[u8]) -> Result<()> {
        if self.body.is_none() {
            self.body = Some(BString::default());
        }

        if let Some(value) = self.headers.get(b"content-length") {
            let declared = parse_content_length(value)?;
            self.state = ParseState::RcvingBody;
            let body = match self.body.as_mut() {
                Some(body) => body,
                None => return Ok(()),
            };
            body.extend_from_slice(data);
            if body.len() >= declared {
                self.state = ParseState::Complete;
            }
        } else if self
            .headers
            .get(b"transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case(b"chunked"))
        {
            let chunker = self.chunker.get_or_insert_with(ChunkParser::new);
            chunker.feed(data)?;
            if chunker.state() == ChunkState::Complete {
                self.body = Some(chunker.body().into());
                self.state = ParseState::Complete;
            }
        }
        // with no framing header the body stays open until the peer closes
        Ok(())
    }

    fn process_line(&mut self, line: &[u8]) -> Result<()> {
        let parts: Vec<&[u8]> = line.split_str(b" ").collect();
        match self.kind {
            ParserKind::Request => {
                if parts.len() < 3 {
                    bail!("malformed request line: {:?}", line.as_bstr());
                }
                self.method = Some(parts[0].to_ascii_uppercase().into());
                self.url = Some(Url::split(parts[1]));
                self.version = Some(parts[2].into());
            }
            ParserKind::Response => {
                if parts.len() < 2 {
                    bail!("malformed status line: {:?}", line.as_bstr());
                }
                self.version = Some(parts[0].into());
                self.code = Some(parts[1].into());
                self.reason = Some(parts[2..].join(&b" "[..]).into());
            }
        }
        self.state = ParseState::LineRcvd;
        Ok(())
    }

    fn process_header(&mut self, line: &[u8]) {
        if line.is_empty() {
            if self.state == ParseState::RcvingHeaders {
                self.state = ParseState::HeadersComplete;
            } else if self.state == ParseState::LineRcvd {
                // CRLFCRLF right after the start line: no headers at all
                self.state = ParseState::RcvingHeaders;
            }
            return;
        }
        self.state = ParseState::RcvingHeaders;
        let (name, value) = match line.find_byte(b':') {
            Some(pos) => (&line[..pos], &line[pos + 1..]),
            None => (line, &b""[..]),
        };
        self.headers.set(name.trim(), value.trim());
    }

    /// The absolute request target for re-serialization and the access log.
    pub fn build_url(&self) -> BString {
        match &self.url {
            Some(url) => url.geturl(),
            None => BString::from("/"),
        }
    }

    /// Serialize the parsed request: start line with the absolute target,
    /// retained headers in stored order under their original-case names
    /// (skipping `del_headers`, given lowercased), then `add_headers`, a
    /// blank line, and the body when one was parsed.
    pub fn rebuild(&self, del_headers: &[&[u8]], add_headers: &[(&[u8], &[u8])]) -> BString {
        let mut out = BString::default();
        if let (Some(method), Some(version)) = (&self.method, &self.version) {
            out.extend_from_slice(method);
            out.push(b' ');
            out.extend_from_slice(&self.build_url());
            out.push(b' ');
            out.extend_from_slice(version);
        }
        out.extend_from_slice(CRLF);

        for entry in &self.headers.entries {
            if del_headers.iter().any(|d| entry.lower.as_slice() == *d) {
                continue;
            }
            push_header(&mut out, &entry.name, &entry.value);
        }
        for (name, value) in add_headers {
            push_header(&mut out, name, value);
        }

        out.extend_from_slice(CRLF);
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }
}

fn push_header(out: &mut BString, name: &[u8], value: &[u8]) {
    out.extend_from_slice(name);
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(CRLF);
}

fn parse_content_length(value: &BStr) -> Result<usize> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid content-length: {value:?}"))
}
