use anyhow::Result;
use bstr::{BStr, BString, ByteSlice};

/// A request target as a proxy sees it, split non-destructively into its
/// five components: absolute-form (`http://host:port/path?q#f`), origin-form
/// (`/path`), or authority-form (`host:port`, the CONNECT shape).
///
/// A leading `token:` only counts as a scheme when the remainder contains a
/// non-digit, so `host:443` keeps the whole authority in `path` instead of
/// being read as scheme `host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    scheme: BString,
    netloc: BString,
    path: BString,
    query: BString,
    fragment: BString,
}

fn is_scheme_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'-' | b'.')
}

impl Url {
    pub fn split(target: &[u8]) -> Url {
        let mut rest = target;

        let mut fragment: &[u8] = b"";
        if let Some(pos) = rest.find_byte(b'#') {
            fragment = &rest[pos + 1..];
            rest = &rest[..pos];
        }

        let mut scheme: &[u8] = b"";
        if let Some(pos) = rest.find_byte(b':') {
            let (head, tail) = (&rest[..pos], &rest[pos + 1..]);
            let looks_like_scheme =
                pos > 0 && head[0].is_ascii_alphabetic() && head.iter().all(|&b| is_scheme_char(b));
            let looks_like_port = !tail.is_empty() && tail.iter().all(u8::is_ascii_digit);
            if looks_like_scheme && !looks_like_port {
                scheme = head;
                rest = tail;
            }
        }

        let mut netloc: &[u8] = b"";
        if rest.starts_with(b"//") {
            let after = &rest[2..];
            let end = after
                .iter()
                .position(|&b| matches!(b, b'/' | b'?' | b'#'))
                .unwrap_or(after.len());
            netloc = &after[..end];
            rest = &after[end..];
        }

        let mut query: &[u8] = b"";
        if let Some(pos) = rest.find_byte(b'?') {
            query = &rest[pos + 1..];
            rest = &rest[..pos];
        }

        Url {
            scheme: scheme.to_ascii_lowercase().into(),
            netloc: netloc.into(),
            path: rest.into(),
            query: query.into(),
            fragment: fragment.into(),
        }
    }

    /// Reassemble the target. Splitting then reassembling a well-formed
    /// target yields the original bytes.
    pub fn geturl(&self) -> BString {
        let mut url = self.path.clone();
        if !self.netloc.is_empty() || self.path.starts_with(b"//") {
            if !url.is_empty() && !url.starts_with(b"/") {
                url.insert(0, b'/');
            }
            let mut full = BString::from("//");
            full.extend_from_slice(&self.netloc);
            full.extend_from_slice(&url);
            url = full;
        }
        if !self.scheme.is_empty() {
            let mut full = self.scheme.clone();
            full.push(b':');
            full.extend_from_slice(&url);
            url = full;
        }
        if !self.query.is_empty() {
            url.push(b'?');
            url.extend_from_slice(&self.query);
        }
        if !self.fragment.is_empty() {
            url.push(b'#');
            url.extend_from_slice(&self.fragment);
        }
        url
    }

    pub fn path(&self) -> &BStr {
        self.path.as_bstr()
    }

    /// Host component of the authority: lowercased, without userinfo,
    /// IPv6 brackets, or port. `None` when the target carries no authority.
    pub fn hostname(&self) -> Option<BString> {
        let hostinfo = self.hostinfo();
        if hostinfo.is_empty() {
            return None;
        }
        let host = if hostinfo[0] == b'[' {
            let end = hostinfo.find_byte(b']').unwrap_or(hostinfo.len());
            &hostinfo[1..end]
        } else {
            let end = hostinfo.find_byte(b':').unwrap_or(hostinfo.len());
            &hostinfo[..end]
        };
        if host.is_empty() {
            return None;
        }
        Some(host.to_ascii_lowercase().into())
    }

    /// Port component of the authority, when one is present.
    pub fn port(&self) -> Result<Option<u16>> {
        let hostinfo = self.hostinfo();
        let port = if hostinfo.first() == Some(&b'[') {
            match hostinfo.find(b"]:") {
                Some(pos) => &hostinfo[pos + 2..],
                None => b"",
            }
        } else {
            match hostinfo.find_byte(b':') {
                Some(pos) => &hostinfo[pos + 1..],
                None => b"",
            }
        };
        if port.is_empty() {
            return Ok(None);
        }
        let port = std::str::from_utf8(port)
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| anyhow::anyhow!("invalid port in {:?}", self.netloc))?;
        Ok(Some(port))
    }

    fn hostinfo(&self) -> &[u8] {
        match self.netloc.rfind_byte(b'@') {
            Some(pos) => &self.netloc[pos + 1..],
            None => &self.netloc,
        }
    }
}
