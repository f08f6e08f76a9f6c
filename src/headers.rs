//! HTTP header multimap.
//!
//! Header names keep their wire representation. By default names are
//! canonicalized to the `Header-Name` form on insert; servers and clients can
//! disable that to preserve whatever case the peer (or the caller) used.
//! Lookups are always case-insensitive.

use std::fmt;
use std::slice;

use bytes::Bytes;

pub(crate) const CONTENT_LENGTH: &str = "Content-Length";
pub(crate) const CONTENT_TYPE: &str = "Content-Type";
pub(crate) const CONTENT_RANGE: &str = "Content-Range";
pub(crate) const CONTENT_ENCODING: &str = "Content-Encoding";
pub(crate) const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub(crate) const CONNECTION: &str = "Connection";
pub(crate) const HOST: &str = "Host";
pub(crate) const EXPECT: &str = "Expect";
pub(crate) const DATE: &str = "Date";
pub(crate) const LOCATION: &str = "Location";
pub(crate) const RANGE: &str = "Range";
pub(crate) const LAST_MODIFIED: &str = "Last-Modified";
pub(crate) const IF_MODIFIED_SINCE: &str = "If-Modified-Since";
pub(crate) const ACCEPT_ENCODING: &str = "Accept-Encoding";
pub(crate) const ACCEPT_RANGES: &str = "Accept-Ranges";

/// An ordered multimap of header names to values.
#[derive(Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(Bytes, Bytes)>,
    disable_normalizing: bool,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap::default()
    }

    pub(crate) fn with_capacity(n: usize) -> HeaderMap {
        HeaderMap {
            entries: Vec::with_capacity(n),
            disable_normalizing: false,
        }
    }

    /// Disables `Header-Name` canonicalization for subsequent inserts.
    pub fn set_disable_normalizing(&mut self, disable: bool) {
        self.disable_normalizing = disable;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn normalize(&self, name: &str) -> Bytes {
        if self.disable_normalizing {
            return Bytes::copy_from_slice(name.as_bytes());
        }
        Bytes::from(canonicalize(name.as_bytes()))
    }

    /// Replaces every value of `name` with `value`.
    pub fn set(&mut self, name: &str, value: impl Into<Bytes>) {
        self.del(name);
        let name = self.normalize(name);
        self.entries.push((name, value.into()));
    }

    /// Appends `value` without touching existing values of `name`.
    pub fn add(&mut self, name: &str, value: impl Into<Bytes>) {
        let name = self.normalize(name);
        self.entries.push((name, value.into()));
    }

    /// Appends a name/value pair exactly as given, skipping canonicalization.
    pub(crate) fn add_raw(&mut self, name: Bytes, value: Bytes) {
        self.entries.push((name, value));
    }

    pub fn del(&mut self, name: &str) {
        self.entries
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name.as_bytes()));
    }

    /// First value of `name`, if any.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v.as_ref())
    }

    /// First value of `name` as UTF-8, empty string when absent or invalid.
    pub fn get_str(&self, name: &str) -> &str {
        self.get(name)
            .and_then(|v| std::str::from_utf8(v).ok())
            .unwrap_or("")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v.as_ref())
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            inner: self.entries.iter(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether any `Connection` value names the given token.
    pub(crate) fn connection_has(&self, token: &str) -> bool {
        self.get_all(CONNECTION).any(|v| {
            std::str::from_utf8(v)
                .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        })
    }
}

pub struct Iter<'a> {
    inner: slice::Iter<'a, (Bytes, Bytes)>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(n, v)| (n.as_ref(), v.as_ref()))
    }
}

impl fmt::Debug for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (n, v) in self.iter() {
            map.entry(
                &String::from_utf8_lossy(n),
                &String::from_utf8_lossy(v),
            );
        }
        map.finish()
    }
}

/// Rewrites a header name to the canonical `Header-Name` form.
pub(crate) fn canonicalize(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len());
    let mut upper = true;
    for &b in name {
        if upper {
            out.push(b.to_ascii_uppercase());
        } else {
            out.push(b.to_ascii_lowercase());
        }
        upper = b == b'-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form() {
        assert_eq!(canonicalize(b"content-length"), b"Content-Length".to_vec());
        assert_eq!(canonicalize(b"x-forwarded-for"), b"X-Forwarded-For".to_vec());
        assert_eq!(canonicalize(b"ETAG"), b"Etag".to_vec());
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = HeaderMap::new();
        h.add("Accept", "a");
        h.add("accept", "b");
        h.set("ACCEPT", "c");
        assert_eq!(h.get_all("Accept").count(), 1);
        assert_eq!(h.get_str("accept"), "c");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.set("Content-Length", "5");
        assert_eq!(h.get_str("content-length"), "5");
        assert!(h.contains("CONTENT-LENGTH"));
    }

    #[test]
    fn disabled_normalizing_preserves_case() {
        let mut h = HeaderMap::new();
        h.set_disable_normalizing(true);
        h.set("x-my-header", "1");
        let (name, _) = h.iter().next().unwrap();
        assert_eq!(name, b"x-my-header");
    }

    #[test]
    fn connection_token_scan() {
        let mut h = HeaderMap::new();
        h.set("Connection", "keep-alive, Upgrade");
        assert!(h.connection_has("upgrade"));
        assert!(h.connection_has("keep-alive"));
        assert!(!h.connection_has("close"));
    }
}
