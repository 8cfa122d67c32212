use std::fmt::Write as _;

/// Ordered multimap of RTSP headers.
///
/// Lookups are case-insensitive; emission uses canonical capitalisation
/// (`CSeq`, `WWW-Authenticate`, `RTP-Info`, ...) and sorts entries
/// lexicographically so that serialisation is deterministic. Repeated keys
/// are kept in insertion order relative to each other.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

/// Headers whose capitalisation does not follow the dash-separated
/// title-case rule.
const CANONICAL: &[(&str, &str)] = &[
    ("cseq", "CSeq"),
    ("www-authenticate", "WWW-Authenticate"),
    ("rtp-info", "RTP-Info"),
    ("keymgmt", "KeyMgmt"),
    ("x-sessioncookie", "x-sessioncookie"),
];

fn canonicalize(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    for (from, to) in CANONICAL {
        if lower == *from {
            return (*to).to_string();
        }
    }
    // Title-case each dash-separated token: content-length -> Content-Length.
    let mut out = String::with_capacity(name.len());
    for (i, tok) in lower.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = tok.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    out
}

impl HeaderMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, counting repeats.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no header is present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an entry, keeping any existing ones with the same name.
    pub fn add(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.entries.push((canonicalize(name.as_ref()), value.into()));
    }

    /// Replaces every entry with the given name by a single one.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let canon = canonicalize(name.as_ref());
        self.entries.retain(|(n, _)| *n != canon);
        self.entries.push((canon, value.into()));
    }

    /// Removes every entry with the given name.
    pub fn remove(&mut self, name: &str) {
        let canon = canonicalize(name);
        self.entries.retain(|(n, _)| *n != canon);
    }

    /// First value for a name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        let canon = canonicalize(name);
        self.entries
            .iter()
            .find(|(n, _)| *n == canon)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for a name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &str) -> Vec<&'a str> {
        let canon = canonicalize(name);
        self.entries
            .iter()
            .filter(|(n, _)| *n == canon)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Iterates over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Writes `Name: Value\r\n` lines sorted lexicographically by name.
    pub fn encode(&self, out: &mut String) {
        let mut sorted: Vec<&(String, String)> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in sorted {
            let _ = write!(out, "{name}: {value}\r\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names() {
        let mut h = HeaderMap::new();
        h.add("cseq", "2");
        h.add("CONTENT-LENGTH", "0");
        h.add("www-authenticate", "Basic realm=\"x\"");
        assert_eq!(h.get("CSeq"), Some("2"));
        assert_eq!(h.get("content-length"), Some("0"));

        let mut out = String::new();
        h.encode(&mut out);
        assert_eq!(
            out,
            "CSeq: 2\r\nContent-Length: 0\r\nWWW-Authenticate: Basic realm=\"x\"\r\n"
        );
    }

    #[test]
    fn repeated_keys_kept_ordered() {
        let mut h = HeaderMap::new();
        h.add("WWW-Authenticate", "Digest realm=\"r\", nonce=\"n\"");
        h.add("WWW-Authenticate", "Basic realm=\"r\"");
        assert_eq!(h.get_all("www-authenticate").len(), 2);
        assert!(h.get_all("WWW-Authenticate")[0].starts_with("Digest"));
    }

    #[test]
    fn set_replaces() {
        let mut h = HeaderMap::new();
        h.add("Session", "abc");
        h.add("Session", "def");
        h.set("session", "ghi");
        assert_eq!(h.get_all("Session"), vec!["ghi"]);
    }
}
