/*
 * Copyright 2020 Joyent, Inc.
 */

//! URI handling for endpoint addresses.
//!
//! Only the pieces addressing needs are parsed: scheme, authority, path,
//! query and fragment. [`Uri`] is cheap to clone; sentinel URIs are shared
//! instances so identity checks can use [`Uri::ptr_eq`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::Error;

#[derive(Debug, PartialEq, Eq)]
struct UriParts {
    raw: String,
    scheme: Option<String>,
    userinfo: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Uri(Arc<UriParts>);

fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "net.tcp" => Some(808),
        _ => None,
    }
}

impl Uri {
    /// Parses an absolute or relative URI reference.
    pub fn parse(s: &str) -> Result<Uri, Error> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(Error::argument("uri", "URI must not be empty"));
        }
        if raw.chars().any(|c| c.is_whitespace()) {
            return Err(Error::argument(
                "uri",
                format!("'{}' contains whitespace", raw),
            ));
        }

        let mut rest = raw;
        let mut scheme = None;
        if let Some(idx) = rest.find(':') {
            let candidate = &rest[..idx];
            let before_delim = rest.find(['/', '?', '#']).map_or(true, |d| idx < d);
            if before_delim && is_scheme(candidate) {
                scheme = Some(candidate.to_string());
                rest = &rest[idx + 1..];
            }
        }

        let (mut userinfo, mut host, mut port) = (None, None, None);
        if let Some(after) = rest.strip_prefix("//") {
            let end = after.find(['/', '?', '#']).unwrap_or(after.len());
            let authority = &after[..end];
            rest = &after[end..];

            let hostport = match authority.rfind('@') {
                Some(at) => {
                    userinfo = Some(authority[..at].to_string());
                    &authority[at + 1..]
                }
                None => authority,
            };
            let (h, p) = if hostport.starts_with('[') {
                match hostport.find(']') {
                    Some(close) => {
                        let p = hostport[close + 1..].strip_prefix(':');
                        (&hostport[..=close], p)
                    }
                    None => {
                        return Err(Error::argument(
                            "uri",
                            format!("'{}' has an unterminated IPv6 host", raw),
                        ))
                    }
                }
            } else {
                match hostport.rfind(':') {
                    Some(colon) => (&hostport[..colon], Some(&hostport[colon + 1..])),
                    None => (hostport, None),
                }
            };
            host = Some(h.to_string());
            port = match p {
                Some("") | None => None,
                Some(p) => Some(p.parse::<u16>().map_err(|_| {
                    Error::argument("uri", format!("'{}' has an invalid port", raw))
                })?),
            };
        }

        let (before_fragment, fragment) = match rest.find('#') {
            Some(idx) => (&rest[..idx], Some(rest[idx + 1..].to_string())),
            None => (rest, None),
        };
        let (path, query) = match before_fragment.find('?') {
            Some(idx) => (
                &before_fragment[..idx],
                Some(before_fragment[idx + 1..].to_string()),
            ),
            None => (before_fragment, None),
        };
        let path = if path.is_empty() && host.is_some() {
            String::from("/")
        } else {
            path.to_string()
        };

        Ok(Uri(Arc::new(UriParts {
            raw: raw.to_string(),
            scheme,
            userinfo,
            host,
            port,
            path,
            query,
            fragment,
        })))
    }

    /// Parses and requires an absolute URI.
    pub fn parse_absolute(s: &str) -> Result<Uri, Error> {
        let uri = Uri::parse(s)?;
        if !uri.is_absolute() {
            return Err(Error::argument(
                "uri",
                format!("'{}' is not an absolute URI", s),
            ));
        }
        Ok(uri)
    }

    pub fn as_str(&self) -> &str {
        &self.0.raw
    }

    pub fn is_absolute(&self) -> bool {
        self.0.scheme.is_some()
    }

    pub fn scheme(&self) -> Option<&str> {
        self.0.scheme.as_deref()
    }

    pub fn userinfo(&self) -> Option<&str> {
        self.0.userinfo.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.0.host.as_deref()
    }

    /// Explicit port, or the scheme's well-known port.
    pub fn port(&self) -> Option<u16> {
        self.0
            .port
            .or_else(|| self.scheme().and_then(default_port))
    }

    pub fn path(&self) -> &str {
        &self.0.path
    }

    pub fn query(&self) -> Option<&str> {
        self.0.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.0.fragment.as_deref()
    }

    /// True when both handles share the same parsed instance.
    pub fn ptr_eq(a: &Uri, b: &Uri) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Hashes the components compared by [`uri_equals`]: scheme, host,
    /// port and path with any trailing slash removed, all case-folded.
    pub fn hash_normalized<H: Hasher>(&self, state: &mut H) {
        self.scheme().map(str::to_ascii_lowercase).hash(state);
        self.host().map(str::to_ascii_lowercase).hash(state);
        self.port().hash(state);
        trim_trailing_slash(self.path()).to_ascii_lowercase().hash(state);
    }
}

fn eq_opt_ignore_case(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

/// Structural equality: scheme and host compare case-insensitively,
/// userinfo and fragment are ignored.
impl PartialEq for Uri {
    fn eq(&self, other: &Uri) -> bool {
        if Uri::ptr_eq(self, other) {
            return true;
        }
        eq_opt_ignore_case(self.scheme(), other.scheme())
            && eq_opt_ignore_case(self.host(), other.host())
            && self.port() == other.port()
            && self.path() == other.path()
            && self.query() == other.query()
    }
}

impl Eq for Uri {}

impl Hash for Uri {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scheme().map(str::to_ascii_lowercase).hash(state);
        self.host().map(str::to_ascii_lowercase).hash(state);
        self.port().hash(state);
        self.path().hash(state);
        self.query().hash(state);
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn trim_trailing_slash(path: &str) -> &str {
    path.strip_suffix('/').unwrap_or(path)
}

/// Compares two URIs the way endpoint addresses are matched: schemes must
/// agree, the host is compared when `include_host` is set, ports are always
/// compared, and paths are compared with a single trailing slash ignored.
/// Userinfo, query and fragment never participate.
pub fn uri_equals(u1: &Uri, u2: &Uri, ignore_case: bool, include_host: bool) -> bool {
    uri_equals_with_port(u1, u2, ignore_case, include_host, true)
}

pub fn uri_equals_with_port(
    u1: &Uri,
    u2: &Uri,
    ignore_case: bool,
    include_host: bool,
    include_port: bool,
) -> bool {
    if !eq_opt_ignore_case(u1.scheme(), u2.scheme()) {
        return false;
    }
    if include_host && !eq_opt_ignore_case(u1.host(), u2.host()) {
        return false;
    }
    if include_port && u1.port() != u2.port() {
        return false;
    }

    let p1 = trim_trailing_slash(u1.path());
    let p2 = trim_trailing_slash(u2.path());
    if p1.len() != p2.len() {
        return false;
    }
    if ignore_case {
        p1.eq_ignore_ascii_case(p2)
    } else {
        p1 == p2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, TestResult};
    use std::collections::hash_map::DefaultHasher;

    fn normalized_hash(uri: &Uri) -> u64 {
        let mut h = DefaultHasher::new();
        uri.hash_normalized(&mut h);
        h.finish()
    }

    #[test]
    fn parses_components() {
        let uri = Uri::parse("HTTP://user:pw@Example.com:8080/a/b?x=1#frag").unwrap();
        assert!(uri.is_absolute());
        assert_eq!(uri.scheme(), Some("HTTP"));
        assert_eq!(uri.userinfo(), Some("user:pw"));
        assert_eq!(uri.host(), Some("Example.com"));
        assert_eq!(uri.port(), Some(8080));
        assert_eq!(uri.path(), "/a/b");
        assert_eq!(uri.query(), Some("x=1"));
        assert_eq!(uri.fragment(), Some("frag"));

        let urn = Uri::parse("urn:uuid:1234").unwrap();
        assert!(urn.is_absolute());
        assert_eq!(urn.host(), None);
        assert_eq!(urn.path(), "uuid:1234");

        assert!(!Uri::parse("/relative/path").unwrap().is_absolute());
        assert!(Uri::parse_absolute("relative").is_err());
        assert!(Uri::parse("http://h:notaport/").is_err());
        assert!(Uri::parse("").is_err());
    }

    #[test]
    fn default_ports_fill_in() {
        assert_eq!(Uri::parse("http://h/").unwrap().port(), Some(80));
        assert_eq!(Uri::parse("https://h").unwrap().port(), Some(443));
        assert_eq!(
            Uri::parse("http://h/").unwrap(),
            Uri::parse("http://H:80/").unwrap()
        );
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let a = Uri::parse("http://h/a").unwrap();
        let b = Uri::parse("http://h/a/").unwrap();
        assert!(uri_equals(&a, &b, false, true));
        assert_eq!(normalized_hash(&a), normalized_hash(&b));
    }

    #[test]
    fn scheme_mismatch_never_equal() {
        let a = Uri::parse("http://h/a").unwrap();
        let b = Uri::parse("https://h/a").unwrap();
        for &ignore_case in &[true, false] {
            for &include_host in &[true, false] {
                assert!(!uri_equals(&a, &b, ignore_case, include_host));
            }
        }
    }

    #[test]
    fn host_case_and_path_case() {
        let a = Uri::parse("http://HOST/Path").unwrap();
        let b = Uri::parse("http://host/path").unwrap();
        assert!(!uri_equals(&a, &b, false, true));
        assert!(uri_equals(&a, &b, true, true));

        let c = Uri::parse("http://other/Path?q#f").unwrap();
        assert!(!uri_equals(&a, &c, false, true));
        assert!(uri_equals(&a, &c, false, false));
    }

    #[test]
    fn ports_always_compared() {
        let a = Uri::parse("http://h:81/a").unwrap();
        let b = Uri::parse("http://h:82/a").unwrap();
        assert!(!uri_equals(&a, &b, true, false));
        assert!(uri_equals_with_port(&a, &b, true, true, false));
    }

    #[test]
    fn slash_variants_quickcheck() {
        fn prop(segments: Vec<String>, upper: bool) -> TestResult {
            let clean: Vec<String> = segments
                .into_iter()
                .map(|s| s.chars().filter(|c| c.is_ascii_alphanumeric()).collect())
                .filter(|s: &String| !s.is_empty())
                .collect();
            if clean.is_empty() {
                return TestResult::discard();
            }
            let path = clean.join("/");
            let host = if upper { "HOST" } else { "host" };
            let a = Uri::parse(&format!("http://{}/{}", host, path)).unwrap();
            let b = Uri::parse(&format!("http://host/{}/", path)).unwrap();
            TestResult::from_bool(
                uri_equals(&a, &b, false, true) && normalized_hash(&a) == normalized_hash(&b),
            )
        }
        quickcheck(prop as fn(Vec<String>, bool) -> TestResult);
    }
}
