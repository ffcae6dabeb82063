use http::header::VARY;
use http::{HeaderMap, Method};
use std::fmt;

/// A cacheable resource as named by the request line.
///
/// `path` and `raw_query` are kept byte-for-byte as received: no case folding,
/// no percent-decoding, no parameter reordering. `/a?` and `/a` are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub method: Method,
    pub path: String,
    pub raw_query: Option<String>,
}

impl ResourceId {
    pub fn new(method: Method, path: impl Into<String>, raw_query: Option<String>) -> Self {
        Self {
            method,
            path: path.into(),
            raw_query,
        }
    }

    /// Path plus `?query` when a query was present.
    pub fn path_and_query(&self) -> String {
        match &self.raw_query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path_and_query())
    }
}

/// Fully derived cache key: the resource plus the request's values for every
/// header the resource varies on.
///
/// `vary` is sorted by lowercase header name, so neither request header order
/// nor name casing affects equality. Values are the raw header bytes: two
/// values that differ only in obs-text bytes are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub resource: ResourceId,
    pub vary: Vec<(String, Vec<u8>)>,
}

impl CacheKey {
    /// Build the key for `resource` as seen by a request carrying `headers`.
    ///
    /// Absent headers contribute an empty value; repeated headers are joined
    /// with `", "` in the order received.
    pub fn derive(resource: &ResourceId, headers: &HeaderMap, vary_names: &[String]) -> Self {
        let mut vary: Vec<(String, Vec<u8>)> = vary_names
            .iter()
            .map(|name| {
                let name = name.to_ascii_lowercase();
                let value = header_value(headers, &name);
                (name, value)
            })
            .collect();
        vary.sort_by(|a, b| a.0.cmp(&b.0));
        vary.dedup_by(|a, b| a.0 == b.0);

        Self {
            resource: resource.clone(),
            vary,
        }
    }

    /// The lowercase header names this key was derived with.
    pub fn vary_names(&self) -> Vec<String> {
        self.vary.iter().map(|(name, _)| name.clone()).collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        for (name, value) in &self.vary {
            write!(f, " [{name}={}]", String::from_utf8_lossy(value))?;
        }
        Ok(())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Vec<u8> {
    let mut joined = Vec::new();
    for (i, value) in headers.get_all(name).iter().enumerate() {
        if i > 0 {
            joined.extend_from_slice(b", ");
        }
        joined.extend_from_slice(value.as_bytes());
    }
    joined
}

/// What a response's `Vary` header declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarySpec {
    /// Lowercase, deduplicated header names. Empty when no `Vary` was sent.
    Headers(Vec<String>),
    /// `Vary: *`: the response cannot be matched by any later request.
    Any,
}

impl VarySpec {
    pub fn names(&self) -> &[String] {
        match self {
            VarySpec::Headers(names) => names,
            VarySpec::Any => &[],
        }
    }
}

/// Collect the header names from every `Vary` header on a response.
pub fn parse_vary(headers: &HeaderMap) -> VarySpec {
    let mut names: Vec<String> = Vec::new();
    for value in headers.get_all(VARY).iter() {
        let value = String::from_utf8_lossy(value.as_bytes());
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name == "*" {
                return VarySpec::Any;
            }
            let name = name.to_ascii_lowercase();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    VarySpec::Headers(names)
}
