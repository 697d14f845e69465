//! Header storage and the headers-checking chain

use std::fmt;

/// Case-insensitive multimap of HTTP header fields.
///
/// Iteration preserves insertion order. `get` returns the first value for
/// a name; repeated fields (e.g. `Cookie`) are reachable via `get_all`.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty header map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header field, keeping any existing fields with the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all fields with the given name by a single one
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.push((name.to_string(), value.into()));
    }

    /// Remove all fields with the given name
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First value for the given name, if any
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for the given name, in insertion order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a field with the given name is present
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether the first value for `name` equals `value`, ignoring ASCII case
    #[must_use]
    pub fn value_is(&self, name: &str, value: &str) -> bool {
        self.get(name)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case(value))
    }

    /// Iterate over all fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of fields
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// HTTP error produced by a failing header check
#[derive(Debug, Clone)]
pub struct HttpError {
    /// HTTP status code
    pub status_code: u16,
    /// Error text sent as the response body
    pub text: String,
}

impl HttpError {
    /// Create a new error
    #[must_use]
    pub fn new(status_code: u16, text: impl Into<String>) -> Self {
        Self {
            status_code,
            text: text.into(),
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status_code, self.text)
    }
}

type HeaderCheck = Box<dyn Fn(&HeaderMap) -> std::result::Result<(), HttpError> + Send + Sync>;

/// Chain of predicates applied once the headers of a request are complete.
///
/// The first failing predicate aborts parsing; its error becomes the
/// response. An empty chain accepts everything.
#[derive(Default)]
pub struct HeadersChecker {
    checks: Vec<HeaderCheck>,
}

impl HeadersChecker {
    /// Create an empty chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a predicate to the chain
    #[must_use]
    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&HeaderMap) -> std::result::Result<(), HttpError> + Send + Sync + 'static,
    {
        self.checks.push(Box::new(check));
        self
    }

    /// Run the chain; returns the error of the first failing predicate
    #[must_use]
    pub fn run(&self, headers: &HeaderMap) -> Option<HttpError> {
        for check in &self.checks {
            if let Err(e) = check(headers) {
                return Some(e);
            }
        }
        None
    }

    /// Number of predicates in the chain
    #[must_use]
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether the chain is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

impl fmt::Debug for HeadersChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadersChecker")
            .field("checks", &self.checks.len())
            .finish()
    }
}
