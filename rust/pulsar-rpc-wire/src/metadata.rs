use bytes::Bytes;

/// Metadata key holding the full method name (`Service/Method`).
pub const METHOD_KEY: &str = "rpc-method";

/// Metadata key holding the topic the server must publish responses to.
pub const REPLY_TO_KEY: &str = "rpc-reply-to";

/// Metadata key holding the caller's remaining deadline in milliseconds.
pub const TIMEOUT_KEY: &str = "rpc-timeout-ms";

/// Ordered key/value pairs attached to HEADERS and STATUS envelopes.
///
/// Keys are ASCII and stored lowercase. Duplicate keys are allowed and keep
/// their insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Bytes)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<Bytes>) {
        self.entries
            .push((key.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// Builder-style [`Metadata::insert`].
    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<Bytes>) -> Self {
        self.insert(key, value);
        self
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// First value for `key`, if it is valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Remove every entry for `key`, returning the first removed value.
    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        let key = key.to_ascii_lowercase();
        let mut first = None;
        self.entries.retain(|(k, v)| {
            if *k == key {
                if first.is_none() {
                    first = Some(v.clone());
                }
                false
            } else {
                true
            }
        });
        first
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extend(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }
}

impl<K: AsRef<str>, V: Into<Bytes>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = Metadata::new();
        for (k, v) in iter {
            md.insert(k, v);
        }
        md
    }
}
