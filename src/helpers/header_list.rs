/// Ordered multimap of header name to value.
///
/// Insertion order is preserved and lookups ignore ASCII case. A connection
/// owns three of these (request headers, request arguments and extra
/// response headers), all cleared at the start of every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `name: value` at the tail.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Join a folded continuation line onto the most recent value.
    ///
    /// Leading whitespace of `continuation` is dropped and a single space
    /// separates it from the previous value. Returns `false` (and stores
    /// nothing) when the list is empty.
    pub fn append_continuation(&mut self, continuation: &str) -> bool {
        let Some((_, value)) = self.entries.last_mut() else {
            return false;
        };
        let continuation = continuation.trim_start_matches([' ', '\t']);
        if !value.is_empty() {
            value.push(' ');
        }
        value.push_str(continuation);
        true
    }

    /// Value of the first entry named `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the comma separated value of `name` contains `token`, ignoring case.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name).is_some_and(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut list = HeaderList::new();
        for (name, value) in iter {
            list.add(name, value);
        }
        list
    }
}
