//! Explicit variable sets and `$VAR` expansion
//!
//! Descriptors and env files may reference variables (`$NAME` or `${NAME}`).
//! Expansion always happens against a `Variables` value handed in by the
//! caller, so nothing here reads or writes the process environment except
//! the explicit `from_process_env` snapshot.

use std::collections::BTreeMap;

/// An explicit set of variables used for expansion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    /// Creates an empty variable set
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots the current process environment
    ///
    /// Variables whose name or value is not valid unicode are skipped.
    pub fn from_process_env() -> Self {
        Self {
            values: std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }

    /// Sets a variable, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Builder-style variant of `set`
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Gets a variable by name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Returns true if the variable is defined (even if empty)
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Layers `other` on top of this set; keys in `other` win
    pub fn extend<I, K, V>(&mut self, other: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in other {
            self.values.insert(k.into(), v.into());
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Expands `$NAME` and `${NAME}` references
    ///
    /// Unknown names expand to the empty string. A `$` that is not followed
    /// by a name or `{` is kept as is, as is an unterminated `${`.
    pub fn expand(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            if let Some(braced) = after.strip_prefix('{') {
                match braced.find('}') {
                    Some(end) if is_name(&braced[..end]) => {
                        out.push_str(self.get(&braced[..end]).unwrap_or_default());
                        rest = &braced[end + 1..];
                    }
                    _ => {
                        out.push('$');
                        rest = after;
                    }
                }
                continue;
            }

            let name_len = after
                .bytes()
                .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
                .count();
            if name_len == 0 {
                out.push('$');
            } else {
                out.push_str(self.get(&after[..name_len]).unwrap_or_default());
            }
            rest = &after[name_len..];
        }

        out.push_str(rest);
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut vars = Self::new();
        vars.extend(iter);
        vars
    }
}

fn is_name(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
