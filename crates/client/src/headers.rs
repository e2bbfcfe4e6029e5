//! Ordered, case-insensitive header multimap.
//!
//! [`HeaderStore`] keeps `(name, value)` pairs in insertion order across all names, which
//! `http::HeaderMap` does not. It distinguishes "add another value" from "replace the value":
//! HTTP permits repeated names such as `Set-Cookie`, while callers also need to override a
//! header like `Authorization` that was set earlier.
//!
//! Names are stored as [`HeaderName`], which is normalised to lower case, so every lookup is
//! case-insensitive.

use std::slice;
use std::vec;

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::error::ClientError;
use crate::utils::ensure;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderStore {
    entries: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderStore {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity) }
    }

    /// Appends a pair, keeping every existing entry for `name`.
    pub fn add(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.entries.push((name, value));
        self
    }

    /// Appends flattened `name, value, name, value, ...` arguments in order.
    ///
    /// Fails with [`ClientError::MalformedInput`] when the argument count is odd or any name or
    /// value is not a valid header token. On failure the store is left untouched.
    pub fn add_all(&mut self, flat: &[&str]) -> Result<&mut Self, ClientError> {
        ensure!(
            flat.len() % 2 == 0,
            ClientError::malformed_input(format!("odd number of header arguments: {}", flat.len()))
        );

        let parsed = flat
            .chunks_exact(2)
            .map(|pair| Ok((parse_name(pair[0])?, parse_value(pair[1])?)))
            .collect::<Result<Vec<_>, ClientError>>()?;

        self.entries.extend(parsed);
        Ok(self)
    }

    /// Replaces every entry for `name` with exactly one entry holding `value`.
    ///
    /// The surviving entry keeps the position of the first entry that matched; when nothing
    /// matched it is appended.
    pub fn set(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        match self.entries.iter().position(|(existing, _)| *existing == name) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(existing, _)| {
                    let keep = index <= first || *existing != name;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
        self
    }

    /// Removes every entry for `name`, returning how many were dropped.
    pub fn remove(&mut self, name: impl AsRef<str>) -> usize {
        let name = name.as_ref();
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| !matches_name(existing, name));
        before - self.entries.len()
    }

    /// Produces a new store holding this store's entries followed by `other`'s.
    ///
    /// Used to lay per-request headers over a client's default headers.
    #[must_use]
    pub fn merge(&self, other: &HeaderStore) -> HeaderStore {
        let mut merged = HeaderStore::with_capacity(self.len() + other.len());
        merged.entries.extend(self.entries.iter().cloned());
        merged.entries.extend(other.entries.iter().cloned());
        merged
    }

    /// All values for `name` in insertion order; empty when absent.
    pub fn values(&self, name: impl AsRef<str>) -> Vec<&HeaderValue> {
        let name = name.as_ref();
        self.entries.iter().filter(|(existing, _)| matches_name(existing, name)).map(|(_, value)| value).collect()
    }

    pub fn first(&self, name: impl AsRef<str>) -> Option<&HeaderValue> {
        let name = name.as_ref();
        self.entries.iter().find(|(existing, _)| matches_name(existing, name)).map(|(_, value)| value)
    }

    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.first(name).is_some()
    }

    /// Distinct names in order of first appearance.
    pub fn names(&self) -> Vec<&HeaderName> {
        let mut names: Vec<&HeaderName> = Vec::new();
        for (name, _) in &self.entries {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.entries.iter().map(|(name, value)| (name, value))
    }

    /// Converts into an `http::HeaderMap`; repeated names keep their relative order.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.len());
        for (name, value) in &self.entries {
            map.append(name.clone(), value.clone());
        }
        map
    }
}

#[inline]
fn matches_name(name: &HeaderName, candidate: &str) -> bool {
    name.as_str().eq_ignore_ascii_case(candidate)
}

pub(crate) fn parse_name(name: &str) -> Result<HeaderName, ClientError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| ClientError::malformed_input(format!("invalid header name '{name}': {e}")))
}

pub(crate) fn parse_value(value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value).map_err(|e| ClientError::malformed_input(format!("invalid header value '{value}': {e}")))
}

impl From<&HeaderMap> for HeaderStore {
    fn from(map: &HeaderMap) -> Self {
        map.iter().map(|(name, value)| (name.clone(), value.clone())).collect()
    }
}

impl From<HeaderMap> for HeaderStore {
    fn from(map: HeaderMap) -> Self {
        HeaderStore::from(&map)
    }
}

impl FromIterator<(HeaderName, HeaderValue)> for HeaderStore {
    fn from_iter<I: IntoIterator<Item = (HeaderName, HeaderValue)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

impl Extend<(HeaderName, HeaderValue)> for HeaderStore {
    fn extend<I: IntoIterator<Item = (HeaderName, HeaderValue)>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl IntoIterator for HeaderStore {
    type Item = (HeaderName, HeaderValue);
    type IntoIter = vec::IntoIter<(HeaderName, HeaderValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a HeaderStore {
    type Item = &'a (HeaderName, HeaderValue);
    type IntoIter = slice::Iter<'a, (HeaderName, HeaderValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
