//! Header changes proposed by filters and the net diff reported upward.

use crate::config::WebRequestConfig;
use crate::error::WebRequestError;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};

/// One filter's requested header edits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderChanges {
    /// Headers to set; replaces any existing header of the same name
    pub set: HeaderMap,
    /// Header names to delete, applied after `set`
    pub remove: Vec<HeaderName>,
}

impl HeaderChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.set.append(name, value);
        self
    }

    pub fn remove_header(mut self, name: HeaderName) -> Self {
        self.remove.push(name);
        self
    }

    /// Like [`Self::set_header`], parsing name and value from strings.
    pub fn try_set(self, name: &str, value: &str) -> Result<Self, WebRequestError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| WebRequestError::InvalidHeaderName(name.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| WebRequestError::InvalidHeaderValue(name.to_string()))?;
        Ok(self.set_header(name, value))
    }

    /// Like [`Self::remove_header`], parsing the name from a string.
    pub fn try_remove(self, name: &str) -> Result<Self, WebRequestError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| WebRequestError::InvalidHeaderName(name.to_string()))?;
        Ok(self.remove_header(name))
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    /// Apply these changes onto `headers`.
    pub fn apply_to(&self, headers: &mut HeaderMap) {
        for name in self.set.keys() {
            headers.remove(name);
            for value in self.set.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        for name in &self.remove {
            headers.remove(name);
        }
    }
}

/// Replay every filter's changes over `base` in chain order.
pub(crate) fn replay<'a, I>(base: &HeaderMap, changes: I) -> HeaderMap
where
    I: IntoIterator<Item = &'a HeaderChanges>,
{
    let mut headers = base.clone();
    for change in changes {
        change.apply_to(&mut headers);
    }
    headers
}

/// Net header change of a phase, against the pre-phase snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderDelta {
    /// Final header set
    pub headers: HeaderMap,
    /// Headers added or whose values changed, with their final values
    pub modified: HeaderMap,
    /// Headers present before the phase and gone after it
    pub removed: Vec<HeaderName>,
}

impl HeaderDelta {
    pub fn between(before: &HeaderMap, after: &HeaderMap) -> Self {
        let mut modified = HeaderMap::new();
        for name in after.keys() {
            let old: Vec<&HeaderValue> = before.get_all(name).iter().collect();
            let new: Vec<&HeaderValue> = after.get_all(name).iter().collect();
            if old != new {
                for value in new {
                    modified.append(name.clone(), value.clone());
                }
            }
        }

        let removed = before
            .keys()
            .filter(|name| !after.contains_key(*name))
            .cloned()
            .collect();

        Self {
            headers: after.clone(),
            modified,
            removed,
        }
    }

    /// No net change
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Copy of `headers` without the configured extra headers.
pub(crate) fn strip_extra(headers: &HeaderMap, config: &WebRequestConfig) -> HeaderMap {
    let mut stripped = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !config.is_extra_header(name.as_str()) {
            stripped.append(name.clone(), value.clone());
        }
    }
    stripped
}
