//! Backslash-delimited key/value strings (`\name\player\rate\25000`)
//!
//! Userinfo, server info and system info all travel in this format. Keys keep
//! their insertion order so a rendered string is stable across round trips.

use std::fmt;
use thiserror::Error;

/// Maximum rendered length of an info string, including the terminator slot
pub const MAX_INFO_STRING: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InfoError {
    #[error("info key or value contains an illegal character: {0}")]
    IllegalCharacter(String),

    #[error("info string length exceeded ({0} bytes)")]
    TooLong(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoString {
    pairs: Vec<(String, String)>,
}

impl InfoString {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a raw info string. Later duplicates of a key overwrite earlier ones.
    pub fn parse(raw: &str) -> Self {
        let mut info = InfoString::new();
        let body = raw.strip_prefix('\\').unwrap_or(raw);
        if body.is_empty() {
            return info;
        }

        let mut parts = body.split('\\');
        while let Some(key) = parts.next() {
            let value = parts.next().unwrap_or("");
            if key.is_empty() {
                continue;
            }
            info.insert(key, value);
        }
        info
    }

    /// Returns the value for `key`, or an empty string when absent
    pub fn value(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Sets a key, rejecting characters that would break the encoding and
    /// results longer than `MAX_INFO_STRING`
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), InfoError> {
        for s in [key, value] {
            if s.contains(['\\', ';', '"']) {
                return Err(InfoError::IllegalCharacter(s.to_string()));
            }
        }

        let mut candidate = self.clone();
        candidate.insert(key, value);
        let len = candidate.rendered_len();
        if len >= MAX_INFO_STRING {
            return Err(InfoError::TooLong(len));
        }
        *self = candidate;
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        self.pairs.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn rendered_len(&self) -> usize {
        self.pairs.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
    }

    fn insert(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.remove(key);
            return;
        }
        match self
            .pairs
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(pair) => pair.1 = value.to_string(),
            None => self.pairs.push((key.to_string(), value.to_string())),
        }
    }
}

impl fmt::Display for InfoString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.pairs {
            write!(f, "\\{}\\{}", k, v)?;
        }
        Ok(())
    }
}
