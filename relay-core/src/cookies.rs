//! Normalizes pasted browser cookies into a name → value map.
//!
//! Two line shapes are recognized: Netscape cookie-file records (seven
//! tab-separated fields, name and value in the last two) and bare
//! `name=value` pairs. Anything else, including pairs that could not travel
//! in a `Cookie` header, is skipped silently.

use std::collections::BTreeMap;

use thiserror::Error;

const NETSCAPE_FIELDS: usize = 7;
const COMMENT_MARKER: char = '#';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CookieError {
    #[error("no usable credentials found in cookie text")]
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    entries: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn parse(text: &str) -> Result<Self, CookieError> {
        let mut entries = BTreeMap::new();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(COMMENT_MARKER) {
                continue;
            }
            if let Some((name, value)) = parse_line(line) {
                entries.insert(name, value);
            }
        }
        if entries.is_empty() {
            return Err(CookieError::Empty);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Renders the jar as a `Cookie` request header value.
    pub fn header_value(&self) -> String {
        self.iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Renders the jar as a Netscape cookie file scoped to `domain`.
    pub fn to_netscape(&self, domain: &str) -> String {
        let include_subdomains = if domain.starts_with('.') {
            "TRUE"
        } else {
            "FALSE"
        };
        let mut out = String::from("# Netscape HTTP Cookie File\n");
        for (name, value) in self.iter() {
            out.push_str(&format!(
                "{domain}\t{include_subdomains}\t/\tTRUE\t0\t{name}\t{value}\n"
            ));
        }
        out
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let fields: Vec<&str> = line.split('\t').collect();
    let (name, value) = if fields.len() >= NETSCAPE_FIELDS {
        (fields[5].trim(), fields[6].trim())
    } else {
        let (name, value) = line.split_once('=')?;
        (name.trim(), value.trim())
    };
    if !is_valid_name(name) || !is_valid_value(value) {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || matches!(c, ';' | ',' | '='))
}

fn is_valid_value(value: &str) -> bool {
    !value.chars().any(|c| c.is_control() || c == ';')
}
