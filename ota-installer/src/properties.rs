// Descriptor (JAD) and manifest attribute stores.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIDLET_NAME: &str = "MIDlet-Name";
pub const MIDLET_VENDOR: &str = "MIDlet-Vendor";
pub const MIDLET_VERSION: &str = "MIDlet-Version";
pub const MIDLET_JAR_URL: &str = "MIDlet-Jar-URL";
pub const MIDLET_JAR_SIZE: &str = "MIDlet-Jar-Size";
pub const MIDLET_DATA_SIZE: &str = "MIDlet-Data-Size";
pub const MIDLET_DESCRIPTION: &str = "MIDlet-Description";
pub const MIDLET_PERMISSIONS: &str = "MIDlet-Permissions";
pub const MIDLET_PERMISSIONS_OPT: &str = "MIDlet-Permissions-Opt";
pub const MIDLET_INSTALL_NOTIFY: &str = "MIDlet-Install-Notify";
pub const MIDLET_JAR_RSA_SHA1: &str = "MIDlet-Jar-RSA-SHA1";
pub const MICROEDITION_CONFIGURATION: &str = "MicroEdition-Configuration";
pub const MICROEDITION_PROFILE: &str = "MicroEdition-Profile";
/// Prefix of the 1-based `MIDlet-<n>` sequence.
pub const MIDLET_PREFIX: &str = "MIDlet-";
/// Prefix of the 1-based `MIDlet-Push-<n>` sequence.
pub const MIDLET_PUSH_PREFIX: &str = "MIDlet-Push-";

/// Upper bound on attributes accepted from one descriptor or manifest.
pub const MAX_PROPERTIES: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("line {line} is not a 'key: value' attribute")]
    MalformedLine { line: usize },
    #[error("line {line} has an invalid attribute name")]
    InvalidKey { line: usize },
    #[error("more than {MAX_PROPERTIES} attributes")]
    TooManyProperties,
    #[error("content is not valid {0}")]
    InvalidEncoding(&'static str),
    #[error("unsupported charset '{0}'")]
    UnsupportedCharset(String),
}

/// Text encodings accepted for descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
}

impl Charset {
    /// Resolve a `charset=` label; `None` selects the UTF-8 default.
    pub fn from_label(label: Option<&str>) -> Result<Self, PropertyError> {
        let Some(label) = label else {
            return Ok(Self::Utf8);
        };
        match label.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "iso-8859-1" | "iso8859-1" | "iso_8859-1" | "latin1" | "us-ascii" => Ok(Self::Latin1),
            other => Err(PropertyError::UnsupportedCharset(other.to_string())),
        }
    }

    fn decode(self, bytes: &[u8]) -> Result<String, PropertyError> {
        match self {
            Self::Utf8 => {
                let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
                String::from_utf8(bytes.to_vec()).map_err(|_| PropertyError::InvalidEncoding("UTF-8"))
            }
            Self::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

/// Ordered attribute store. Lookups are case-sensitive; the first value added for a key wins
/// unless it is explicitly overwritten with [`PropertyStore::set`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyStore {
    entries: Vec<(String, String)>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value with surrounding whitespace removed; blank values read as absent.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Add unless the key is already present. Returns whether the value was stored.
    pub fn add_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.contains_key(&key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    /// Insert or overwrite.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Values of `<prefix>1`, `<prefix>2`, ... up to the first gap in the sequence.
    pub fn numbered<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (usize, &'a str)> + 'a {
        (1..)
            .map(move |n| (n, self.get(&format!("{}{}", prefix, n))))
            .take_while(|(_, v)| v.is_some())
            .filter_map(|(n, v)| v.map(|v| (n, v)))
    }
}

fn key_regex() -> Result<Regex, PropertyError> {
    // Attribute names are printable, without whitespace or ':'.
    Regex::new(r"^[^\s:\x00-\x1f\x7f]+$").map_err(|_| PropertyError::InvalidKey { line: 0 })
}

fn push_property(
    store: &mut PropertyStore,
    key: &str,
    value: &str,
    line: usize,
    key_re: &Regex,
) -> Result<(), PropertyError> {
    if !key_re.is_match(key) {
        return Err(PropertyError::InvalidKey { line });
    }
    if store.len() >= MAX_PROPERTIES && !store.contains_key(key) {
        return Err(PropertyError::TooManyProperties);
    }
    store.add_if_absent(key, value.trim());
    Ok(())
}

/// Parse an application descriptor. Blank lines are ignored; values are trimmed.
pub fn parse_descriptor(bytes: &[u8], charset: Charset) -> Result<PropertyStore, PropertyError> {
    let text = charset.decode(bytes)?;
    let key_re = key_regex()?;
    let mut store = PropertyStore::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or(PropertyError::MalformedLine { line: line_no })?;
        push_property(&mut store, key.trim(), value, line_no, &key_re)?;
    }

    Ok(store)
}

/// Parse the main section of an archive manifest (always UTF-8).
///
/// A line starting with a single space continues the previous value. The main section ends at
/// the first blank line that follows at least one attribute.
pub fn parse_manifest(bytes: &[u8]) -> Result<PropertyStore, PropertyError> {
    let text = Charset::Utf8.decode(bytes)?;
    let key_re = key_regex()?;
    let mut store = PropertyStore::new();
    let mut pending: Option<(String, String, usize)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end_matches('\r');

        if let Some(continuation) = line.strip_prefix(' ') {
            match pending.as_mut() {
                Some((_, value, _)) => value.push_str(continuation),
                None => return Err(PropertyError::MalformedLine { line: line_no }),
            }
            continue;
        }

        if let Some((key, value, at)) = pending.take() {
            push_property(&mut store, &key, &value, at, &key_re)?;
        }

        if line.is_empty() {
            if store.is_empty() {
                continue;
            }
            break;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(PropertyError::MalformedLine { line: line_no })?;
        let value = value.strip_prefix(' ').unwrap_or(value);
        pending = Some((key.to_string(), value.to_string(), line_no));
    }

    if let Some((key, value, at)) = pending {
        push_property(&mut store, &key, &value, at, &key_re)?;
    }

    Ok(store)
}
