//! Cache key derivation.
//!
//! A key is `namespace:subject` optionally followed by `:digest`, where the
//! digest is a 128-bit hash of the request parameters in canonical form.
//! Parameters are held in a sorted map and every value is normalised to text
//! before hashing, so insertion order and scalar representation (`30` vs
//! `30.0` vs `"30"`) never change the key.
//!
//! Subjects may not contain the delimiter. That keeps [`SubjectScope`]
//! unambiguous: `forecast:42:` never matches a key that belongs to `420`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{CacheResult, KeyError};

/// Separator between key segments.
pub const KEY_DELIMITER: char = ':';

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "forecast";

/// Number of digest bytes kept (128 bits).
const DIGEST_BYTES: usize = 16;

/// An opaque, fully derived cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap a key that was derived elsewhere (e.g. received from a caller).
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A parameter value normalised to its text form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamValue(String);

impl ParamValue {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self(value.to_string())
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        // f64's Display drops a zero fraction, so 30.0 and 30 agree.
        Self(value.to_string())
    }
}

impl From<f32> for ParamValue {
    fn from(value: f32) -> Self {
        Self(value.to_string())
    }
}

macro_rules! param_value_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(value: $ty) -> Self {
                    Self(value.to_string())
                }
            }
        )*
    };
}

param_value_from_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl From<&Value> for ParamValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => Self(s.clone()),
            Value::Bool(b) => Self::from(*b),
            Value::Null => Self("null".to_string()),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::from(i)
                } else if let Some(u) = n.as_u64() {
                    Self::from(u)
                } else {
                    Self::from(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            // Nested structures keep their compact JSON form.
            other => Self(other.to_string()),
        }
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        Self::from(&value)
    }
}

/// Request parameters that contribute to a cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyParams {
    entries: BTreeMap<String, ParamValue>,
}

impl KeyParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter, returning the previous value.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<ParamValue>,
    ) -> Option<ParamValue> {
        self.entries.insert(name.into(), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Build from the fields of a JSON object.
    pub fn from_json(map: &serde_json::Map<String, Value>) -> Self {
        map.iter()
            .map(|(name, value)| (name.clone(), ParamValue::from(value)))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(ParamValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate parameters in canonical (lexicographic) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Canonical serialization: a compact JSON object with sorted keys.
    pub fn canonical(&self) -> String {
        let object: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.0.clone())))
            .collect();
        Value::Object(object).to_string()
    }

    /// Hex-encoded 128-bit digest of the canonical form.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.canonical().as_bytes());
        hex::encode(&hash[..DIGEST_BYTES])
    }
}

impl<K, V> FromIterator<(K, V)> for KeyParams
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        params.extend(iter);
        params
    }
}

impl<K, V> Extend<(K, V)> for KeyParams
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

/// Derives namespaced cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDeriver {
    namespace: String,
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl KeyDeriver {
    pub fn new(namespace: impl Into<String>) -> CacheResult<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self { namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `namespace:`, the prefix shared by every key this deriver produces.
    pub fn namespace_prefix(&self) -> String {
        format!("{}{}", self.namespace, KEY_DELIMITER)
    }

    /// Remote scan pattern matching every key in the namespace.
    pub fn namespace_pattern(&self) -> String {
        format!("{}*", escape_glob(&self.namespace_prefix()))
    }

    /// Derive the key for `subject` under `params`.
    ///
    /// The digest segment is omitted when `params` is empty.
    pub fn derive(&self, subject: &str, params: &KeyParams) -> CacheResult<CacheKey> {
        validate_subject(subject)?;

        let mut key = self.base(subject);
        if !params.is_empty() {
            key.push(KEY_DELIMITER);
            key.push_str(&params.digest());
        }
        Ok(CacheKey(key))
    }

    /// The invalidation scope covering every key derived for `subject`.
    pub fn scope(&self, subject: &str) -> CacheResult<SubjectScope> {
        validate_subject(subject)?;

        let exact = self.base(subject);
        let mut prefix = exact.clone();
        prefix.push(KEY_DELIMITER);
        Ok(SubjectScope { exact, prefix })
    }

    fn base(&self, subject: &str) -> String {
        let mut key = String::with_capacity(self.namespace.len() + subject.len() + 34);
        key.push_str(&self.namespace);
        key.push(KEY_DELIMITER);
        key.push_str(subject);
        key
    }
}

/// Derive a key under [`DEFAULT_NAMESPACE`].
pub fn derive_key(subject: &str, params: &KeyParams) -> CacheResult<CacheKey> {
    KeyDeriver::default().derive(subject, params)
}

/// Every key belonging to one subject: the bare key plus the
/// delimiter-terminated prefix shared by its parameterised keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectScope {
    exact: String,
    prefix: String,
}

impl SubjectScope {
    pub fn exact_key(&self) -> &str {
        &self.exact
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn matches(&self, key: &str) -> bool {
        key == self.exact || key.starts_with(&self.prefix)
    }

    /// Glob pattern for remote key scans, with the prefix escaped.
    pub fn remote_pattern(&self) -> String {
        let mut pattern = escape_glob(&self.prefix);
        pattern.push('*');
        pattern
    }
}

/// Escape glob metacharacters so the text matches literally.
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn validate_subject(subject: &str) -> Result<(), KeyError> {
    if subject.is_empty() {
        return Err(KeyError::EmptySubject);
    }
    if subject.contains(KEY_DELIMITER) {
        return Err(KeyError::InvalidSubject {
            subject: subject.to_string(),
            reason: format!("must not contain '{}'", KEY_DELIMITER),
        });
    }
    Ok(())
}

pub(crate) fn validate_namespace(namespace: &str) -> Result<(), KeyError> {
    if namespace.is_empty() {
        return Err(KeyError::InvalidNamespace {
            namespace: namespace.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    if namespace.contains(KEY_DELIMITER) {
        return Err(KeyError::InvalidNamespace {
            namespace: namespace.to_string(),
            reason: format!("must not contain '{}'", KEY_DELIMITER),
        });
    }
    Ok(())
}
