use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Items
// ============================================================================

/// Popularity as reported by the source: a counter, a score, or free text
/// such as "1.2万".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Popularity {
    Count(i64),
    Score(f64),
    Label(String),
}

impl From<i64> for Popularity {
    fn from(n: i64) -> Self {
        Popularity::Count(n)
    }
}

impl From<&str> for Popularity {
    fn from(s: &str) -> Self {
        Popularity::Label(s.to_string())
    }
}

/// The shape every adapter produces, whatever the upstream format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedItem {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity: Option<Popularity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_millis: Option<i64>,
    /// Together with the owning source, the dedup key.
    pub canonical_url: String,
    pub mobile_url: String,
}

impl NormalizedItem {
    /// Item with only the required fields; the mobile URL defaults to `url`.
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            cover_url: None,
            author: None,
            popularity: None,
            timestamp_millis: None,
            mobile_url: url.clone(),
            canonical_url: url,
        }
    }
}

// ============================================================================
// Source metadata
// ============================================================================

/// Static metadata registered once per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub name: String,
    pub title: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SourceDescriptor {
    pub fn new(
        name: impl Into<String>,
        title: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            category: category.into(),
            homepage: None,
            description: None,
        }
    }

    pub fn homepage(mut self, link: impl Into<String>) -> Self {
        self.homepage = Some(link.into());
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }
}

/// A selectable adapter parameter: display label plus value -> label choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamChoices {
    pub label: String,
    pub values: BTreeMap<String, String>,
}

impl ParamChoices {
    pub fn new<I, K, V>(label: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            label: label.into(),
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// String-keyed parameter bag passed to every adapter.
///
/// Each adapter documents the keys it reads and ignores the rest. `limit` and
/// `type` are understood by every caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    params: BTreeMap<String, String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The `type` parameter, when present and non-empty.
    pub fn kind(&self) -> Option<&str> {
        self.get("type").filter(|v| !v.is_empty())
    }

    /// The `limit` parameter as a positive count. Unparseable or zero values
    /// are treated as absent.
    pub fn limit(&self) -> Option<usize> {
        self.get("limit")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parse a `key=value` pair. The value may itself contain `=`.
    pub fn parse_pair(raw: &str) -> Result<(String, String), String> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty key in '{raw}'"));
        }
        Ok((key.to_string(), value.trim().to_string()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ListOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = Self::new();
        for (k, v) in iter {
            options.insert(k, v);
        }
        options
    }
}

// ============================================================================
// Results
// ============================================================================

/// What an adapter returns. Unset fields are filled in from the descriptor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceList {
    pub items: Vec<NormalizedItem>,
    pub category: Option<String>,
    /// Whether the adapter's data came from cache, when it can tell.
    pub from_cache: Option<bool>,
    pub params: BTreeMap<String, ParamChoices>,
}

impl SourceList {
    pub fn new(items: Vec<NormalizedItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }
}

/// A list response as served to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    pub name: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub total: usize,
    pub items: Vec<NormalizedItem>,
    pub served_from_cache: bool,
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectable_params: Option<BTreeMap<String, ParamChoices>>,
    /// Set only on degraded results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ListResult {
    /// Empty result for a source whose adapter failed.
    pub fn degraded(descriptor: &SourceDescriptor, message: impl Into<String>) -> Self {
        Self {
            name: descriptor.name.clone(),
            title: descriptor.title.clone(),
            category_label: Some(descriptor.category.clone()),
            link: descriptor.homepage.clone(),
            description: descriptor.description.clone(),
            total: 0,
            items: Vec::new(),
            served_from_cache: false,
            fetched_at: Utc::now(),
            selectable_params: None,
            message: Some(message.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.message.is_some()
    }
}
