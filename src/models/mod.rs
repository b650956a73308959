//! Data model shared between the store, the workers and the control endpoint.

use serde::{Deserialize, Serialize};

/// The four worker modules, arranged as a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Crawler,
    Parser,
    Extractor,
    Analyzer,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Crawler => "crawler",
            ModuleKind::Parser => "parser",
            ModuleKind::Extractor => "extractor",
            ModuleKind::Analyzer => "analyzer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "crawler" => Some(ModuleKind::Crawler),
            "parser" => Some(ModuleKind::Parser),
            "extractor" => Some(ModuleKind::Extractor),
            "analyzer" => Some(ModuleKind::Analyzer),
            _ => None,
        }
    }

    /// Column holding the module's completion flag in a URL table.
    pub fn finished_column(&self) -> &'static str {
        match self {
            ModuleKind::Crawler => "crawled",
            ModuleKind::Parser => "parsed",
            ModuleKind::Extractor => "extracted",
            ModuleKind::Analyzer => "analyzed",
        }
    }

    /// Column holding the module's lock expiry in a URL table.
    pub fn lock_column(&self) -> &'static str {
        match self {
            ModuleKind::Crawler => "crawllock",
            ModuleKind::Parser => "parselock",
            ModuleKind::Extractor => "extractlock",
            ModuleKind::Analyzer => "analyzelock",
        }
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A website: the unit of multi-tenancy. Owns URL lists, queries and
/// configurations; its namespace prefixes all derived physical tables.
#[derive(Debug, Clone)]
pub struct Website {
    pub id: u64,
    pub name: String,
    pub namespace: String,
    pub domain: String,
}

/// A URL list: the unit of scheduling for a worker.
#[derive(Debug, Clone)]
pub struct UrlList {
    pub id: u64,
    pub website: u64,
    pub name: String,
    pub namespace: String,
}

/// Kind of a stored query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Regex,
    XPath,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Regex => "regex",
            QueryKind::XPath => "xpath",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "regex" => Some(QueryKind::Regex),
            "xpath" => Some(QueryKind::XPath),
            _ => None,
        }
    }
}

/// A stored query definition. `website == 0` means the query is global.
#[derive(Debug, Clone)]
pub struct QueryProperties {
    pub id: u64,
    pub website: u64,
    pub name: String,
    pub text: String,
    pub kind: QueryKind,
    pub result_bool: bool,
    pub result_single: bool,
    pub result_multi: bool,
    pub text_only: bool,
}

/// One `{cat, name, value}` triple of a stored configuration body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub cat: String,
    pub name: String,
    pub value: serde_json::Value,
}

/// A stored configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub id: u64,
    pub website: u64,
    pub module: String,
    pub name: String,
    pub config: String,
}

/// The website / URL list / configuration triple a worker runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadOptions {
    pub website: u64,
    pub url_list: u64,
    pub config: u64,
}

/// A persisted worker record; the single source of truth for resurrection.
#[derive(Debug, Clone)]
pub struct ThreadRow {
    pub id: u64,
    pub module: ModuleKind,
    pub status: String,
    pub paused: bool,
    pub options: ThreadOptions,
    pub last: u64,
    pub run_time: u64,
    pub pause_time: u64,
    pub progress: f64,
}

/// A URL together with its row id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlRef {
    pub id: u64,
    pub url: String,
}

impl UrlRef {
    pub fn new(id: u64, url: impl Into<String>) -> Self {
        Self { id, url: url.into() }
    }

    pub fn is_set(&self) -> bool {
        self.id != 0
    }

    pub fn clear(&mut self) {
        self.id = 0;
        self.url.clear();
    }
}

/// One entry of a Memento link-format document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memento {
    pub url: String,
    /// SQL timestamp of the capture.
    pub timestamp: String,
}
