//! Query engine: compiled queries over raw text (regex) or parsed HTML
//! (XPath, rendered as CSS selectors).
//!
//! Regex queries compile up to two variants, gated by the query's result
//! modes: a lightweight pattern for boolean/first-match evaluation and a
//! PCRE-style pattern for find-all. Queries are compiled once per worker
//! start.

pub mod xpath;

use scraper::{Html, Selector};
use thiserror::Error;

use crate::models::{QueryKind, QueryProperties};

use self::xpath::Extract;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("query compilation failed: {0}")]
    Compile(String),
    #[error("query evaluation failed: {0}")]
    Run(String),
}

/// A compiled query plus its result-mode flags.
pub struct CompiledQuery {
    pub kind: QueryKind,
    pub result_bool: bool,
    pub result_single: bool,
    pub result_multi: bool,
    pub text_only: bool,
    simple: Option<regex::Regex>,
    multi: Option<fancy_regex::Regex>,
    selector: Option<Selector>,
    extract: Extract,
}

impl CompiledQuery {
    pub fn compile(props: &QueryProperties) -> Result<Self, QueryError> {
        let mut query = CompiledQuery {
            kind: props.kind,
            result_bool: props.result_bool,
            result_single: props.result_single,
            result_multi: props.result_multi,
            text_only: props.text_only,
            simple: None,
            multi: None,
            selector: None,
            extract: Extract::Node,
        };

        match props.kind {
            QueryKind::Regex => {
                if props.result_bool || props.result_single {
                    query.simple = Some(
                        regex::Regex::new(&props.text)
                            .map_err(|e| QueryError::Compile(e.to_string()))?,
                    );
                }
                if props.result_multi {
                    query.multi = Some(
                        fancy_regex::Regex::new(&props.text)
                            .map_err(|e| QueryError::Compile(e.to_string()))?,
                    );
                }
            }
            QueryKind::XPath => {
                let (css, extract) = xpath::to_selector(&props.text)?;
                query.selector = Some(
                    Selector::parse(&css)
                        .map_err(|e| QueryError::Compile(e.to_string()))?,
                );
                query.extract = extract;
            }
        }

        Ok(query)
    }

    fn simple_regex(&self) -> Result<&regex::Regex, QueryError> {
        self.simple.as_ref().ok_or_else(|| {
            QueryError::Run("regex not compiled for boolean/first-match use".to_string())
        })
    }

    fn multi_regex(&self) -> Result<&fancy_regex::Regex, QueryError> {
        self.multi
            .as_ref()
            .ok_or_else(|| QueryError::Run("regex not compiled for find-all use".to_string()))
    }

    fn selector(&self) -> Result<&Selector, QueryError> {
        self.selector
            .as_ref()
            .ok_or_else(|| QueryError::Run("selector query used as regex".to_string()))
    }

    /// Does the pattern match anywhere in the text?
    pub fn match_bool(&self, text: &str) -> Result<bool, QueryError> {
        Ok(self.simple_regex()?.is_match(text))
    }

    /// First full match in the text.
    pub fn match_first(&self, text: &str) -> Result<Option<String>, QueryError> {
        Ok(self.simple_regex()?.find(text).map(|m| m.as_str().to_string()))
    }

    /// All full matches in the text.
    pub fn match_all(&self, text: &str) -> Result<Vec<String>, QueryError> {
        let mut results = Vec::new();
        for found in self.multi_regex()?.find_iter(text) {
            let found = found.map_err(|e| QueryError::Run(e.to_string()))?;
            results.push(found.as_str().to_string());
        }
        Ok(results)
    }

    fn extract_from(&self, element: scraper::ElementRef) -> Option<String> {
        match &self.extract {
            Extract::Attr(name) => element.value().attr(name).map(str::to_string),
            Extract::Text => Some(element.text().collect::<Vec<_>>().concat()),
            Extract::Node => {
                if self.text_only {
                    Some(element.text().collect::<Vec<_>>().concat())
                } else {
                    Some(element.html())
                }
            }
        }
    }

    /// Does the selector match any element of the document?
    pub fn select_bool(&self, document: &Html) -> Result<bool, QueryError> {
        let selector = self.selector()?;
        Ok(document
            .select(selector)
            .any(|el| self.extract_from(el).is_some()))
    }

    /// First extracted result from the document.
    pub fn select_first(&self, document: &Html) -> Result<Option<String>, QueryError> {
        let selector = self.selector()?;
        Ok(document
            .select(selector)
            .find_map(|el| self.extract_from(el)))
    }

    /// All extracted results from the document.
    pub fn select_all(&self, document: &Html) -> Result<Vec<String>, QueryError> {
        let selector = self.selector()?;
        Ok(document
            .select(selector)
            .filter_map(|el| self.extract_from(el))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(kind: QueryKind, text: &str, modes: (bool, bool, bool), text_only: bool) -> QueryProperties {
        QueryProperties {
            id: 1,
            website: 0,
            name: "test".to_string(),
            text: text.to_string(),
            kind,
            result_bool: modes.0,
            result_single: modes.1,
            result_multi: modes.2,
            text_only,
        }
    }

    #[test]
    fn regex_modes() {
        let query = CompiledQuery::compile(&props(
            QueryKind::Regex,
            r"\d+",
            (true, true, true),
            false,
        ))
        .unwrap();
        assert!(query.match_bool("abc 123").unwrap());
        assert!(!query.match_bool("abc").unwrap());
        assert_eq!(query.match_first("a 12 b 34").unwrap().as_deref(), Some("12"));
        assert_eq!(query.match_all("a 12 b 34").unwrap(), vec!["12", "34"]);
    }

    #[test]
    fn regex_variant_gating() {
        // only the find-all variant is compiled when only multi is requested
        let query = CompiledQuery::compile(&props(
            QueryKind::Regex,
            r"\d+",
            (false, false, true),
            false,
        ))
        .unwrap();
        assert!(query.match_bool("123").is_err());
        assert!(query.match_all("123").is_ok());
    }

    #[test]
    fn regex_compile_error_reported() {
        assert!(CompiledQuery::compile(&props(
            QueryKind::Regex,
            "(unclosed",
            (true, false, false),
            false,
        ))
        .is_err());
    }

    #[test]
    fn selector_attribute_extraction() {
        let query = CompiledQuery::compile(&props(
            QueryKind::XPath,
            "//a/@href",
            (false, false, true),
            false,
        ))
        .unwrap();
        let doc = Html::parse_document(
            r#"<html><body><a href="/one">1</a><a href="/two">2</a><a>none</a></body></html>"#,
        );
        assert_eq!(query.select_all(&doc).unwrap(), vec!["/one", "/two"]);
        assert_eq!(query.select_first(&doc).unwrap().as_deref(), Some("/one"));
        assert!(query.select_bool(&doc).unwrap());
    }

    #[test]
    fn text_only_walker() {
        let query = CompiledQuery::compile(&props(
            QueryKind::XPath,
            "//div[@class='post']",
            (false, true, false),
            true,
        ))
        .unwrap();
        let doc = Html::parse_document(
            r#"<html><body><div class="post">Hello <b>world</b>!</div></body></html>"#,
        );
        assert_eq!(
            query.select_first(&doc).unwrap().as_deref(),
            Some("Hello world!")
        );
    }
}
