//! Parser for the Memento link-format
//! (`<url>; rel="memento"; datetime="…", <url2>; …`).
//!
//! Partially parseable documents yield their good entries plus warnings; the
//! `rel="timemap"` link, when present, points to the next page of a
//! paginated memento list.

use crate::models::Memento;
use crate::utils::datetime::convert_long_date;

/// Result of parsing one link-format document.
#[derive(Debug, Default)]
pub struct MementoDocument {
    pub mementos: Vec<Memento>,
    pub warnings: Vec<String>,
    /// URL of the next timemap page, if the document links one.
    pub next_page: String,
}

/// Parse a Memento link-format document. Timestamps are converted to SQL
/// format; entries with unparseable timestamps are dropped with a warning.
pub fn parse(content: &str) -> MementoDocument {
    let mut doc = MementoDocument::default();
    let bytes = content.as_bytes();
    let mut pos = 0;
    let mut started = false;
    let mut new_field = true;
    let mut current = Memento {
        url: String::new(),
        timestamp: String::new(),
    };

    while pos < bytes.len() {
        match bytes[pos] {
            b' ' | b'\r' | b'\n' | b'\t' => pos += 1,
            b'<' => {
                let Some(end) = content[pos + 1..].find('>').map(|i| pos + 1 + i) else {
                    doc.warnings.push(format!("no '>' after '<' for link at {pos}"));
                    break;
                };
                if started {
                    if !current.url.is_empty() && !current.timestamp.is_empty() {
                        doc.mementos.push(current.clone());
                    }
                    doc.warnings.push(format!(
                        "new memento started without finishing the old one at {pos}"
                    ));
                }
                started = true;
                current.url = content[pos + 1..end].to_string();
                current.timestamp.clear();
                pos = end + 1;
            }
            b';' => {
                new_field = true;
                pos += 1;
            }
            b',' => {
                if started {
                    if !current.url.is_empty() && !current.timestamp.is_empty() {
                        doc.mementos.push(current.clone());
                    }
                    started = false;
                }
                pos += 1;
            }
            _ => {
                if !new_field {
                    doc.warnings
                        .push(format!("field separator missing for new field at {pos}"));
                } else {
                    new_field = false;
                }
                let Some(eq) = content[pos..].find('=').map(|i| pos + i) else {
                    doc.warnings.push(format!("cannot find end of field at {pos}"));
                    break;
                };
                let field_name = content[pos..eq].trim().to_string();
                let Some(quote) = content[eq + 1..]
                    .find(['"', '\''])
                    .map(|i| eq + 1 + i)
                else {
                    doc.warnings
                        .push(format!("cannot find begin of value at {pos}"));
                    pos = eq + 1;
                    continue;
                };
                let Some(end_quote) = content[quote + 1..]
                    .find(['"', '\''])
                    .map(|i| quote + 1 + i)
                else {
                    doc.warnings.push(format!("cannot find end of value at {quote}"));
                    break;
                };
                let value = &content[quote + 1..end_quote];

                match field_name.as_str() {
                    "datetime" => match convert_long_date(value) {
                        Some(timestamp) => current.timestamp = timestamp,
                        None => doc
                            .warnings
                            .push(format!("could not convert timestamp '{value}' at {pos}")),
                    },
                    "rel" => {
                        if value == "timemap" && !current.url.is_empty() {
                            doc.next_page = std::mem::take(&mut current.url);
                        }
                    }
                    _ => {}
                }
                pos = end_quote + 1;
            }
        }
    }

    if started && !current.url.is_empty() && !current.timestamp.is_empty() {
        doc.mementos.push(current);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_mementos() {
        let content = "<http://archive.example/web/20210107120000/https://example.com/>; \
                       rel=\"memento\"; datetime=\"Thu, 07 Jan 2021 12:00:00 GMT\",\n\
                       <http://archive.example/web/20190301080000/https://example.com/>; \
                       rel=\"memento\"; datetime=\"Fri, 01 Mar 2019 08:00:00 GMT\"";
        let doc = parse(content);
        assert!(doc.warnings.is_empty());
        assert_eq!(doc.mementos.len(), 2);
        assert_eq!(doc.mementos[0].timestamp, "2021-01-07 12:00:00");
        assert_eq!(doc.mementos[1].timestamp, "2019-03-01 08:00:00");
        assert!(doc.next_page.is_empty());
    }

    #[test]
    fn extracts_next_timemap_page() {
        let content = "<http://archive.example/timemap/2/>; rel=\"timemap\",\n\
                       <http://archive.example/web/20210107120000/https://example.com/>; \
                       rel=\"memento\"; datetime=\"Thu, 07 Jan 2021 12:00:00 GMT\"";
        let doc = parse(content);
        assert_eq!(doc.next_page, "http://archive.example/timemap/2/");
        assert_eq!(doc.mementos.len(), 1);
    }

    #[test]
    fn bad_timestamp_warns_and_drops_entry() {
        let content =
            "<http://archive.example/m/>; rel=\"memento\"; datetime=\"not a date\"";
        let doc = parse(content);
        assert!(doc.mementos.is_empty());
        assert_eq!(doc.warnings.len(), 1);
    }

    #[test]
    fn unterminated_link_warns() {
        let doc = parse("<http://archive.example/broken");
        assert!(doc.mementos.is_empty());
        assert!(!doc.warnings.is_empty());
    }

    #[test]
    fn missing_separator_still_parses() {
        let content = "<http://a/m/>; rel=\"memento\" datetime=\"Thu, 07 Jan 2021 12:00:00 GMT\"";
        let doc = parse(content);
        assert_eq!(doc.mementos.len(), 1);
        assert!(doc
            .warnings
            .iter()
            .any(|w| w.contains("field separator missing")));
    }
}
