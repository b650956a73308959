//! Translation of a supported XPath subset into CSS selectors.
//!
//! Supported: absolute paths with `/` (child) and `//` (descendant) steps,
//! `*` and element names, predicates `[@attr]`, `[@attr='v']` and
//! `[contains(@attr,'v')]`, and a final extraction step `/@attr` or
//! `/text()`. Anything else is a compile error.

use super::QueryError;

/// What to pull out of a matched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract {
    /// The serialised element itself.
    Node,
    /// One attribute value.
    Attr(String),
    /// The concatenated text content.
    Text,
}

fn translate_predicate(pred: &str, css: &mut String) -> Result<(), QueryError> {
    let pred = pred.trim();
    if let Some(rest) = pred.strip_prefix("contains(") {
        let rest = rest
            .strip_suffix(')')
            .ok_or_else(|| QueryError::Compile(format!("unterminated contains() in '{pred}'")))?;
        let (attr, value) = rest
            .split_once(',')
            .ok_or_else(|| QueryError::Compile(format!("contains() needs two arguments: '{pred}'")))?;
        let attr = attr
            .trim()
            .strip_prefix('@')
            .ok_or_else(|| QueryError::Compile(format!("contains() only supports attributes: '{pred}'")))?;
        let value = strip_quotes(value.trim())?;
        css.push_str(&format!("[{attr}*=\"{value}\"]"));
        return Ok(());
    }

    let pred = pred
        .strip_prefix('@')
        .ok_or_else(|| QueryError::Compile(format!("unsupported predicate '[{pred}]'")))?;
    match pred.split_once('=') {
        Some((attr, value)) => {
            let value = strip_quotes(value.trim())?;
            css.push_str(&format!("[{}=\"{value}\"]", attr.trim()));
        }
        None => css.push_str(&format!("[{pred}]")),
    }
    Ok(())
}

fn strip_quotes(value: &str) -> Result<&str, QueryError> {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'\'' || bytes[0] == b'"') && bytes[bytes.len() - 1] == bytes[0]
    {
        Ok(&value[1..value.len() - 1])
    } else {
        Err(QueryError::Compile(format!("expected quoted value, got '{value}'")))
    }
}

fn translate_step(step: &str, css: &mut String) -> Result<(), QueryError> {
    let (name, mut rest) = match step.find('[') {
        Some(pos) => (&step[..pos], &step[pos..]),
        None => (step, ""),
    };
    if name.is_empty() {
        return Err(QueryError::Compile("empty location step".to_string()));
    }
    if name != "*" && !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
        return Err(QueryError::Compile(format!("unsupported location step '{step}'")));
    }
    css.push_str(name);

    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(QueryError::Compile(format!("malformed predicate in '{step}'")));
        }
        let end = rest
            .find(']')
            .ok_or_else(|| QueryError::Compile(format!("unterminated predicate in '{step}'")))?;
        translate_predicate(&rest[1..end], css)?;
        rest = &rest[end + 1..];
    }
    Ok(())
}

/// Compile an XPath expression into a CSS selector string plus an extraction
/// mode for the matched elements.
pub fn to_selector(xpath: &str) -> Result<(String, Extract), QueryError> {
    let xpath = xpath.trim();
    if !xpath.starts_with('/') {
        return Err(QueryError::Compile(format!(
            "only absolute paths are supported: '{xpath}'"
        )));
    }

    let mut css = String::new();
    let mut extract = Extract::Node;
    let mut rest = xpath;

    while !rest.is_empty() {
        let descendant = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            true
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            false
        } else {
            return Err(QueryError::Compile(format!("malformed path near '{rest}'")));
        };

        let end = rest.find('/').unwrap_or(rest.len());
        let step = &rest[..end];
        rest = &rest[end..];

        if let Some(attr) = step.strip_prefix('@') {
            if !rest.is_empty() {
                return Err(QueryError::Compile(
                    "attribute step must be the last step".to_string(),
                ));
            }
            extract = Extract::Attr(attr.to_string());
            break;
        }
        if step == "text()" {
            if !rest.is_empty() {
                return Err(QueryError::Compile(
                    "text() step must be the last step".to_string(),
                ));
            }
            extract = Extract::Text;
            break;
        }

        if !css.is_empty() {
            css.push_str(if descendant { " " } else { " > " });
        }
        translate_step(step, &mut css)?;
    }

    if css.is_empty() {
        return Err(QueryError::Compile(format!("no element step in '{xpath}'")));
    }
    Ok((css, extract))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_descendant_path() {
        assert_eq!(to_selector("//a").unwrap(), ("a".to_string(), Extract::Node));
    }

    #[test]
    fn attribute_extraction() {
        assert_eq!(
            to_selector("//a/@href").unwrap(),
            ("a".to_string(), Extract::Attr("href".to_string()))
        );
    }

    #[test]
    fn child_and_descendant_combinators() {
        assert_eq!(
            to_selector("/html/body//p/text()").unwrap(),
            ("html > body p".to_string(), Extract::Text)
        );
    }

    #[test]
    fn attribute_predicates() {
        assert_eq!(
            to_selector("//div[@class='post']//a/@href").unwrap(),
            ("div[class=\"post\"] a".to_string(), Extract::Attr("href".to_string()))
        );
        assert_eq!(
            to_selector("//img[@alt]").unwrap(),
            ("img[alt]".to_string(), Extract::Node)
        );
        assert_eq!(
            to_selector("//a[contains(@href,'article')]").unwrap(),
            ("a[href*=\"article\"]".to_string(), Extract::Node)
        );
    }

    #[test]
    fn rejects_unsupported_expressions() {
        assert!(to_selector("a").is_err());
        assert!(to_selector("//a/@href/b").is_err());
        assert!(to_selector("//a[position()=1]").is_err());
        assert!(to_selector("//a[@href=unquoted]").is_err());
    }
}
