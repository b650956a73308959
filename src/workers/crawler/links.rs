//! Link post-processing: cleaning raw extraction results, resolving them
//! against the current URL, domain filtering and query-parameter pruning.

use url::Url;

use crate::utils::urls::{escape_url, unescape};

/// Clean one raw link: strip the fragment, trim, unescape `&amp;`, escape.
pub fn clean_raw_link(raw: &str) -> String {
    let without_fragment = match raw.find('#') {
        Some(0) => "",
        Some(pos) => &raw[..pos],
        None => raw,
    };
    let trimmed = without_fragment.trim();
    escape_url(&trimmed.replace("&amp;", "&"))
}

/// Archive pages embed the original URL behind the archive prefix; only the
/// absolute URL after the last inner `http(s)://` is the real link.
pub fn strip_archive_prefix(link: &str) -> Option<String> {
    if link.len() < 2 {
        return None;
    }
    let https = link[1..].rfind("https://").map(|i| i + 1);
    let http = link[1..].rfind("http://").map(|i| i + 1);
    let pos = match (https, http) {
        (Some(a), Some(b)) => a.max(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some(unescape(&link[pos..], false))
}

/// Outcome of resolving one cleaned link.
#[derive(Debug, PartialEq, Eq)]
pub enum ResolvedLink {
    /// A same-domain sub-URL starting with `/`.
    SubUrl(String),
    /// A link to a different host.
    OtherDomain,
    /// Not a resolvable URL.
    Invalid(String),
}

/// Resolve a link against the current URL per RFC 3986 and reduce it to a
/// sub-URL of the worker's domain, applying the query-parameter filter.
pub fn resolve_link(
    domain: &str,
    current_sub_url: &str,
    link: &str,
    params_blacklist: &[String],
    params_whitelist: &[String],
) -> ResolvedLink {
    let base = match Url::parse(&format!("https://{domain}{current_sub_url}")) {
        Ok(base) => base,
        Err(e) => return ResolvedLink::Invalid(format!("invalid base URL: {e}")),
    };
    let resolved = match base.join(link) {
        Ok(resolved) => resolved,
        Err(e) => return ResolvedLink::Invalid(format!("could not resolve '{link}': {e}")),
    };

    match resolved.host_str() {
        Some(host) if host.eq_ignore_ascii_case(domain) => {}
        _ => return ResolvedLink::OtherDomain,
    }

    let mut sub_url = resolved.path().to_string();
    let kept: Vec<(String, String)> = resolved
        .query_pairs()
        .filter(|(key, _)| {
            if !params_blacklist.is_empty() {
                !params_blacklist.iter().any(|p| p == key)
            } else if !params_whitelist.is_empty() {
                params_whitelist.iter().any(|p| p == key)
            } else {
                true
            }
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !kept.is_empty() {
        let mut query = String::new();
        for (key, value) in kept {
            if !query.is_empty() {
                query.push('&');
            }
            if value.is_empty() {
                query.push_str(&key);
            } else {
                query.push_str(&format!("{key}={value}"));
            }
        }
        sub_url.push('?');
        sub_url.push_str(&query);
    }
    ResolvedLink::SubUrl(sub_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleaning_strips_fragment_and_entities() {
        assert_eq!(clean_raw_link("/page#section"), "/page");
        assert_eq!(clean_raw_link("#top"), "");
        assert_eq!(clean_raw_link(" /a?x=1&amp;y=2 "), "/a?x=1&y=2");
    }

    #[test]
    fn resolves_relative_and_absolute_links() {
        assert_eq!(
            resolve_link("example.com", "/dir/page", "other", &[], &[]),
            ResolvedLink::SubUrl("/dir/other".to_string())
        );
        assert_eq!(
            resolve_link("example.com", "/dir/page", "/rooted", &[], &[]),
            ResolvedLink::SubUrl("/rooted".to_string())
        );
        assert_eq!(
            resolve_link("example.com", "/", "https://example.com/abs", &[], &[]),
            ResolvedLink::SubUrl("/abs".to_string())
        );
    }

    #[test]
    fn rejects_foreign_domains() {
        assert_eq!(
            resolve_link("example.com", "/", "https://other.org/x", &[], &[]),
            ResolvedLink::OtherDomain
        );
        assert_eq!(
            resolve_link("example.com", "/", "https://www.example.com/x", &[], &[]),
            ResolvedLink::OtherDomain
        );
    }

    #[test]
    fn parameter_blacklist_removes_listed_keys() {
        assert_eq!(
            resolve_link(
                "example.com",
                "/",
                "/page?keep=1&session=abc",
                &["session".to_string()],
                &[]
            ),
            ResolvedLink::SubUrl("/page?keep=1".to_string())
        );
    }

    #[test]
    fn parameter_whitelist_keeps_only_listed_keys() {
        assert_eq!(
            resolve_link(
                "example.com",
                "/",
                "/page?page=2&tracking=x",
                &[],
                &["page".to_string()]
            ),
            ResolvedLink::SubUrl("/page?page=2".to_string())
        );
    }

    #[test]
    fn archive_prefix_stripping() {
        assert_eq!(
            strip_archive_prefix(
                "http://web.archive.org/web/20210107120000/https://example.com/page"
            )
            .as_deref(),
            Some("https://example.com/page")
        );
        assert_eq!(strip_archive_prefix("/relative/link"), None);
    }
}
