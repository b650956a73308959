//! URL escaping and namespace helpers.
//!
//! Escaping preserves the reserved characters `;/?:@=&#%` so that a URL can
//! be escaped as a whole without destroying its structure.

/// Reserved characters left untouched by [`escape_url`].
const RESERVED: &[u8] = b";/?:@=&#%";

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

/// Percent-encode a string. With `plus_space` set, spaces become `+`.
pub fn escape(value: &str, plus_space: bool) -> String {
    let encoded = urlencoding::encode(value);
    if plus_space {
        encoded.replace("%20", "+")
    } else {
        encoded.into_owned()
    }
}

/// Decode a percent-encoded string. With `plus_space` set, `+` becomes a space.
pub fn unescape(value: &str, plus_space: bool) -> String {
    let value = if plus_space {
        value.replace('+', " ")
    } else {
        value.to_string()
    };
    urlencoding::decode(&value)
        .map(|v| v.into_owned())
        .unwrap_or(value)
}

/// Escape a whole URL, leaving the reserved set `;/?:@=&#%` intact.
pub fn escape_url(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    for &b in url.as_bytes() {
        if is_unreserved(b) || RESERVED.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Check a namespace: `[A-Za-z0-9$_]+`, at least four characters.
pub fn is_valid_namespace(namespace: &str) -> bool {
    namespace.len() >= 4
        && namespace
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'$' || b == b'_')
}

/// Derive a fresh namespace from an existing one by incrementing its trailing
/// number, probing until `exists` reports a free name.
pub fn duplicate_namespace(namespace: &str, mut exists: impl FnMut(&str) -> bool) -> String {
    let digits = namespace
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let (name, number) = namespace.split_at(digits);
    let mut n: u64 = number.parse().unwrap_or(1);

    loop {
        n += 1;
        let candidate = format!("{name}{n}");
        if !exists(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        // Unreserved characters plus the reserved allowlist survive a round trip.
        let input = "/path/to;page?a=1&b=2#frag:@x_~";
        assert_eq!(escape_url(input), input);
        assert_eq!(escape_url(&unescape(input, false)), input);
    }

    #[test]
    fn escape_url_preserves_reserved() {
        assert_eq!(escape_url("/a b?c=d&e=f"), "/a%20b?c=d&e=f");
        assert_eq!(escape_url("/ä"), "/%C3%A4");
    }

    #[test]
    fn plus_space_handling() {
        assert_eq!(escape("a b", true), "a+b");
        assert_eq!(unescape("a+b", true), "a b");
        assert_eq!(unescape("a%20b", false), "a b");
    }

    #[test]
    fn namespace_validation() {
        assert!(is_valid_namespace("news_2021"));
        assert!(is_valid_namespace("ab$_"));
        assert!(!is_valid_namespace("abc"));
        assert!(!is_valid_namespace("with-dash"));
        assert!(!is_valid_namespace("with space"));
    }

    #[test]
    fn namespace_duplication() {
        assert_eq!(duplicate_namespace("site", |_| false), "site2");
        assert_eq!(duplicate_namespace("site7", |_| false), "site8");
        let taken = ["site2", "site3"];
        assert_eq!(
            duplicate_namespace("site", |ns| taken.contains(&ns)),
            "site4"
        );
    }
}
