use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Grammar every special-source nick must satisfy.
pub static STRICT_NICK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_.-]{1,32}$").expect("valid strict nick regex"));

/// Letters NFKD leaves intact, mapped to their conventional ASCII spelling.
fn transliterate(c: char) -> Option<&'static str> {
    Some(match c {
        'ß' => "ss",
        'ẞ' => "ss",
        'æ' | 'Æ' => "ae",
        'ø' | 'Ø' => "o",
        'œ' | 'Œ' => "oe",
        'đ' | 'Đ' => "d",
        'ð' | 'Ð' => "d",
        'ł' | 'Ł' => "l",
        'þ' | 'Þ' => "th",
        'ı' => "i",
        _ => return None,
    })
}

/// Canonical form of a raw value: lowercase ASCII restricted to
/// `[a-z0-9_.\- ]`, single spaces, trimmed. May be empty.
pub fn normalize_nick(raw: &str) -> String {
    let mut folded = String::with_capacity(raw.len());
    for c in raw.trim().to_lowercase().nfkd() {
        if is_combining_mark(c) {
            continue;
        }
        match transliterate(c) {
            Some(ascii) => folded.push_str(ascii),
            None => folded.push(c),
        }
    }

    let mut out = String::with_capacity(folded.len());
    let mut pending_space = false;
    for c in folded.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-' | ' ')) {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }
    out
}

/// Coerces a JSON cell to text. Null and nested values yield an empty string.
pub fn json_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => String::new(),
    }
}

/// Normalizes then applies the strict special-source grammar.
pub fn normalize_strict(raw: &str) -> Option<String> {
    let nick = normalize_nick(raw);
    STRICT_NICK.is_match(&nick).then_some(nick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    static GRAMMAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_.\- ]*$").unwrap());

    #[test]
    fn test_normalize_examples() {
        assert_eq!(normalize_nick("  Alice  "), "alice");
        assert_eq!(normalize_nick("José"), "jose");
        assert_eq!(normalize_nick("Zoë_Ångström"), "zoe_angstrom");
        assert_eq!(normalize_nick("Straße"), "strasse");
        assert_eq!(normalize_nick("Łukasz Øster"), "lukasz oster");
        assert_eq!(normalize_nick("john   \t doe"), "john doe");
        assert_eq!(normalize_nick("x!@#y"), "xy");
        assert_eq!(normalize_nick("ｆｕｌｌｗｉｄｔｈ"), "fullwidth");
        assert_eq!(normalize_nick("日本"), "");
        assert_eq!(normalize_nick("a - b"), "a - b");
    }

    #[test]
    fn test_space_runs_around_stripped_chars_collapse() {
        assert_eq!(normalize_nick("a ! b"), "a b");
        assert_eq!(normalize_nick("! leading"), "leading");
        assert_eq!(normalize_nick("trailing !"), "trailing");
    }

    #[test]
    fn test_json_coercion() {
        assert_eq!(json_to_text(&serde_json::json!("x")), "x");
        assert_eq!(json_to_text(&serde_json::json!(42)), "42");
        assert_eq!(json_to_text(&serde_json::json!(true)), "true");
        assert_eq!(json_to_text(&serde_json::json!(null)), "");
        assert_eq!(json_to_text(&serde_json::json!({"a": 1})), "");
    }

    #[test]
    fn test_strict_grammar() {
        assert_eq!(normalize_strict("Zezima").as_deref(), Some("zezima"));
        assert_eq!(normalize_strict("two words"), None);
        assert_eq!(normalize_strict(&"a".repeat(33)), None);
        assert_eq!(normalize_strict("!!!"), None);
    }

    proptest! {
        #[test]
        fn prop_normalization_is_idempotent(input in any::<String>()) {
            let once = normalize_nick(&input);
            prop_assert_eq!(normalize_nick(&once), once);
        }

        #[test]
        fn prop_output_matches_grammar(input in any::<String>()) {
            let out = normalize_nick(&input);
            prop_assert!(GRAMMAR.is_match(&out));
            prop_assert_eq!(out.trim(), out.as_str());
            prop_assert!(!out.contains("  "));
        }
    }
}
