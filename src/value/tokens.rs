//! Tokenization for full-text style predicates (`TOKENS`, `CONTAINS_TOKEN`).

use super::Value;
use std::collections::BTreeSet;

/// Case folding applied to every token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseFold {
    #[default]
    None,
    Lower,
    Upper,
}

impl CaseFold {
    fn apply(self, s: &str) -> String {
        match self {
            CaseFold::None => s.to_string(),
            CaseFold::Lower => s.to_lowercase(),
            CaseFold::Upper => s.to_uppercase(),
        }
    }
}

/// Options controlling [`Value::tokens`].
///
/// Parsed from an options object such as
/// `{"case": "lower", "split": true, "specials": true}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenOptions {
    pub case: CaseFold,
    /// Split strings on non-alphanumerics. When false the whole string is
    /// one token.
    pub split: bool,
    /// Trim surrounding whitespace of unsplit strings.
    pub trim: bool,
    /// Also emit whitespace/bracket-delimited tokens with trailing
    /// punctuation removed, keeping e-mail addresses and URLs whole.
    pub specials: bool,
}

impl Default for TokenOptions {
    fn default() -> Self {
        Self {
            case: CaseFold::None,
            split: true,
            trim: true,
            specials: false,
        }
    }
}

impl TokenOptions {
    /// Read options from an object value. Unknown fields and fields of the
    /// wrong type keep their defaults.
    pub fn from_value(options: &Value) -> Self {
        let mut opts = Self::default();

        if let Some(case) = options.field("case").0.as_string() {
            opts.case = match case.to_lowercase().as_str() {
                "lower" => CaseFold::Lower,
                "upper" => CaseFold::Upper,
                _ => CaseFold::None,
            };
        }
        if let Some(split) = options.field("split").0.as_bool() {
            opts.split = split;
        }
        if let Some(trim) = options.field("trim").0.as_bool() {
            opts.trim = trim;
        }
        if let Some(specials) = options.field("specials").0.as_bool() {
            opts.specials = specials;
        }
        opts
    }
}

impl Value {
    /// Distinct tokens of this value under `options`.
    ///
    /// Arrays contribute the tokens of their elements, objects the tokens of
    /// their field names and values. Missing and null contribute nothing.
    pub fn tokens(&self, options: &TokenOptions) -> BTreeSet<String> {
        let mut set = BTreeSet::new();
        self.collect_tokens(options, &mut set);
        set
    }

    /// Whether `token`, case folded like the tokens, is among the tokens of
    /// this value.
    pub fn contains_token(&self, token: &Value, options: &TokenOptions) -> bool {
        match token {
            Value::String(t) => self.tokens(options).contains(&options.case.apply(t)),
            _ => false,
        }
    }

    fn collect_tokens(&self, options: &TokenOptions, set: &mut BTreeSet<String>) {
        match self {
            Value::Missing | Value::Null => {}
            Value::Boolean(b) => {
                set.insert(b.to_string());
            }
            Value::Number(n) => {
                set.insert(n.to_string());
            }
            Value::String(s) => string_tokens(s, options, set),
            Value::Array(arr) => {
                for item in arr {
                    item.collect_tokens(options, set);
                }
            }
            Value::Object(obj) => {
                for (key, value) in obj {
                    string_tokens(key, options, set);
                    value.collect_tokens(options, set);
                }
            }
        }
    }
}

fn string_tokens(s: &str, options: &TokenOptions, set: &mut BTreeSet<String>) {
    if !options.split {
        let field = if options.trim { s.trim() } else { s };
        set.insert(options.case.apply(field));
        return;
    }

    for field in s.split(|c: char| !c.is_alphanumeric()).filter(|f| !f.is_empty()) {
        set.insert(options.case.apply(field));
    }

    if !options.specials {
        return;
    }

    let specials = s
        .split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '{' | '}'))
        .map(|f| f.trim_end_matches(|c: char| !c.is_alphanumeric()))
        .filter(|f| !f.is_empty());
    for field in specials {
        set.insert(options.case.apply(field));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tokens(v: &Value, opts: serde_json::Value) -> Vec<String> {
        v.tokens(&TokenOptions::from_value(&Value::from(opts)))
            .into_iter()
            .collect()
    }

    #[test]
    fn test_default_split() {
        let v = Value::from("Hello, World! hello");
        assert_eq!(tokens(&v, json!({})), vec!["Hello", "World", "hello"]);
    }

    #[test]
    fn test_case_folding() {
        let v = Value::from("Hello, World! hello");
        assert_eq!(tokens(&v, json!({"case": "lower"})), vec!["hello", "world"]);
        assert_eq!(tokens(&v, json!({"case": "UPPER"})), vec!["HELLO", "WORLD"]);
    }

    #[test]
    fn test_no_split_and_trim() {
        let v = Value::from("  two words ");
        assert_eq!(tokens(&v, json!({"split": false})), vec!["two words"]);
        assert_eq!(
            tokens(&v, json!({"split": false, "trim": false})),
            vec!["  two words "]
        );
    }

    #[test]
    fn test_specials_keep_emails() {
        let v = Value::from("mail (bob@example.com), call 555-1234.");
        let toks = tokens(&v, json!({"specials": true}));
        assert!(toks.contains(&"bob@example.com".to_string()));
        assert!(toks.contains(&"555-1234".to_string()));
        assert!(toks.contains(&"example".to_string()));
    }

    #[test]
    fn test_containers_and_determinism() {
        let v = Value::from(json!({"title": "Red fox", "tags": ["quick", "brown"], "n": 2}));
        let opts = json!({"case": "lower"});
        let first = tokens(&v, opts.clone());
        assert_eq!(first, tokens(&v, opts));
        for t in ["title", "red", "fox", "quick", "brown", "n", "2"] {
            assert!(first.contains(&t.to_string()), "missing token {}", t);
        }
    }

    #[test]
    fn test_contains_token() {
        let v = Value::from("The Quick fox");
        let opts = TokenOptions {
            case: CaseFold::Lower,
            ..TokenOptions::default()
        };
        assert!(v.contains_token(&Value::from("quick"), &opts));
        assert!(v.contains_token(&Value::from("Quick"), &opts));
        assert!(!v.contains_token(&Value::from("slow"), &opts));
        assert!(!v.contains_token(&Value::from(1), &opts));

        let exact = TokenOptions::default();
        assert!(v.contains_token(&Value::from("Quick"), &exact));
        assert!(!v.contains_token(&Value::from("quick"), &exact));
    }
}
