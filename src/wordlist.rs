//! Word-list documents driving content filtering.
//!
//! Two lists are loaded from YAML files: a lexicon (deny-list) of flagged
//! terms and an allow-list of terms that justify dropping a row when no
//! lexicon term is present. Both are optional; a missing or unparsable file
//! yields an empty list, which downstream code treats as "filter unavailable"
//! (and the fallback ingestion path fails closed on).

use std::collections::BTreeSet;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde_yaml::Value;
use tracing::warn;

use crate::util::env::{env_flag, env_opt};

pub const LEXICON_KEYS: &[&str] = &["words", "terms", "slurs", "deny", "denylist"];
pub const ALLOWLIST_KEYS: &[&str] = &["words", "allow", "allowlist"];

/// A loaded, lowercased, deduplicated word list.
#[derive(Debug, Clone, Default)]
pub struct WordList {
    words: Vec<String>,
}

impl WordList {
    pub fn new(words: Vec<String>) -> Self {
        let words: BTreeSet<String> = words
            .into_iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        Self {
            words: words.into_iter().collect(),
        }
    }

    /// Load from a YAML document. Accepted shapes: a bare list, or a map with
    /// one of `keys` holding a list (any other list-valued keys are flattened
    /// as a last resort). Missing/unreadable/unparsable files load empty.
    pub fn load(path: &Path, keys: &[&str]) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                warn!(path = %path.display(), "word list file not found");
                return Self::default();
            }
        };
        let doc: Value = match serde_yaml::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed parsing word list");
                return Self::default();
            }
        };
        let mut words: Vec<String> = Vec::new();
        match doc {
            Value::Sequence(items) => collect_strings(&items, &mut words),
            Value::Mapping(map) => {
                for key in keys {
                    if let Some(Value::Sequence(items)) = map.get(*key) {
                        collect_strings(items, &mut words);
                    }
                }
                if words.is_empty() {
                    for (_, v) in &map {
                        if let Value::Sequence(items) = v {
                            collect_strings(items, &mut words);
                        }
                    }
                }
            }
            _ => {}
        }
        Self::new(words)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Case-insensitive substring match against any word. This is the coarse
    /// matcher used by the degraded-mode fallback filter.
    pub fn contains_any(&self, text: &str) -> bool {
        if text.is_empty() || self.words.is_empty() {
            return false;
        }
        let t = text.to_lowercase();
        self.words.iter().any(|w| t.contains(w.as_str()))
    }

    /// Compile a whole-word matcher (`\b(?:w1|w2|...)\b`, case-insensitive).
    /// Returns `None` for an empty list or an uncompilable pattern.
    pub fn boundary_matcher(&self) -> Option<Regex> {
        if self.words.is_empty() {
            return None;
        }
        let alternatives: Vec<String> = self.words.iter().map(|w| regex::escape(w)).collect();
        let pattern = format!(r"\b(?:{})\b", alternatives.join("|"));
        match RegexBuilder::new(&pattern).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(error = %e, "word list regex compile failed");
                None
            }
        }
    }
}

fn collect_strings(items: &[Value], out: &mut Vec<String>) {
    for item in items {
        match item {
            Value::String(s) => out.push(s.clone()),
            Value::Number(n) => out.push(n.to_string()),
            _ => {}
        }
    }
}

/// Post-fetch, pre-write row filter: rows containing any lexicon term are
/// always kept; otherwise an allow-list hit drops the row. Disabled unless
/// `ALLOWLIST_DROP` is set and the allow-list compiled.
pub struct DropFilter {
    allow: Option<Regex>,
    deny: Option<Regex>,
    pub allow_terms: usize,
    pub deny_terms: usize,
    pub enabled: bool,
}

impl DropFilter {
    pub fn from_env() -> Self {
        let allow_path = env_opt("ALLOWLIST_PATH").unwrap_or_else(|| "allowlist.yaml".into());
        let lex_path = env_opt("LEXICON_PATH").unwrap_or_else(|| "lexicon.yaml".into());
        let allow_list = WordList::load(Path::new(&allow_path), ALLOWLIST_KEYS);
        let deny_list = WordList::load(Path::new(&lex_path), LEXICON_KEYS);
        Self::new(allow_list, deny_list, env_flag("ALLOWLIST_DROP", false))
    }

    pub fn new(allow_list: WordList, deny_list: WordList, drop_enabled: bool) -> Self {
        let allow = allow_list.boundary_matcher();
        let enabled = drop_enabled && allow.is_some();
        Self {
            allow,
            deny: deny_list.boundary_matcher(),
            allow_terms: allow_list.len(),
            deny_terms: deny_list.len(),
            enabled,
        }
    }

    /// Whether a message body survives the filter.
    pub fn keeps(&self, text: &str) -> bool {
        if !self.enabled {
            return true;
        }
        if let Some(deny) = &self.deny {
            if deny.is_match(text) {
                return true;
            }
        }
        match &self.allow {
            Some(allow) => !allow.is_match(text),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(words: &[&str]) -> WordList {
        WordList::new(words.iter().map(|w| w.to_string()).collect())
    }

    #[test]
    fn load_accepts_bare_list_and_keyed_map() {
        let dir = std::env::temp_dir();
        let bare = dir.join("slursbot_test_bare.yaml");
        std::fs::write(&bare, "- Alpha\n- beta\n- alpha\n").unwrap();
        let wl = WordList::load(&bare, LEXICON_KEYS);
        assert_eq!(wl.len(), 2);
        assert!(wl.contains_any("big ALPHA energy"));

        let keyed = dir.join("slursbot_test_keyed.yaml");
        std::fs::write(&keyed, "terms:\n  - gamma\nother: 1\n").unwrap();
        let wl = WordList::load(&keyed, LEXICON_KEYS);
        assert!(wl.contains_any("gamma ray"));

        let _ = std::fs::remove_file(bare);
        let _ = std::fs::remove_file(keyed);
    }

    #[test]
    fn missing_file_loads_empty() {
        let wl = WordList::load(Path::new("/definitely/not/here.yaml"), LEXICON_KEYS);
        assert!(wl.is_empty());
        assert!(!wl.contains_any("anything"));
    }

    #[test]
    fn contains_any_is_substring_and_case_insensitive() {
        let wl = list(&["slur"]);
        assert!(wl.contains_any("xxSLURxx"));
        assert!(!wl.contains_any("clean text"));
    }

    #[test]
    fn boundary_matcher_respects_word_edges() {
        let re = list(&["gg"]).boundary_matcher().unwrap();
        assert!(re.is_match("gg wp"));
        assert!(!re.is_match("struggle"));
    }

    #[test]
    fn drop_filter_keeps_deny_hits_even_with_allow_hit() {
        let f = DropFilter::new(list(&["nice"]), list(&["slur"]), true);
        assert!(f.enabled);
        // deny term present: keep regardless of allow hit
        assert!(f.keeps("nice but has slur inside"));
        // allow term only: drop
        assert!(!f.keeps("what a nice play"));
        // neither: keep
        assert!(f.keeps("ordinary message"));
    }

    #[test]
    fn drop_filter_disabled_without_allow_list() {
        let f = DropFilter::new(WordList::default(), list(&["slur"]), true);
        assert!(!f.enabled);
        assert!(f.keeps("what a nice play"));
    }
}
