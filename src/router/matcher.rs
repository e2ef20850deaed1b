//! Pattern rule matching for remote identities

use glob::{MatchOptions, Pattern, PatternError};

const GLOB_META: [char; 3] = ['*', '?', '['];

/// A compiled pattern rule
///
/// Text containing glob metacharacters is matched as a glob where `*` also
/// crosses `/`. Plain text is a path-segment prefix: `github.com/org`
/// matches `github.com/org` and `github.com/org/repo` but not
/// `github.com/organization`.
#[derive(Debug, Clone)]
pub struct PatternRule {
    kind: PatternKind,
    specificity: usize,
}

#[derive(Debug, Clone)]
enum PatternKind {
    Glob(Pattern),
    Prefix(String),
}

impl PatternRule {
    /// Compile a pattern rule
    pub fn new(text: &str) -> Result<Self, PatternError> {
        let text = text.trim().trim_end_matches('/');
        let specificity = literal_prefix_len(text);

        let kind = if specificity < text.len() {
            PatternKind::Glob(Pattern::new(text)?)
        } else {
            PatternKind::Prefix(text.to_string())
        };

        Ok(Self { kind, specificity })
    }

    /// Whether the rule applies to a normalized remote identity
    pub fn matches(&self, remote: &str) -> bool {
        match &self.kind {
            PatternKind::Glob(pattern) => pattern.matches_with(remote, MATCH_OPTIONS),
            PatternKind::Prefix(prefix) => match remote.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }

    /// Length of the literal text before the first wildcard
    pub fn specificity(&self) -> usize {
        self.specificity
    }
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Number of bytes before the first glob metacharacter
pub fn literal_prefix_len(text: &str) -> usize {
    text.find(GLOB_META).unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matching() {
        let rule = PatternRule::new("github.com/org/*").unwrap();

        assert!(rule.matches("github.com/org/repo"));
        assert!(rule.matches("github.com/org/team/repo"));
        assert!(!rule.matches("github.com/other/repo"));
        assert!(!rule.matches("gitlab.com/org/repo"));
        assert_eq!(rule.specificity(), "github.com/org/".len());
    }

    #[test]
    fn test_prefix_matching() {
        let rule = PatternRule::new("github.com/org").unwrap();

        assert!(rule.matches("github.com/org"));
        assert!(rule.matches("github.com/org/repo"));
        assert!(!rule.matches("github.com/organization/repo"));
        assert_eq!(rule.specificity(), "github.com/org".len());
    }

    #[test]
    fn test_specificity_ordering() {
        let broad = PatternRule::new("github.com/org/*").unwrap();
        let narrow = PatternRule::new("github.com/org/secret-*").unwrap();

        assert!(broad.matches("github.com/org/secret-repo"));
        assert!(narrow.matches("github.com/org/secret-repo"));
        assert!(narrow.specificity() > broad.specificity());
    }

    #[test]
    fn test_invalid_glob() {
        assert!(PatternRule::new("github.com/[org").is_err());
    }
}
