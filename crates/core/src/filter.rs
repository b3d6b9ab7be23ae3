//! Ordered include/exclude path filters for the one-shot synchronizer.
//!
//! Rules are evaluated in definition order and the first match decides.
//! When nothing matches, the path is kept only if the rule list contains no
//! include rules: an include list is a whitelist, an exclude-only list a
//! blacklist.

use std::path::Path;

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Action taken when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Include,
    Exclude,
}

/// One user-supplied rule: an action plus a glob pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub action: RuleAction,
    pub pattern: String,
}

impl FilterRule {
    #[must_use]
    pub fn include(pattern: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Include,
            pattern: pattern.into(),
        }
    }

    #[must_use]
    pub fn exclude(pattern: impl Into<String>) -> Self {
        Self {
            action: RuleAction::Exclude,
            pattern: pattern.into(),
        }
    }
}

struct CompiledRule {
    action: RuleAction,
    matcher: GlobMatcher,
}

/// Compiled, ordered rule list
pub struct PathFilter {
    rules: Vec<CompiledRule>,
    has_includes: bool,
}

impl PathFilter {
    /// Compile a rule list. Patterns without a leading `/` match at any
    /// depth; a leading `/` anchors to the transfer root.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a malformed glob
    pub fn new(rules: impl IntoIterator<Item = FilterRule>) -> Result<Self> {
        let mut compiled = Vec::new();
        let mut has_includes = false;
        for rule in rules {
            has_includes |= rule.action == RuleAction::Include;
            let pattern = match rule.pattern.strip_prefix('/') {
                Some(anchored) => anchored.to_string(),
                None => format!("**/{}", rule.pattern),
            };
            let glob = Glob::new(&pattern).map_err(|e| {
                Error::invalid_argument(format!("bad filter pattern {:?}", rule.pattern))
                    .with_source(e)
            })?;
            compiled.push(CompiledRule {
                action: rule.action,
                matcher: glob.compile_matcher(),
            });
        }
        Ok(Self {
            rules: compiled,
            has_includes,
        })
    }

    /// Filter that keeps everything
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            rules: Vec::new(),
            has_includes: false,
        }
    }

    /// Whether a relative path survives the rule list
    #[must_use]
    pub fn allows(&self, path: &Path) -> bool {
        for rule in &self.rules {
            if rule.matcher.is_match(path) {
                return rule.action == RuleAction::Include;
            }
        }
        !self.has_includes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_wins_with_default_exclude() {
        // [+*.txt, -*.dat, +*.exe]: a.txt and c.exe kept, b.dat excluded,
        // d.md excluded because an include list is a whitelist.
        let filter = PathFilter::new([
            FilterRule::include("*.txt"),
            FilterRule::exclude("*.dat"),
            FilterRule::include("*.exe"),
        ])
        .unwrap();

        assert!(filter.allows(Path::new("a.txt")));
        assert!(!filter.allows(Path::new("b.dat")));
        assert!(filter.allows(Path::new("c.exe")));
        assert!(!filter.allows(Path::new("d.md")));
    }

    #[test]
    fn test_exclude_only_list_keeps_unmatched() {
        let filter = PathFilter::new([FilterRule::exclude("*.log")]).unwrap();
        assert!(!filter.allows(Path::new("debug.log")));
        assert!(filter.allows(Path::new("notes.txt")));
    }

    #[test]
    fn test_order_matters() {
        let include_first = PathFilter::new([
            FilterRule::include("keep.dat"),
            FilterRule::exclude("*.dat"),
        ])
        .unwrap();
        assert!(include_first.allows(Path::new("keep.dat")));
        assert!(!include_first.allows(Path::new("other.dat")));

        let exclude_first = PathFilter::new([
            FilterRule::exclude("*.dat"),
            FilterRule::include("keep.dat"),
        ])
        .unwrap();
        assert!(!exclude_first.allows(Path::new("keep.dat")));
    }

    #[test]
    fn test_unanchored_matches_any_depth() {
        let filter = PathFilter::new([FilterRule::exclude("*.o")]).unwrap();
        assert!(!filter.allows(Path::new("build/deep/nested/main.o")));
        assert!(filter.allows(Path::new("build/deep/nested/main.c")));
    }

    #[test]
    fn test_anchored_pattern() {
        let filter = PathFilter::new([FilterRule::exclude("/target/**")]).unwrap();
        assert!(!filter.allows(Path::new("target/debug/bin")));
        assert!(filter.allows(Path::new("src/target/file")));
    }

    #[test]
    fn test_allow_all() {
        let filter = PathFilter::allow_all();
        assert!(filter.allows(Path::new("anything/at/all")));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        assert!(PathFilter::new([FilterRule::include("a[")]).is_err());
    }
}
