//! Ignore and protect rule evaluation.
//!
//! A small gitignore-like grammar shared by the walker (ignore list) and
//! the server's deletion guard (protect list):
//!
//! - blank lines and `#` comments are skipped
//! - a trailing `/` restricts the rule to directories
//! - a leading `/` anchors the pattern at the workspace root
//! - a leading `!` negates an earlier match; later rules win
//! - anything else matches at any depth via the compound `{pat, **/pat}`
//!
//! Rules are evaluated in order and the last matching rule decides.

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;

#[derive(Debug)]
struct CompiledRule {
    negated: bool,
    dir_only: bool,
    /// Matches the path itself.
    matcher: GlobMatcher,
    /// For directory rules: also matches everything below the directory.
    descendants: Option<GlobMatcher>,
}

/// An ordered set of compiled rules. Matching a [`RuleSet`] means the path
/// is selected by it - ignored by the walker, or protected from deletion.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile a list of pattern lines.
    pub fn parse<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for line in lines {
            let mut pat = line.as_ref().trim();
            if pat.is_empty() || pat.starts_with('#') {
                continue;
            }
            let negated = if let Some(rest) = pat.strip_prefix('!') {
                pat = rest;
                true
            } else {
                false
            };
            let dir_only = if let Some(rest) = pat.strip_suffix('/') {
                pat = rest;
                true
            } else {
                false
            };
            let anchored = if let Some(rest) = pat.strip_prefix('/') {
                pat = rest;
                true
            } else {
                false
            };
            if pat.is_empty() {
                continue;
            }
            let self_pat = if anchored {
                pat.to_string()
            } else {
                format!("{{{pat},**/{pat}}}")
            };
            let desc_pat = if anchored {
                format!("{pat}/**")
            } else {
                format!("{{{pat}/**,**/{pat}/**}}")
            };
            let matcher = compile(&self_pat)?;
            let descendants = if dir_only {
                Some(compile(&desc_pat)?)
            } else {
                None
            };
            rules.push(CompiledRule {
                negated,
                dir_only,
                matcher,
                descendants,
            });
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate a workspace-relative path. `is_dir` gates directory-only
    /// rules. The last matching rule wins; no match means not selected.
    pub fn matches(&self, path: &Path, is_dir: bool) -> bool {
        let mut selected = false;
        for rule in &self.rules {
            let hit = if rule.dir_only {
                (is_dir && rule.matcher.is_match(path))
                    || rule
                        .descendants
                        .as_ref()
                        .is_some_and(|d| d.is_match(path))
            } else {
                rule.matcher.is_match(path)
            };
            if hit {
                selected = !rule.negated;
            }
        }
        selected
    }
}

fn compile(pattern: &str) -> Result<GlobMatcher> {
    Ok(GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("bad filter pattern '{pattern}'"))?
        .compile_matcher())
}
