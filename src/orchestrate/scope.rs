// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scope hint checking.
//!
//! A scope is a list of paths or glob patterns a request is expected to touch:
//!
//! - An empty scope allows everything.
//! - A pattern with glob metacharacters is matched with `globset`; a pattern
//!   without `/` also matches at any depth (`*.md` allows `docs/a.md`).
//! - Any other pattern is an exact path or a directory prefix (`src/` and
//!   `src` both allow `src/lib.rs`).

use std::collections::HashSet;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

/// Compiled scope hints for one request.
#[derive(Debug, Clone)]
pub struct ScopeChecker {
    patterns: Vec<String>,
    globs: GlobSet,
    paths: HashSet<String>,
}

impl ScopeChecker {
    pub fn new(patterns: &[String]) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut paths = HashSet::new();
        let mut normalized_patterns = Vec::new();

        for pattern in patterns {
            let normalized = normalize_path(pattern);
            if normalized.is_empty() {
                continue;
            }
            normalized_patterns.push(normalized.clone());

            if !has_glob_chars(&normalized) {
                paths.insert(normalized.trim_end_matches('/').to_string());
                continue;
            }

            let mut candidates = vec![normalized.clone()];
            if !normalized.contains('/') {
                candidates.push(format!("**/{}", normalized));
            }
            for candidate in candidates {
                match Glob::new(&candidate) {
                    Ok(glob) => {
                        builder.add(glob);
                    }
                    Err(e) => {
                        warn!("invalid scope pattern '{}', matching literally: {}", pattern, e);
                        paths.insert(normalized.trim_end_matches('/').to_string());
                    }
                }
            }
        }

        let globs = builder.build().unwrap_or_else(|e| {
            warn!("failed to compile scope globs: {}", e);
            GlobSet::empty()
        });

        Self {
            patterns: normalized_patterns,
            globs,
            paths,
        }
    }

    /// Whether any path is allowed.
    pub fn is_unrestricted(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether a repo-relative path is inside the scope.
    pub fn allows(&self, file: &str) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        let file = normalize_path(file);
        if self.paths.contains(&file) || self.globs.is_match(&file) {
            return true;
        }
        self.paths
            .iter()
            .any(|dir| file.starts_with(&format!("{}/", dir)))
    }

    /// Changed paths outside the scope, in input order.
    pub fn out_of_scope(&self, files: &[String]) -> Vec<String> {
        files
            .iter()
            .filter(|f| !self.allows(f))
            .map(|f| normalize_path(f))
            .collect()
    }
}

/// Combined scope of several requests; unrestricted if any of them is.
pub fn union_scopes<'a, I>(scopes: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut seen = HashSet::new();
    let mut union = Vec::new();
    for scope in scopes {
        if scope.is_empty() {
            return Vec::new();
        }
        for pattern in scope {
            if seen.insert(pattern.clone()) {
                union.push(pattern.clone());
            }
        }
    }
    union
}

/// Patterns shown to a worker; `**/*` when unrestricted.
pub fn describe_scope(scope: &[String]) -> String {
    if scope.is_empty() {
        "**/*".to_string()
    } else {
        scope.join(", ")
    }
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Forward slashes, no leading `./`.
fn normalize_path(path: &str) -> String {
    let normalized = path.trim().replace('\\', "/");
    normalized
        .strip_prefix("./")
        .unwrap_or(&normalized)
        .to_string()
}
