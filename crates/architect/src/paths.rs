//! Path classification used by guardrails and review gates.

use glob::Pattern;

/// Normalize to forward slashes so glob patterns behave the same on every
/// platform.
pub fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// First pattern in `patterns` that matches `path`, if any.
pub fn match_any<'a>(path: &str, patterns: &'a [String]) -> Option<&'a str> {
    let normalized = normalize(path);
    patterns.iter().find_map(|pattern| {
        Pattern::new(pattern)
            .ok()
            .filter(|p| p.matches(&normalized))
            .map(|_| pattern.as_str())
    })
}

/// Whether `path` looks like a test file.
///
/// Recognizes directory conventions (`tests/`, `test/`, `__tests__/`,
/// `spec/`, `specs/`), `test_` filename prefixes, and the common suffix
/// conventions across ecosystems.
pub fn is_test_path(path: &str) -> bool {
    let normalized = normalize(path);
    let lower = normalized.to_lowercase();

    const TEST_DIRS: &[&str] = &["tests", "test", "__tests__", "spec", "specs"];
    for segment in lower.split('/') {
        if TEST_DIRS.contains(&segment) {
            return true;
        }
    }

    let file_name = lower.rsplit('/').next().unwrap_or(&lower);
    if file_name.starts_with("test_") {
        return true;
    }

    const TEST_SUFFIXES: &[&str] = &[
        "_test.py",
        ".test.js",
        ".test.jsx",
        ".test.ts",
        ".test.tsx",
        ".spec.js",
        ".spec.jsx",
        ".spec.ts",
        ".spec.tsx",
    ];
    TEST_SUFFIXES.iter().any(|suffix| file_name.ends_with(suffix))
}

/// Whether `path` looks like documentation.
pub fn is_docs_path(path: &str) -> bool {
    let normalized = normalize(path);
    let lower = normalized.to_lowercase();

    let file_name = lower.rsplit('/').next().unwrap_or(&lower);
    if file_name.starts_with("readme") || file_name.starts_with("changelog") {
        return true;
    }

    const DOC_DIRS: &[&str] = &["docs", "doc", "documentation"];
    for segment in lower.split('/') {
        if DOC_DIRS.contains(&segment) {
            return true;
        }
    }

    const DOC_EXTENSIONS: &[&str] = &[".md", ".rst", ".adoc"];
    DOC_EXTENSIONS.iter().any(|ext| file_name.ends_with(ext))
}

/// Paths owned by the tool itself, excluded from guardrails and the
/// dirty-worktree check.
pub fn is_internal_path(path: &str) -> bool {
    let normalized = normalize(path);
    normalized.starts_with(".architect/")
        || normalized == ".architect"
        || normalized == "architect.toml"
}

/// A source file for review-gate purposes: not a test, not documentation, and
/// not tool-internal.
pub fn is_source_path(path: &str) -> bool {
    !is_test_path(path) && !is_docs_path(path) && !is_internal_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_test_layouts() {
        assert!(is_test_path("tests/test_supervisor.py"));
        assert!(is_test_path("crates/core/tests/integration.rs"));
        assert!(is_test_path("src/__tests__/app.js"));
        assert!(is_test_path("spec/models/user_spec.rb"));
        assert!(is_test_path("src/test_helpers.py"));
        assert!(is_test_path("web/app.test.tsx"));
        assert!(is_test_path("web/app.spec.ts"));
        assert!(!is_test_path("src/main.rs"));
        assert!(!is_test_path("src/contest.rs"));
    }

    #[test]
    fn underscore_test_suffix_is_recognized() {
        assert!(is_test_path("pkg/handlers_test.py"));
    }

    #[test]
    fn recognizes_docs() {
        assert!(is_docs_path("README.md"));
        assert!(is_docs_path("README"));
        assert!(is_docs_path("CHANGELOG.rst"));
        assert!(is_docs_path("docs/guide/index.html"));
        assert!(is_docs_path("notes.adoc"));
        assert!(!is_docs_path("src/lib.rs"));
    }

    #[test]
    fn internal_paths_are_excluded() {
        assert!(is_internal_path(".architect/state/tasks.json"));
        assert!(is_internal_path("architect.toml"));
        assert!(!is_internal_path("src/architect.rs"));
    }

    #[test]
    fn glob_matching_reports_the_pattern() {
        let patterns = vec!["secrets/*".to_string(), ".env".to_string()];
        assert_eq!(match_any(".env", &patterns), Some(".env"));
        assert_eq!(match_any("secrets/api.key", &patterns), Some("secrets/*"));
        assert_eq!(match_any("src/main.rs", &patterns), None);
    }

    #[test]
    fn double_star_patterns_cross_directories() {
        let patterns = vec!["src/**/*.rs".to_string()];
        assert!(match_any("src/deep/nested/module.rs", &patterns).is_some());
        assert!(match_any("lib/module.rs", &patterns).is_none());
    }
}
