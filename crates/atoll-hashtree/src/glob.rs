//! Minimal glob matching over canonical paths.
//!
//! Supported syntax, per path component: `*` (any run of characters
//! within a component), `?` (exactly one character), and a bare `**`
//! component matching any number of components (including none).

use crate::TreeError;

/// Match a canonical path against a glob pattern.
///
/// Both sides are compared component-wise; the empty path (the root)
/// matches only the empty pattern.
pub fn glob_match(pattern: &str, path: &str) -> Result<bool, TreeError> {
    let pat: Vec<&str> = pattern.split('/').filter(|c| !c.is_empty()).collect();
    let parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    for component in &pat {
        if component.contains("**") && *component != "**" {
            return Err(TreeError::MalformedGlob(pattern.to_string()));
        }
    }
    Ok(match_components(&pat, &parts))
}

fn match_components(pat: &[&str], parts: &[&str]) -> bool {
    match pat.first() {
        None => parts.is_empty(),
        Some(&"**") => {
            // `**` absorbs zero or more components.
            (0..=parts.len()).any(|skip| match_components(&pat[1..], &parts[skip..]))
        }
        Some(component) => match parts.first() {
            Some(part) => {
                match_component(component.as_bytes(), part.as_bytes())
                    && match_components(&pat[1..], &parts[1..])
            }
            None => false,
        },
    }
}

fn match_component(pat: &[u8], part: &[u8]) -> bool {
    match (pat.first(), part.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            match_component(&pat[1..], part)
                || (!part.is_empty() && match_component(pat, &part[1..]))
        }
        (Some(b'?'), Some(_)) => match_component(&pat[1..], &part[1..]),
        (Some(p), Some(c)) if p == c => match_component(&pat[1..], &part[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(glob_match("/a/b", "/a/b").unwrap());
        assert!(!glob_match("/a/b", "/a/c").unwrap());
        assert!(!glob_match("/a", "/a/b").unwrap());
    }

    #[test]
    fn test_star_within_component() {
        assert!(glob_match("/a/*", "/a/b").unwrap());
        assert!(glob_match("/*.txt", "/notes.txt").unwrap());
        assert!(!glob_match("/a/*", "/a/b/c").unwrap());
        assert!(glob_match("/a*c", "/abc").unwrap());
        assert!(glob_match("/a*c", "/ac").unwrap());
    }

    #[test]
    fn test_question_mark() {
        assert!(glob_match("/fil?", "/file").unwrap());
        assert!(!glob_match("/fil?", "/files").unwrap());
    }

    #[test]
    fn test_double_star_spans_components() {
        assert!(glob_match("/**", "/a/b/c").unwrap());
        assert!(glob_match("/a/**/d", "/a/b/c/d").unwrap());
        assert!(glob_match("/a/**/d", "/a/d").unwrap());
        assert!(!glob_match("/a/**/d", "/a/b/c").unwrap());
    }

    #[test]
    fn test_malformed_pattern() {
        assert!(matches!(
            glob_match("/a**b", "/anything"),
            Err(TreeError::MalformedGlob(_))
        ));
    }
}
