//! String matching used by query predicates.
//!
//! Provides a single implementation of the string predicates (`contains`,
//! `begins_with`, `ends_with`, `like` and equality) so every evaluation path
//! shares the same semantics.
//!
//! # Wildcards
//!
//! `like` patterns use two wildcards:
//! - `*` matches zero or more characters
//! - `?` matches exactly one character
//!
//! # Case folding
//!
//! Case-insensitive matching folds characters in U+0000..=U+024F (Basic Latin
//! through Latin Extended-B). A pattern containing a cased character outside
//! that range cannot be folded, and the predicate matches nothing.

/// Case handling for string predicates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Case {
    #[default]
    Sensitive,
    Insensitive,
}

const FOLD_LIMIT: u32 = 0x024F;

/// Folds one character, or returns `None` if it is cased and outside the
/// supported range.
pub fn fold_char(c: char) -> Option<char> {
    if (c as u32) <= FOLD_LIMIT {
        let mut lower = c.to_lowercase();
        return match (lower.next(), lower.next()) {
            (Some(l), None) => Some(l),
            // Multi-char lowercase (e.g. U+0130) stays as-is.
            _ => Some(c),
        };
    }
    let cased = c.is_lowercase() || c.is_uppercase();
    if cased {
        None
    } else {
        Some(c)
    }
}

/// Prepares a pattern; `None` means the pattern cannot match anything.
fn prepare_pattern(pattern: &str, case: Case) -> Option<Vec<char>> {
    match case {
        Case::Sensitive => Some(pattern.chars().collect()),
        Case::Insensitive => pattern.chars().map(fold_char).collect(),
    }
}

/// Prepares a value. Value characters outside the folding range are kept
/// verbatim, so they only match themselves.
fn prepare_value(value: &str, case: Case) -> Vec<char> {
    match case {
        Case::Sensitive => value.chars().collect(),
        Case::Insensitive => value.chars().map(|c| fold_char(c).unwrap_or(c)).collect(),
    }
}

/// Returns true if `value` equals `pattern` under the case mode.
pub fn equals(value: &str, pattern: &str, case: Case) -> bool {
    if case == Case::Sensitive {
        return value == pattern;
    }
    match prepare_pattern(pattern, case) {
        Some(p) => prepare_value(value, case) == p,
        None => false,
    }
}

/// Returns true if `value` contains `pattern`.
pub fn contains(value: &str, pattern: &str, case: Case) -> bool {
    if case == Case::Sensitive {
        return value.contains(pattern);
    }
    let Some(p) = prepare_pattern(pattern, case) else {
        return false;
    };
    let v = prepare_value(value, case);
    p.is_empty() || v.windows(p.len()).any(|w| w == p.as_slice())
}

/// Returns true if `value` starts with `pattern`.
pub fn begins_with(value: &str, pattern: &str, case: Case) -> bool {
    if case == Case::Sensitive {
        return value.starts_with(pattern);
    }
    match prepare_pattern(pattern, case) {
        Some(p) => prepare_value(value, case).starts_with(&p),
        None => false,
    }
}

/// Returns true if `value` ends with `pattern`.
pub fn ends_with(value: &str, pattern: &str, case: Case) -> bool {
    if case == Case::Sensitive {
        return value.ends_with(pattern);
    }
    match prepare_pattern(pattern, case) {
        Some(p) => prepare_value(value, case).ends_with(&p),
        None => false,
    }
}

/// Wildcard pattern matching.
///
/// ```
/// use tessel_core::pattern_match::{like, Case};
/// assert!(like("hello", "h*o", Case::Sensitive));
/// assert!(like("hello", "?ello", Case::Sensitive));
/// assert!(like("HELLO", "h*", Case::Insensitive));
/// assert!(!like("hello", "world", Case::Sensitive));
/// ```
pub fn like(value: &str, pattern: &str, case: Case) -> bool {
    let Some(p) = prepare_pattern(pattern, case) else {
        return false;
    };
    let v = prepare_value(value, case);
    wildcard(&v, &p)
}

/// Greedy matcher with single-star backtracking; linear in practice.
fn wildcard(v: &[char], p: &[char]) -> bool {
    let (mut vi, mut pi) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while vi < v.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, vi));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            vi += 1;
            pi += 1;
        } else if let Some((star_pi, star_vi)) = star {
            pi = star_pi + 1;
            vi = star_vi + 1;
            star = Some((star_pi, star_vi + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_like_wildcards() {
        assert!(like("hello", "*", Case::Sensitive));
        assert!(like("", "*", Case::Sensitive));
        assert!(like("hello", "h?llo", Case::Sensitive));
        assert!(like("hello", "*llo", Case::Sensitive));
        assert!(like("hello", "h*l*o", Case::Sensitive));
        assert!(!like("hello", "h?lo", Case::Sensitive));
        assert!(!like("hello", "Hello", Case::Sensitive));
        assert!(like("abcabd", "*abd", Case::Sensitive));
    }

    #[test]
    fn test_like_star_in_value() {
        assert!(like("*a", "*", Case::Sensitive));
        assert!(like("*", "*", Case::Sensitive));
        assert!(like("a*b", "a*", Case::Sensitive));
        assert!(like("?*?", "?*", Case::Insensitive));
        assert!(!like("*a", "*b", Case::Sensitive));
    }

    #[test]
    fn test_case_insensitive_latin() {
        assert!(equals("Jane", "jANE", Case::Insensitive));
        assert!(contains("Crème Brûlée", "BRÛL", Case::Insensitive));
        assert!(begins_with("Ærøskøbing", "ærø", Case::Insensitive));
        assert!(ends_with("ŁÓDŹ", "ódź", Case::Insensitive));
    }

    #[test]
    fn test_case_insensitive_outside_range_never_matches() {
        // Greek is cased and outside the folding range.
        assert!(!equals("Σ", "σ", Case::Insensitive));
        assert!(!contains("ΑΒΓ", "β", Case::Insensitive));
        assert!(!like("σ", "σ", Case::Insensitive));
        // Uncased characters outside the range still match themselves.
        assert!(contains("日本語テキスト", "本語", Case::Insensitive));
        assert!(equals("Σ", "Σ", Case::Sensitive));
    }

    #[test]
    fn test_empty_pattern() {
        assert!(contains("abc", "", Case::Insensitive));
        assert!(begins_with("abc", "", Case::Sensitive));
        assert!(!like("abc", "", Case::Sensitive));
    }

    proptest! {
        #[test]
        fn prop_star_matches_everything(s in ".*") {
            prop_assert!(like(&s, "*", Case::Sensitive));
        }

        #[test]
        fn prop_literal_like_is_equality(s in "[a-zA-Z0-9 ]{0,16}", t in "[a-zA-Z0-9 ]{0,16}") {
            prop_assert_eq!(like(&s, &t, Case::Sensitive), s == t);
        }

        #[test]
        fn prop_insensitive_ascii_matches_std(s in "[a-zA-Z]{0,12}", t in "[a-zA-Z]{0,4}") {
            let expected = s.to_ascii_lowercase().contains(&t.to_ascii_lowercase());
            prop_assert_eq!(contains(&s, &t, Case::Insensitive), expected);
        }
    }
}
