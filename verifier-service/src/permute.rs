//! Candidate address generation from detected per-domain naming patterns.

/// Recognized local-part patterns, in prior rank order (most common first
/// across corporate domains).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    FirstDotLast,
    FLast,
    First,
    FirstL,
    Last,
    FirstUnderLast,
    FirstDashLast,
}

pub const PRIOR_RANKING: &[Pattern] = &[
    Pattern::FirstDotLast,
    Pattern::FLast,
    Pattern::First,
    Pattern::FirstL,
    Pattern::Last,
    Pattern::FirstUnderLast,
    Pattern::FirstDashLast,
];

impl Pattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::FirstDotLast => "first.last",
            Pattern::FLast => "flast",
            Pattern::First => "first",
            Pattern::FirstL => "firstl",
            Pattern::Last => "last",
            Pattern::FirstUnderLast => "first_last",
            Pattern::FirstDashLast => "first-last",
        }
    }

    pub fn apply(&self, first: &str, last: &str) -> Option<String> {
        let f = sanitize(first);
        let l = sanitize(last);
        let fi = f.chars().next()?;
        let li = l.chars().next()?;
        Some(match self {
            Pattern::FirstDotLast => format!("{f}.{l}"),
            Pattern::FLast => format!("{fi}{l}"),
            Pattern::First => f,
            Pattern::FirstL => format!("{f}{li}"),
            Pattern::Last => l,
            Pattern::FirstUnderLast => format!("{f}_{l}"),
            Pattern::FirstDashLast => format!("{f}-{l}"),
        })
    }
}

/// Lowercased ASCII letters and digits only; diacritics and punctuation in
/// names never survive into local parts.
fn sanitize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Infer the domain's pattern from published `(first, last, email)` rows.
/// The modal pattern wins when at least two samples agree; otherwise None
/// and callers fall back to the prior ranking.
pub fn detect_pattern(samples: &[(Option<String>, Option<String>, String)]) -> Option<Pattern> {
    let mut counts: Vec<(Pattern, usize)> = Vec::new();
    for (first, last, email) in samples {
        let (Some(first), Some(last)) = (first, last) else { continue };
        let local = email.split('@').next().unwrap_or("").to_lowercase();
        for pattern in PRIOR_RANKING {
            if pattern.apply(first, last).as_deref() == Some(local.as_str()) {
                match counts.iter_mut().find(|(p, _)| p == pattern) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((*pattern, 1)),
                }
                break;
            }
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .filter(|(_, n)| *n >= 2)
        .map(|(p, _)| p)
}

/// Ranked candidate addresses, detected pattern first, capped at 8 and
/// deduplicated (short names collapse several patterns onto one string).
pub fn permutations(
    first: &str,
    last: &str,
    domain: &str,
    detected: Option<Pattern>,
) -> Vec<String> {
    let mut ordered: Vec<Pattern> = Vec::with_capacity(PRIOR_RANKING.len() + 1);
    if let Some(p) = detected {
        ordered.push(p);
    }
    for p in PRIOR_RANKING {
        if !ordered.contains(p) {
            ordered.push(*p);
        }
    }

    let mut out: Vec<String> = Vec::new();
    for pattern in ordered {
        let Some(local) = pattern.apply(first, last) else { continue };
        if local.is_empty() {
            continue;
        }
        let email = format!("{local}@{domain}");
        if !out.contains(&email) {
            out.push(email);
        }
        if out.len() == 8 {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(first: &str, last: &str, email: &str) -> (Option<String>, Option<String>, String) {
        (Some(first.to_string()), Some(last.to_string()), email.to_string())
    }

    #[test]
    fn applies_each_pattern() {
        assert_eq!(Pattern::FirstDotLast.apply("Jane", "Doe").unwrap(), "jane.doe");
        assert_eq!(Pattern::FLast.apply("Jane", "Doe").unwrap(), "jdoe");
        assert_eq!(Pattern::FirstL.apply("Jane", "Doe").unwrap(), "janed");
        assert_eq!(Pattern::FirstUnderLast.apply("Jane", "Doe").unwrap(), "jane_doe");
        assert_eq!(Pattern::FirstDashLast.apply("Jane", "Doe").unwrap(), "jane-doe");
        assert_eq!(Pattern::First.apply("Jane", "Doe").unwrap(), "jane");
        assert_eq!(Pattern::Last.apply("Jane", "Doe").unwrap(), "doe");
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(Pattern::FirstDotLast.apply("Élodie", "O'Brien").unwrap(), "lodie.obrien");
        assert!(Pattern::First.apply("", "Doe").is_none());
    }

    #[test]
    fn modal_pattern_needs_two_samples() {
        let one = vec![sample("Ann", "Admin", "a.admin@example.com")];
        assert_eq!(detect_pattern(&one), None);

        let two = vec![
            sample("Ann", "Admin", "ann.admin@example.com"),
            sample("Bob", "Builder", "bob.builder@example.com"),
            sample("Carol", "Chief", "cchief@example.com"),
        ];
        assert_eq!(detect_pattern(&two), Some(Pattern::FirstDotLast));
    }

    #[test]
    fn detection_ignores_nameless_samples() {
        let rows = vec![
            (None, None, "info@example.com".to_string()),
            sample("Ann", "Admin", "ann.admin@example.com"),
        ];
        assert_eq!(detect_pattern(&rows), None);
    }

    #[test]
    fn permutations_rank_detected_pattern_first() {
        let out = permutations("Jane", "Doe", "example.com", Some(Pattern::FLast));
        assert_eq!(out[0], "jdoe@example.com");
        assert!(out.contains(&"jane.doe@example.com".to_string()));
        assert!(out.len() <= 8);
    }

    #[test]
    fn permutations_dedupe_and_cap() {
        // Single-letter names collapse most patterns onto the same string.
        let out = permutations("J", "D", "example.com", None);
        let mut unique = out.clone();
        unique.dedup();
        assert_eq!(out, unique);
        assert!(out.len() <= 8);
        // All seven patterns for a normal name, never more than 8.
        let full = permutations("Jane", "Doe", "example.com", None);
        assert_eq!(full.len(), 7);
    }
}
