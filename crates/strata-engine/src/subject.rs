//! Subject validation and wildcard matching.
//!
//! Subjects are dot-separated token lists. `*` matches exactly one token,
//! `>` matches one or more trailing tokens and must be the final token.

/// Returns true if `subject` is a syntactically valid subject or pattern.
pub fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() || token.contains(' ') {
            return false;
        }
        if *token == ">" && i != tokens.len() - 1 {
            return false;
        }
        // Wildcards are only valid as whole tokens.
        if token.len() > 1 && (token.contains('*') || token.contains('>')) {
            return false;
        }
    }
    true
}

/// Returns true if `subject` contains no wildcard tokens.
pub fn is_literal_subject(subject: &str) -> bool {
    is_valid_subject(subject) && !subject.split('.').any(|t| t == "*" || t == ">")
}

/// Returns true if the literal `subject` is matched by `pattern`.
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let mut subj = subject.split('.');
    let mut pat = pattern.split('.').peekable();

    loop {
        match (subj.next(), pat.next()) {
            (_, Some(">")) => return true,
            (Some(s), Some(p)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Returns true if two patterns can both match some subject.
///
/// Used for the per-account filter exclusivity invariant and for
/// work-queue partition checks, where one pattern covering another
/// counts as overlap.
pub fn subjects_overlap(a: &str, b: &str) -> bool {
    let mut ta = a.split('.').peekable();
    let mut tb = b.split('.').peekable();

    loop {
        match (ta.next(), tb.next()) {
            (Some(">"), _) | (_, Some(">")) => return true,
            (Some(x), Some(y)) => {
                if x != "*" && y != "*" && x != y {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
