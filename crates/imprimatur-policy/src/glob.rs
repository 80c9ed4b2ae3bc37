//! Wildcard matching for image reference patterns.
//!
//! `*` matches any run of characters (including `/` and `:`), `?` matches
//! exactly one character. The whole input must match.

/// Returns `true` if `input` matches `pattern`.
pub fn matches(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    let (mut p, mut i) = (0, 0);
    // Position of the last `*` seen and the input index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while i < input.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, i));
                p += 1;
            }
            Some('?') => {
                p += 1;
                i += 1;
            }
            Some(c) if *c == input[i] => {
                p += 1;
                i += 1;
            }
            _ => match backtrack {
                Some((star, at)) => {
                    p = star + 1;
                    i = at + 1;
                    backtrack = Some((star, at + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Returns `true` if any pattern matches `input`.
pub fn matches_any<S: AsRef<str>>(patterns: &[S], input: &str) -> bool {
    patterns.iter().any(|p| matches(p.as_ref(), input))
}
