//! Wildcard matching for policy objects.
//!
//! `*` matches any run of characters, `/` included, so `did:abc/*` covers
//! every repository of `did:abc`.  `?` matches exactly one character.  All
//! other characters are literal.

/// Returns `true` if `input` matches `pattern` in full.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    let (mut p, mut i) = (0, 0);
    // Position of the last `*` seen and the input index it was tried against.
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
            Some(&c) if c == input[i] => {
                p += 1;
                i += 1;
            }
            _ => match backtrack {
                Some((star_p, star_i)) => {
                    p = star_p + 1;
                    i = star_i + 1;
                    backtrack = Some((star_p, star_i + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
