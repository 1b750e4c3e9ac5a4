//! `*` / `?` mask matching under RFC 1459 case mapping.
//!
//! Used for server masks (CONNECT, SQUIT, RCONNECT, TIME) and for x-line
//! masks.

use crate::casemap::irc_lower_char;

/// Match `text` against a mask where `*` matches any run and `?` any one
/// character.
///
/// ```
/// use treelink_proto::wildcard_match;
///
/// assert!(wildcard_match("*.example.net", "Leaf.EXAMPLE.net"));
/// assert!(wildcard_match("leaf?.example.net", "leaf2.example.net"));
/// assert!(!wildcard_match("hub.*", "leaf.example.net"));
/// ```
pub fn wildcard_match(mask: &str, text: &str) -> bool {
    let mask: Vec<char> = mask.chars().map(irc_lower_char).collect();
    let text: Vec<char> = text.chars().map(irc_lower_char).collect();

    let (mut m, mut t) = (0, 0);
    // Last `*` seen and the text position it is currently absorbing up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match mask.get(m) {
            Some('*') => {
                backtrack = Some((m, t));
                m += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                m += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, absorbed)) => {
                    m = star + 1;
                    t = absorbed + 1;
                    backtrack = Some((star, absorbed + 1));
                }
                None => return false,
            },
        }
    }

    mask[m..].iter().all(|&c| c == '*')
}

/// Whether a mask contains wildcard characters.
pub fn has_wildcards(mask: &str) -> bool {
    mask.contains(['*', '?'])
}
