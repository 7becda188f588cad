//! Content sanitisation applied before persistence.
//!
//! Textual content is escaped against markup/script injection. This runs
//! on the delivery path for plaintext bodies and for any plaintext preview
//! associated with an encrypted envelope; ciphertext itself is opaque and
//! passes through untouched.

/// Escape HTML-significant characters so stored content is inert when
/// rendered into markup.
pub fn escape_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Sanitize user-supplied text: strip control characters (except newline
/// and tab), then escape markup.
pub fn sanitize_text(input: &str) -> String {
    let stripped: String = input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    escape_markup(&stripped)
}
