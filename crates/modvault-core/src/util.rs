//! Small shared helpers.

/// Make a name safe to use as a single path component.
///
/// Path separators, reserved punctuation and control characters become `_`;
/// trailing dots and spaces are stripped. The function is idempotent and
/// never returns an empty string.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    while out.ends_with('.') || out.ends_with(' ') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("download");
    }
    out
}
