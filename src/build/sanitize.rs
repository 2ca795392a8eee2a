//! Project-name sanitization for human-facing artifact filenames.
//!
//! Workspace paths use the opaque job id, never the project name, so this
//! only has to produce a safe, stable filename stem.

/// Maximum length (in chars) of a sanitized project name.
pub const MAX_PROJECT_NAME_LEN: usize = 64;

/// Name used when nothing usable survives sanitization.
pub const FALLBACK_PROJECT_NAME: &str = "project";

fn is_illegal(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
        || c.is_control()
        || c.is_whitespace()
}

fn trim_edges(s: &str) -> &str {
    s.trim_matches(|c| c == '_' || c == '.')
}

/// Collapse runs of `_` into one.
fn collapse_underscores(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_underscore = false;
    for c in s.chars() {
        if c == '_' {
            if !prev_underscore {
                out.push(c);
            }
            prev_underscore = true;
        } else {
            out.push(c);
            prev_underscore = false;
        }
    }
    out
}

/// Sanitize a caller-supplied project name.
///
/// Illegal characters and `..` become `_`, runs of `_` collapse, leading and
/// trailing `_`/`.` are trimmed, the result is truncated to
/// [`MAX_PROJECT_NAME_LEN`] chars, and [`FALLBACK_PROJECT_NAME`] is used when
/// nothing is left. The function is idempotent.
pub fn sanitize_project_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if is_illegal(c) { '_' } else { c })
        .collect();

    // Repeat until stable: "..." leaves a "." behind that can pair up again
    // after trimming or truncation.
    let mut current = replaced;
    loop {
        let next = current.replace("..", "_");
        let next = collapse_underscores(&next);
        let next = trim_edges(&next);
        let next: String = next.chars().take(MAX_PROJECT_NAME_LEN).collect();
        let next = trim_edges(&next).to_string();
        if next == current {
            break;
        }
        current = next;
    }

    if current.is_empty() {
        FALLBACK_PROJECT_NAME.to_string()
    } else {
        current
    }
}
