const MAX_MESSAGE_BYTES: usize = 240;
const TRUNCATED_SUFFIX: &str = "…(truncated)";

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let keep = max_bytes.saturating_sub(TRUNCATED_SUFFIX.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(TRUNCATED_SUFFIX);
    out
}

/// First non-empty line of `message`, bounded in size.
pub fn one_line(message: &str) -> String {
    let first = message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unknown error");
    truncate_utf8(first, MAX_MESSAGE_BYTES)
}

/// Collapses an error chain into `outer: inner: root`, skipping repeats,
/// then bounds it to a single status line.
pub fn from_error(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && !parts.iter().any(|p| p.contains(&s)) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        return "unknown error".to_string();
    }
    one_line(&parts.join(": "))
}

/// Logs the full chain at error level and returns the user-facing line.
pub fn report(context: &str, err: &(dyn std::error::Error + 'static)) -> String {
    let line = from_error(err);
    tracing::error!(error = ?err, "{context}: {line}");
    line
}
