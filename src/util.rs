//! Display helpers for the terminal surfaces.

/// Shorten `line` to `max_chars` characters, marking the cut with "...".
///
/// Cuts on character boundaries, so multi-byte text never splits.
pub fn clip_line(line: &str, max_chars: usize) -> String {
    match line.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", line[..idx].trim_end()),
        None => line.to_string(),
    }
}

/// The last `n` entries of `lines` (all of them when there are fewer).
pub fn tail<T>(lines: &[T], n: usize) -> &[T] {
    &lines[lines.len().saturating_sub(n)..]
}
