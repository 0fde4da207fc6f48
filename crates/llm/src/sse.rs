//! Line-buffering helper shared by every SSE-speaking adapter.
//!
//! A single SSE event can be split across multiple TCP packets, so each
//! adapter accumulates raw bytes into a `String` buffer and only hands
//! complete `\n`-terminated lines to its own per-provider parser; the
//! trailing partial line is left in the buffer for the next chunk.

/// Drains every complete line out of `buf`, returning them in order and
/// leaving any trailing partial line behind for the next call.
pub fn drain_complete_lines(buf: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        lines.push(line);
    }
    lines
}

/// Strips the `data: ` prefix from one SSE line, trimming whitespace.
/// Returns `None` for blank lines, comments (`:`-prefixed), or any other
/// non-`data:` line (e.g. `event: ...` framing lines some providers send).
pub fn sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() { None } else { Some(data) }
}
