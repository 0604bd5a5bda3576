//! Line-window arithmetic for read, write and edit.
//!
//! Read and write windows are 0-indexed and half-open (`start..end`); edit
//! ranges are 1-indexed and inclusive. In both, a negative `end` means end of
//! file. Out-of-range bounds are clamped rather than rejected.

fn split(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

fn window(len: usize, start: i64, end: i64) -> (usize, usize) {
    let start = usize::try_from(start.max(0)).unwrap_or(0).min(len);
    let end = if end < 0 {
        len
    } else {
        usize::try_from(end).unwrap_or(len).min(len)
    };
    (start, end.max(start))
}

/// The lines `start..end` of `text`.
pub fn slice_lines(text: &str, start: i64, end: i64) -> String {
    let lines = split(text);
    let (start, end) = window(lines.len(), start, end);
    lines[start..end].concat()
}

/// `text` with lines `start..end` replaced by `replacement`.
pub fn splice_lines(text: &str, start: i64, end: i64, replacement: &str) -> String {
    let lines = split(text);
    let (start, end) = window(lines.len(), start, end);
    let mut out = String::with_capacity(text.len() + replacement.len());
    out.extend(lines[..start].iter().copied());
    out.push_str(replacement);
    if end < lines.len() && !replacement.is_empty() && !replacement.ends_with('\n') {
        out.push('\n');
    }
    out.extend(lines[end..].iter().copied());
    out
}

/// `text` with the 1-indexed inclusive range `start..=end` replaced.
pub fn edit_lines(text: &str, start: i64, end: i64, replacement: &str) -> String {
    let end = if end < 0 { -1 } else { end };
    splice_lines(text, start.max(1) - 1, end, replacement)
}
