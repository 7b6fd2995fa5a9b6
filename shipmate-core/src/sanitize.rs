//! Sanitization utilities for subprocess output and command arguments.
//!
//! Everything the orchestrator hands to a shell or back to a chat passes
//! through here: ANSI stripping before delivery, a fixed argument alphabet
//! before interpolation, and head+tail truncation for long output.

/// Strip ANSI escape sequences from subprocess output.
///
/// Handles CSI (`ESC [ ... final`) and OSC (`ESC ] ... BEL` or `ESC ] ... ESC \`)
/// sequences plus bare escapes. Chat transports render raw escapes verbatim,
/// so output is stripped before any user delivery.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\u{1b}' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // CSI: consume until a final byte in 0x40..=0x7e
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                // OSC: consume until BEL or ESC \
                while let Some(c) = chars.next() {
                    if c == '\u{07}' {
                        break;
                    }
                    if c == '\u{1b}' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            _ => {
                // Bare escape: drop it and the following character
                chars.next();
            }
        }
    }

    out
}

/// The fixed alphabet allowed in whitelisted command arguments.
///
/// Alphanumerics plus the characters that appear in repo names, paths,
/// refs, and URLs. Everything else (shell metacharacters in particular)
/// is rejected before interpolation.
pub fn is_safe_argument(arg: &str) -> bool {
    !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '~' | '=' | '+')
        })
}

/// Reject any argument in the list that falls outside the fixed alphabet.
/// Returns the first offending argument, if any.
pub fn first_unsafe_argument<'a>(args: &'a [String]) -> Option<&'a str> {
    args.iter().map(String::as_str).find(|a| !is_safe_argument(a))
}

/// Bound long output for chat delivery, preserving both ends.
///
/// When `input` exceeds `max_len`, keeps the head and tail halves and
/// inserts a marker noting how many characters were elided. Splits on
/// char boundaries.
pub fn truncate_head_tail(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let keep = max_len / 2;
    let head_end = floor_char_boundary(input, keep);
    let tail_start = ceil_char_boundary(input, input.len() - keep);
    let elided = input[head_end..tail_start].chars().count();
    format!(
        "{}\n… [{} chars truncated] …\n{}",
        &input[..head_end],
        elided,
        &input[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
