//! Strip terminal control sequences before pattern matching.
//!
//! Only removes; never interprets cursor movement.

/// Remove CSI, OSC, DCS/SOS/PM/APC strings, two-byte escapes and stray C0
/// controls (except newline and tab) from `input`.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => match chars.next() {
                Some('[') => skip_csi(&mut chars),
                Some(']') | Some('P') | Some('X') | Some('^') | Some('_') => skip_string(&mut chars),
                // Charset designators carry one more byte: ESC ( B
                Some('(') | Some(')') | Some('*') | Some('+') => {
                    chars.next();
                }
                Some(_) | None => {}
            },
            '\u{9b}' => skip_csi(&mut chars),
            '\n' | '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

fn skip_csi<I: Iterator<Item = char>>(chars: &mut I) {
    // Parameter and intermediate bytes end at a final byte in 0x40..=0x7e.
    for c in chars.by_ref() {
        if ('\u{40}'..='\u{7e}').contains(&c) {
            break;
        }
    }
}

fn skip_string<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>) {
    // Terminated by BEL or ST (ESC \).
    while let Some(c) = chars.next() {
        match c {
            '\u{7}' | '\u{9c}' => break,
            '\u{1b}' => {
                if chars.peek() == Some(&'\\') {
                    chars.next();
                }
                break;
            }
            _ => {}
        }
    }
}
