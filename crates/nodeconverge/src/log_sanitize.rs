//! Makes subprocess output safe to put into logs and reports.

const MAX_LINE_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Escape {
    // Just saw ESC.
    Start,
    // CSI: runs until a final byte in '@'..='~'.
    Csi,
    // OSC: runs until BEL or ESC '\'.
    Osc { after_esc: bool },
    // DCS/SOS/PM/APC: runs until ESC '\'.
    String { after_esc: bool },
}

pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut escape: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = escape {
            escape = match (state, c) {
                (Escape::Start, '[') => Some(Escape::Csi),
                (Escape::Start, ']') => Some(Escape::Osc { after_esc: false }),
                (Escape::Start, 'P' | 'X' | '^' | '_') => Some(Escape::String { after_esc: false }),
                (Escape::Start, _) => None,
                (Escape::Csi, '@'..='~') => None,
                (Escape::Csi, _) => Some(Escape::Csi),
                (Escape::Osc { .. }, '\x07') => None,
                (Escape::Osc { after_esc: true }, '\\') => None,
                (Escape::Osc { .. }, c) => Some(Escape::Osc {
                    after_esc: c == '\x1b',
                }),
                (Escape::String { after_esc: true }, '\\') => None,
                (Escape::String { .. }, c) => Some(Escape::String {
                    after_esc: c == '\x1b',
                }),
            };
            continue;
        }

        match c {
            '\x1b' => escape = Some(Escape::Start),
            '\r' | '\n' => {}
            '\t' => {
                out.push(' ');
                kept += 1;
            }
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                kept += 1;
            }
        }

        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}
