// tmux control mode (-C) parser.
//
// `tmux -C attach -r` prints notifications prefixed with `%`. The daemon only
// cares about structural changes (to wake the topology poller) and about
// which panes produced output (to pull their next capture forward), so pane
// output is reduced to its pane id and the payload is never decoded.

/// Parsed notification from tmux control mode output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// `%output %<pane-id> <data>` or `%extended-output %<pane-id> <age> : <data>`
    Output { pane_id: String },
    /// `%layout-change @<window-id> <layout> ...`
    LayoutChange { window_id: String },
    /// `%window-add @<id>`
    WindowAdd { window_id: String },
    /// `%window-close @<id>` / `%unlinked-window-close @<id>`
    WindowClose { window_id: String },
    /// `%window-renamed @<id> <name>`
    WindowRenamed { window_id: String, name: String },
    /// `%session-changed $<id> <name>`
    SessionChanged { session_id: String, name: String },
    /// `%sessions-changed`
    SessionsChanged,
    /// `%pane-mode-changed %<pane-id>`
    PaneModeChanged { pane_id: String },
    /// `%begin` / `%end` / `%error` command response framing.
    Reply,
    /// `%exit [reason]`
    Exit { reason: String },
    /// Starts with `%` but is not a known notification.
    Unknown(String),
}

impl ControlEvent {
    /// Whether the event can change the window/pane set or their names.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::LayoutChange { .. }
                | Self::WindowAdd { .. }
                | Self::WindowClose { .. }
                | Self::WindowRenamed { .. }
                | Self::SessionChanged { .. }
                | Self::SessionsChanged
        )
    }
}

/// Split a string into the first whitespace-delimited word and the remainder.
/// The remainder is trimmed of leading whitespace.
fn split_first_word(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

/// Parse a single control mode line. Returns `None` for lines that are not
/// notifications (command output between `%begin` and `%end`, blank lines).
pub fn parse_line(line: &str) -> Option<ControlEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if !line.starts_with('%') {
        return None;
    }
    let (keyword, rest) = split_first_word(line);
    let (first, remainder) = split_first_word(rest);
    let unknown = || Some(ControlEvent::Unknown(line.to_string()));

    match keyword {
        "%output" | "%extended-output" => {
            if first.is_empty() {
                return unknown();
            }
            Some(ControlEvent::Output {
                pane_id: first.to_string(),
            })
        }
        "%layout-change" | "%window-add" | "%window-close" | "%unlinked-window-close"
            if first.is_empty() =>
        {
            unknown()
        }
        "%layout-change" => Some(ControlEvent::LayoutChange {
            window_id: first.to_string(),
        }),
        "%window-add" => Some(ControlEvent::WindowAdd {
            window_id: first.to_string(),
        }),
        "%window-close" | "%unlinked-window-close" => Some(ControlEvent::WindowClose {
            window_id: first.to_string(),
        }),
        "%window-renamed" if !first.is_empty() => Some(ControlEvent::WindowRenamed {
            window_id: first.to_string(),
            name: remainder.to_string(),
        }),
        "%session-changed" if !first.is_empty() => Some(ControlEvent::SessionChanged {
            session_id: first.to_string(),
            name: remainder.to_string(),
        }),
        "%sessions-changed" => Some(ControlEvent::SessionsChanged),
        "%pane-mode-changed" if !first.is_empty() => Some(ControlEvent::PaneModeChanged {
            pane_id: first.to_string(),
        }),
        "%begin" | "%end" | "%error" => Some(ControlEvent::Reply),
        "%exit" => Some(ControlEvent::Exit {
            reason: rest.to_string(),
        }),
        _ => unknown(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_keeps_pane_only() {
        assert_eq!(
            parse_line(r"%output %3 \033[1mhello\015\012"),
            Some(ControlEvent::Output { pane_id: "%3".into() })
        );
        assert_eq!(
            parse_line("%extended-output %7 120 : data"),
            Some(ControlEvent::Output { pane_id: "%7".into() })
        );
    }

    #[test]
    fn structural_events() {
        let cases = [
            ("%window-add @4", ControlEvent::WindowAdd { window_id: "@4".into() }),
            ("%window-close @4", ControlEvent::WindowClose { window_id: "@4".into() }),
            ("%unlinked-window-close @5", ControlEvent::WindowClose { window_id: "@5".into() }),
            (
                "%layout-change @1 b25f,80x24,0,0,2 b25f,80x24,0,0,2 *",
                ControlEvent::LayoutChange { window_id: "@1".into() },
            ),
            (
                "%window-renamed @1 build logs",
                ControlEvent::WindowRenamed { window_id: "@1".into(), name: "build logs".into() },
            ),
            (
                "%session-changed $0 main",
                ControlEvent::SessionChanged { session_id: "$0".into(), name: "main".into() },
            ),
            ("%sessions-changed", ControlEvent::SessionsChanged),
        ];
        for (line, expected) in cases {
            let ev = parse_line(line).expect("should parse");
            assert!(ev.is_structural(), "{line}");
            assert_eq!(ev, expected);
        }
    }

    #[test]
    fn non_structural_events() {
        assert!(!parse_line("%output %1 x").expect("parse").is_structural());
        assert!(!parse_line("%pane-mode-changed %1").expect("parse").is_structural());
        assert_eq!(parse_line("%begin 1700000000 12 0"), Some(ControlEvent::Reply));
        assert_eq!(
            parse_line("%exit server exited"),
            Some(ControlEvent::Exit { reason: "server exited".into() })
        );
    }

    #[test]
    fn malformed_and_foreign_lines() {
        assert_eq!(parse_line("plain command output"), None);
        assert_eq!(parse_line(""), None);
        assert!(matches!(parse_line("%window-add"), Some(ControlEvent::Unknown(_))));
        assert!(matches!(parse_line("%output"), Some(ControlEvent::Unknown(_))));
        assert!(matches!(parse_line("%client-detached /dev/ttys001"), Some(ControlEvent::Unknown(_))));
    }
}
