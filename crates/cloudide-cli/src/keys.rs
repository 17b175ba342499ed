use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// Ctrl-] leaves an attached terminal.
pub fn is_detach(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char(']')
}

/// Translate a key press into the string a remote shell expects on stdin.
pub fn key_to_stdin(key: &KeyEvent) -> Option<String> {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char(c) = key.code {
            if c.is_ascii() {
                let ctrl = (c.to_ascii_lowercase() as u8).wrapping_sub(b'`');
                if ctrl < 32 {
                    return Some(char::from(ctrl).to_string());
                }
            }
        }
    }

    // Alt sends ESC before the character (readline word motions).
    if key.modifiers.contains(KeyModifiers::ALT) {
        if let KeyCode::Char(c) = key.code {
            return Some(format!("\x1b{c}"));
        }
    }

    let seq = match key.code {
        KeyCode::Char(c) => return Some(c.to_string()),
        KeyCode::Enter => "\r",
        KeyCode::Backspace => "\x7f",
        KeyCode::Tab => "\t",
        KeyCode::BackTab => "\x1b[Z",
        KeyCode::Esc => "\x1b",
        KeyCode::Up => "\x1b[A",
        KeyCode::Down => "\x1b[B",
        KeyCode::Right => "\x1b[C",
        KeyCode::Left => "\x1b[D",
        KeyCode::Home => "\x1b[H",
        KeyCode::End => "\x1b[F",
        KeyCode::PageUp => "\x1b[5~",
        KeyCode::PageDown => "\x1b[6~",
        KeyCode::Delete => "\x1b[3~",
        KeyCode::Insert => "\x1b[2~",
        KeyCode::F(n) => match n {
            1 => "\x1bOP",
            2 => "\x1bOQ",
            3 => "\x1bOR",
            4 => "\x1bOS",
            5 => "\x1b[15~",
            6 => "\x1b[17~",
            7 => "\x1b[18~",
            8 => "\x1b[19~",
            9 => "\x1b[20~",
            10 => "\x1b[21~",
            11 => "\x1b[23~",
            12 => "\x1b[24~",
            _ => return None,
        },
        _ => return None,
    };
    Some(seq.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn plain_characters_pass_through() {
        assert_eq!(
            key_to_stdin(&key(KeyCode::Char('a'), KeyModifiers::NONE)).as_deref(),
            Some("a")
        );
        assert_eq!(
            key_to_stdin(&key(KeyCode::Char('é'), KeyModifiers::SHIFT)).as_deref(),
            Some("é")
        );
    }

    #[test]
    fn control_characters() {
        assert_eq!(
            key_to_stdin(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)).as_deref(),
            Some("\x03")
        );
        assert_eq!(
            key_to_stdin(&key(KeyCode::Char('D'), KeyModifiers::CONTROL)).as_deref(),
            Some("\x04")
        );
    }

    #[test]
    fn control_with_non_ascii_is_not_a_control_character() {
        assert_eq!(
            key_to_stdin(&key(KeyCode::Char('š'), KeyModifiers::CONTROL)).as_deref(),
            Some("š")
        );
    }

    #[test]
    fn alt_prefixes_escape() {
        assert_eq!(
            key_to_stdin(&key(KeyCode::Char('b'), KeyModifiers::ALT)).as_deref(),
            Some("\x1bb")
        );
    }

    #[test]
    fn named_keys() {
        assert_eq!(
            key_to_stdin(&key(KeyCode::Enter, KeyModifiers::NONE)).as_deref(),
            Some("\r")
        );
        assert_eq!(
            key_to_stdin(&key(KeyCode::Up, KeyModifiers::NONE)).as_deref(),
            Some("\x1b[A")
        );
        assert_eq!(
            key_to_stdin(&key(KeyCode::F(5), KeyModifiers::NONE)).as_deref(),
            Some("\x1b[15~")
        );
        assert_eq!(key_to_stdin(&key(KeyCode::F(20), KeyModifiers::NONE)), None);
    }

    #[test]
    fn detach_chord() {
        assert!(is_detach(&key(KeyCode::Char(']'), KeyModifiers::CONTROL)));
        assert!(!is_detach(&key(KeyCode::Char(']'), KeyModifiers::NONE)));
    }
}
