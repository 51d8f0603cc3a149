//! Keyboard encoding for protocol input events.

/// Protocol modifier bitmask: Alt=1, Ctrl=2, Meta=4, Shift=8.
const ALT: u32 = 1;
const CTRL: u32 = 2;
const META: u32 = 4;
const SHIFT: u32 = 8;

/// A parsed `press_key` combo: `Enter`, `Control+a`, `Shift+Tab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyCombo {
    pub modifiers: u32,
    pub key: String,
    pub code: Option<String>,
    pub windows_virtual_key_code: Option<u32>,
}

pub(crate) fn parse_key(combo: &str) -> KeyCombo {
    let mut modifiers = 0u32;
    let mut rest = combo.trim();
    while let Some((head, tail)) = rest.split_once('+') {
        // A trailing '+' means '+' itself is the key.
        if tail.is_empty() {
            break;
        }
        match modifier_flag(head) {
            Some(flag) => {
                modifiers |= flag;
                rest = tail;
            }
            None => break,
        }
    }
    let (code, vk) = special_key(rest);
    KeyCombo {
        modifiers,
        key: rest.to_string(),
        code,
        windows_virtual_key_code: vk,
    }
}

fn modifier_flag(name: &str) -> Option<u32> {
    match name.to_ascii_lowercase().as_str() {
        "alt" => Some(ALT),
        "control" | "ctrl" => Some(CTRL),
        "meta" | "cmd" | "command" => Some(META),
        "shift" => Some(SHIFT),
        _ => None,
    }
}

fn special_key(key: &str) -> (Option<String>, Option<u32>) {
    let (code, vk) = match key {
        "Enter" => ("Enter", 13),
        "Tab" => ("Tab", 9),
        "Escape" => ("Escape", 27),
        "Backspace" => ("Backspace", 8),
        "Delete" => ("Delete", 46),
        "ArrowLeft" => ("ArrowLeft", 37),
        "ArrowUp" => ("ArrowUp", 38),
        "ArrowRight" => ("ArrowRight", 39),
        "ArrowDown" => ("ArrowDown", 40),
        "PageUp" => ("PageUp", 33),
        "PageDown" => ("PageDown", 34),
        "Home" => ("Home", 36),
        "End" => ("End", 35),
        " " | "Space" => ("Space", 32),
        _ => return (None, None),
    };
    (Some(code.to_string()), Some(vk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_keys_have_no_modifiers() {
        let combo = parse_key("Enter");
        assert_eq!(combo.modifiers, 0);
        assert_eq!(combo.key, "Enter");
        assert_eq!(combo.windows_virtual_key_code, Some(13));
    }

    #[test]
    fn modifier_prefixes_accumulate() {
        assert_eq!(parse_key("Control+a").modifiers, CTRL);
        assert_eq!(parse_key("Shift+Tab").modifiers, SHIFT);
        let combo = parse_key("Meta+Shift+p");
        assert_eq!(combo.modifiers, META | SHIFT);
        assert_eq!(combo.key, "p");
    }

    #[test]
    fn modifier_names_are_case_insensitive() {
        assert_eq!(parse_key("ctrl+Enter").modifiers, CTRL);
        assert_eq!(parse_key("CMD+k").modifiers, META);
    }

    #[test]
    fn plus_itself_is_a_key() {
        let combo = parse_key("+");
        assert_eq!(combo.modifiers, 0);
        assert_eq!(combo.key, "+");

        let shifted = parse_key("Shift++");
        assert_eq!(shifted.modifiers, SHIFT);
        assert_eq!(shifted.key, "+");
    }

    #[test]
    fn unknown_keys_carry_no_code() {
        let combo = parse_key("a");
        assert_eq!(combo.code, None);
        assert_eq!(combo.windows_virtual_key_code, None);
    }
}
