//! Filters an identity's own chat
//! messages out of EventSub notifications, parses the three runtime
//! commands, and decides whether an automatic color change should
//! fire.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct NotificationPayload {
    event: ChatMessageEvent,
}

#[derive(Debug, Deserialize)]
struct ChatMessageEvent {
    chatter_user_login: String,
    broadcaster_user_login: String,
    message: MessageText,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorArg {
    Preset(String),
    Hex(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterAction {
    /// Not our own message, or no actionable command/auto-change.
    None,
    SetEnabled(bool),
    /// `ccc <arg>` — immediate color change, bypasses `enabled`.
    Immediate(ColorArg),
    /// No command matched and auto-change is enabled.
    AutoChange,
}

/// Parses a raw `notification` payload for `channel.chat.message` and
/// decides the routed action. `username` and `enabled` come from the
/// owning `Identity`.
pub fn route(username: &str, enabled: bool, payload: &serde_json::Value) -> RouterAction {
    let parsed: NotificationPayload = match serde_json::from_value(payload.clone()) {
        Ok(p) => p,
        Err(_) => return RouterAction::None,
    };

    if !parsed
        .event
        .chatter_user_login
        .eq_ignore_ascii_case(username)
    {
        return RouterAction::None;
    }

    let text = parsed.event.message.text.trim();

    if text == "cce" {
        return RouterAction::SetEnabled(true);
    }
    if text == "ccd" {
        return RouterAction::SetEnabled(false);
    }
    if let Some(rest) = text.strip_prefix("ccc ") {
        return match parse_color_arg(rest.trim()) {
            Some(arg) => RouterAction::Immediate(arg),
            None => RouterAction::None,
        };
    }

    if enabled {
        RouterAction::AutoChange
    } else {
        RouterAction::None
    }
}

/// Parses a color command argument: a preset name (case-insensitive,
/// underscores ignored), `#rrggbb`/`rrggbb`, or `#rgb`/`rgb` expanded
/// by doubling each nibble.
pub fn parse_color_arg(arg: &str) -> Option<ColorArg> {
    if crate::util::is_blank(arg) {
        return None;
    }
    let arg = arg.trim();

    if let Some(hex) = parse_hex(arg) {
        return Some(ColorArg::Hex(hex));
    }

    let normalized = arg.to_lowercase().replace('_', "");
    crate::palette::PRESETS
        .iter()
        .find(|p| p.to_lowercase().replace('_', "") == normalized)
        .map(|p| ColorArg::Preset(p.to_string()))
}

fn parse_hex(arg: &str) -> Option<String> {
    let stripped = arg.strip_prefix('#').unwrap_or(arg);
    if !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    match stripped.len() {
        6 => Some(format!("#{}", stripped.to_lowercase())),
        3 => {
            let doubled: String = stripped
                .chars()
                .flat_map(|c| [c, c])
                .collect::<String>()
                .to_lowercase();
            Some(format!("#{doubled}"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification_for(chatter: &str, broadcaster: &str, text: &str) -> serde_json::Value {
        serde_json::json!({
            "event": {
                "chatter_user_login": chatter,
                "broadcaster_user_login": broadcaster,
                "message": { "text": text }
            }
        })
    }

    #[test]
    fn ignores_other_users_messages() {
        let payload = notification_for("someone_else", "streamer", "hi");
        assert_eq!(route("mybot", true, &payload), RouterAction::None);
    }

    #[test]
    fn cce_enables_auto_change() {
        let payload = notification_for("mybot", "streamer", "cce");
        assert_eq!(
            route("MyBot", false, &payload),
            RouterAction::SetEnabled(true)
        );
    }

    #[test]
    fn ccd_disables_auto_change() {
        let payload = notification_for("mybot", "streamer", "ccd");
        assert_eq!(
            route("mybot", true, &payload),
            RouterAction::SetEnabled(false)
        );
    }

    #[test]
    fn ccc_bypasses_enabled_flag() {
        let payload = notification_for("mybot", "streamer", "ccc red");
        assert_eq!(
            route("mybot", false, &payload),
            RouterAction::Immediate(ColorArg::Preset("red".into()))
        );
    }

    #[test]
    fn no_command_and_enabled_triggers_auto_change() {
        let payload = notification_for("mybot", "streamer", "hello chat");
        assert_eq!(route("mybot", true, &payload), RouterAction::AutoChange);
    }

    #[test]
    fn no_command_and_disabled_does_nothing() {
        let payload = notification_for("mybot", "streamer", "hello chat");
        assert_eq!(route("mybot", false, &payload), RouterAction::None);
    }

    #[test]
    fn parse_color_arg_accepts_preset_ignoring_underscores_and_case() {
        assert_eq!(
            parse_color_arg("Blue_Violet"),
            Some(ColorArg::Preset("blue_violet".into()))
        );
    }

    #[test]
    fn parse_color_arg_accepts_six_digit_hex_with_and_without_hash() {
        assert_eq!(
            parse_color_arg("#1A2b3C"),
            Some(ColorArg::Hex("#1a2b3c".into()))
        );
        assert_eq!(
            parse_color_arg("1a2b3c"),
            Some(ColorArg::Hex("#1a2b3c".into()))
        );
    }

    #[test]
    fn parse_color_arg_expands_three_digit_hex_by_doubling_nibbles() {
        assert_eq!(
            parse_color_arg("#abc"),
            Some(ColorArg::Hex("#aabbcc".into()))
        );
    }

    #[test]
    fn parse_color_arg_rejects_invalid_input() {
        assert_eq!(parse_color_arg("not-a-color"), None);
        assert_eq!(parse_color_arg("#12"), None);
    }

    #[test]
    fn parse_color_arg_rejects_whitespace_only_input() {
        assert_eq!(parse_color_arg("   "), None);
    }
}
