//! Input validation enforced at the broker boundary.
//!
//! Limits mirror the stored-state format: anything accepted here may end up
//! in a durable record, so the rules are deliberately strict.

use crate::error::ProtoError;

pub const MAX_TOPIC_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 256;
pub const MAX_PASSWORD_LEN: usize = 256;
pub const MAX_STATUS_MESSAGE_LEN: usize = 100;
pub const MIN_ROLE_PASSWORD_LEN: usize = 4;

/// Nicknames that can never be claimed by a client.
const RESERVED_NICKNAMES: &[&str] = &["server", "admin", "root", "system"];

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

pub fn validate_nickname(nickname: &str) -> Result<(), ProtoError> {
    if nickname.is_empty() {
        return Err(ProtoError::Validation("Nickname cannot be empty".into()));
    }
    if nickname.len() < 3 {
        return Err(ProtoError::Validation(
            "Nickname must be at least 3 characters".into(),
        ));
    }
    if nickname.len() > 20 {
        return Err(ProtoError::Validation(
            "Nickname must be at most 20 characters".into(),
        ));
    }
    if !nickname.chars().all(is_name_char) {
        return Err(ProtoError::Validation(
            "Nickname can only contain letters, numbers, _ and -".into(),
        ));
    }
    if RESERVED_NICKNAMES.contains(&nickname.to_ascii_lowercase().as_str()) {
        return Err(ProtoError::Validation(format!(
            "Nickname '{nickname}' is reserved"
        )));
    }
    Ok(())
}

/// Lowercase and replace spaces with hyphens. Idempotent.
pub fn normalize_channel_name(raw: &str) -> String {
    raw.to_ascii_lowercase().replace(' ', "-")
}

/// Validate an already-normalized channel name: `#` plus 1–50 name chars.
pub fn validate_channel_name(channel: &str) -> Result<(), ProtoError> {
    if channel.is_empty() {
        return Err(ProtoError::Validation(
            "Channel name cannot be empty".into(),
        ));
    }
    let Some(rest) = channel.strip_prefix('#') else {
        return Err(ProtoError::Validation(
            "Channel name must start with #".into(),
        ));
    };
    if rest.is_empty() {
        return Err(ProtoError::Validation(
            "Channel name must be at least 2 characters (including #)".into(),
        ));
    }
    if rest.len() > 50 {
        return Err(ProtoError::Validation(
            "Channel name must be at most 50 characters (excluding #)".into(),
        ));
    }
    if !rest.chars().all(is_name_char) {
        return Err(ProtoError::Validation(
            "Channel name can only contain letters, numbers, _ and -".into(),
        ));
    }
    Ok(())
}

pub fn validate_topic(topic: &str) -> Result<(), ProtoError> {
    if topic.len() > MAX_TOPIC_LEN {
        return Err(ProtoError::Validation(format!(
            "Topic must be at most {MAX_TOPIC_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_reason(reason: &str) -> Result<(), ProtoError> {
    if reason.len() > MAX_REASON_LEN {
        return Err(ProtoError::Validation(format!(
            "Reason must be at most {MAX_REASON_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_password(password: &str, min_length: usize) -> Result<(), ProtoError> {
    if password.is_empty() {
        return Err(ProtoError::Validation("Password cannot be empty".into()));
    }
    if password.len() < min_length {
        return Err(ProtoError::Validation(format!(
            "Password must be at least {min_length} characters"
        )));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(ProtoError::Validation(format!(
            "Password must be at most {MAX_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Truncate a status message to its limit, on a char boundary.
pub fn clamp_status_message(message: &str) -> String {
    if message.chars().count() <= MAX_STATUS_MESSAGE_LEN {
        message.to_string()
    } else {
        message.chars().take(MAX_STATUS_MESSAGE_LEN).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nickname_rules() {
        assert!(validate_nickname("alice").is_ok());
        assert!(validate_nickname("al").is_err());
        assert!(validate_nickname("a".repeat(21).as_str()).is_err());
        assert!(validate_nickname("ali ce").is_err());
        assert!(validate_nickname("Admin").is_err());
        assert!(validate_nickname("bob_2-x").is_ok());
    }

    #[test]
    fn channel_normalization_is_idempotent() {
        let once = normalize_channel_name("#Dev Chat");
        let twice = normalize_channel_name(&once);
        assert_eq!(once, "#dev-chat");
        assert_eq!(once, twice);
    }

    #[test]
    fn channel_name_rules() {
        assert!(validate_channel_name("#dev").is_ok());
        assert!(validate_channel_name("dev").is_err());
        assert!(validate_channel_name("#").is_err());
        assert!(validate_channel_name(&format!("#{}", "a".repeat(50))).is_ok());
        assert!(validate_channel_name(&format!("#{}", "a".repeat(51))).is_err());
        assert!(validate_channel_name("#dev!").is_err());
    }

    #[test]
    fn status_message_clamped_to_limit() {
        let long = "x".repeat(150);
        assert_eq!(clamp_status_message(&long).len(), MAX_STATUS_MESSAGE_LEN);
        assert_eq!(clamp_status_message("short"), "short");
    }

    #[test]
    fn password_bounds() {
        assert!(validate_password("abcd", MIN_ROLE_PASSWORD_LEN).is_ok());
        assert!(validate_password("abc", MIN_ROLE_PASSWORD_LEN).is_err());
        assert!(validate_password(&"x".repeat(300), 4).is_err());
    }
}
