//! Presence store key layout and name validation.
//!
//! Users and channels are tracked as members of two global sets; each
//! channel's members live in a set keyed by the channel name itself.

/// Set of every active username.
pub const USERS_KEY: &str = "chat-users";

/// Set of every active channel name.
pub const CHANNELS_KEY: &str = "chat-channels";

/// Maximum user or channel name length.
pub const MAX_NAME_LENGTH: usize = 256;

/// Validate a channel name.
///
/// Channel names double as store keys, so the two global set keys are
/// reserved.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name == USERS_KEY || name == CHANNELS_KEY {
        return Err("Channel name is reserved");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Validate a username.
///
/// # Errors
///
/// Returns an error message if the username is invalid.
pub fn validate_user_name(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Username cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("Username too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Username contains invalid characters");
    }
    Ok(())
}
