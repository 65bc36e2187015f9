//! Input validation and sanitization for admission requests.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::error::{ApiError, ApiResult};

/// Maximum prompt length, in characters.
pub const MAX_PROMPT_LENGTH: usize = 2000;

/// Maximum style name length.
pub const MAX_STYLE_LENGTH: usize = 64;

/// Shell metacharacters stripped from prompts before they reach a
/// subprocess argument.
static SHELL_METACHARACTERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[;&|`$(){}\[\]<>\\]").unwrap());

/// Reject empty, whitespace-only and over-long prompts.
pub fn validate_prompt(prompt: &str) -> ApiResult<()> {
    if prompt.trim().is_empty() {
        return Err(ApiError::validation("prompt cannot be empty or whitespace"));
    }
    if prompt.chars().count() > MAX_PROMPT_LENGTH {
        return Err(ApiError::validation(format!(
            "prompt must be <= {} characters",
            MAX_PROMPT_LENGTH
        )));
    }
    Ok(())
}

/// Strip shell metacharacters and control characters, trim, and cap length.
pub fn sanitize_prompt(prompt: &str) -> String {
    let stripped = SHELL_METACHARACTERS.replace_all(prompt, "");
    stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect::<String>()
        .trim()
        .chars()
        .take(MAX_PROMPT_LENGTH)
        .collect()
}

/// Validate then sanitize. A prompt made only of metacharacters is rejected.
pub fn clean_prompt(prompt: &str) -> ApiResult<String> {
    validate_prompt(prompt)?;
    let sanitized = sanitize_prompt(prompt);
    if sanitized.is_empty() {
        return Err(ApiError::validation("prompt is empty after sanitization"));
    }
    Ok(sanitized)
}

/// Object keys must be relative and free of traversal segments.
pub fn validate_object_key(key: &str) -> ApiResult<()> {
    mm_storage::validate_key(key).map_err(|e| ApiError::validation(e.to_string()))
}

/// Style names: short, alphanumeric with `-` and `_`.
pub fn validate_style(style: &str) -> ApiResult<()> {
    let valid = !style.is_empty()
        && style.len() <= MAX_STYLE_LENGTH
        && style
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::validation(format!("invalid style: {}", style)))
    }
}

/// Job ids are UUIDs.
pub fn is_valid_job_id(id: &str) -> bool {
    uuid::Uuid::parse_str(id).is_ok()
}

/// Identities used as rate-limit keys: printable, no separators.
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty()
        && identity.len() <= 256
        && identity
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '*' && c != '?')
}
