//! Name and id validation.

use stepwise_types::error::WorkflowError;

/// Maximum length of a step, sleep or wait name.
pub const MAX_STEP_NAME_LENGTH: usize = 256;

/// Maximum length of an instance id.
pub const MAX_INSTANCE_ID_LENGTH: usize = 100;

/// Step names must fit the length limit and contain no control characters.
pub fn validate_step_name(name: &str) -> bool {
    name.chars().count() <= MAX_STEP_NAME_LENGTH && !name.chars().any(char::is_control)
}

/// Like [`validate_step_name`], returning the fatal user error on failure.
pub fn ensure_step_name(name: &str) -> Result<(), WorkflowError> {
    if validate_step_name(name) {
        Ok(())
    } else {
        Err(WorkflowError::InvalidStep(format!(
            "Step name \"{name}\" exceeds max length ({MAX_STEP_NAME_LENGTH} chars) or invalid characters found"
        )))
    }
}

/// Instance ids match `^[a-zA-Z0-9_][a-zA-Z0-9-_]*$` and are at most 100 chars.
pub fn validate_instance_id(id: &str) -> bool {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    id.len() <= MAX_INSTANCE_ID_LENGTH
        && (first.is_ascii_alphanumeric() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_name_length_limit() {
        assert!(validate_step_name("charge card"));
        assert!(validate_step_name(&"a".repeat(MAX_STEP_NAME_LENGTH)));
        assert!(!validate_step_name(&"a".repeat(MAX_STEP_NAME_LENGTH + 1)));
    }

    #[test]
    fn test_step_name_rejects_control_chars() {
        assert!(!validate_step_name("bad\nname"));
        assert!(!validate_step_name("bad\u{0}name"));
        assert!(validate_step_name("émoji ok 🚀"));
    }

    #[test]
    fn test_ensure_step_name_is_user_error() {
        let err = ensure_step_name("bad\tname").unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStep(_)));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_instance_id_rules() {
        assert!(validate_instance_id("abc"));
        assert!(validate_instance_id("_private-1"));
        assert!(validate_instance_id("0197f1c2-7d7a-7cc1-9a59-2a1f1b0c7e11"));
        assert!(!validate_instance_id(""));
        assert!(!validate_instance_id("-leading-dash"));
        assert!(!validate_instance_id("has space"));
        assert!(!validate_instance_id("dots.not.allowed"));
        assert!(validate_instance_id(&"a".repeat(100)));
        assert!(!validate_instance_id(&"a".repeat(101)));
    }
}
