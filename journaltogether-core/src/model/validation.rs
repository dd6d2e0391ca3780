//! Local input validation
//!
//! Everything here runs before any network call is made.

/// Longest accepted group name, in characters
pub const MAX_GROUP_NAME_LEN: usize = 120;

/// Input rejected locally
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid email address: {0:?}")]
    InvalidEmail(String),

    #[error("Group name must not be empty")]
    EmptyGroupName,

    #[error("Group name exceeds {MAX_GROUP_NAME_LEN} characters")]
    GroupNameTooLong,

    #[error("Invalid magic code format")]
    MalformedCode,

    #[error("Invalid path segment: {0:?}")]
    InvalidPathSegment(String),
}

/// Check the usual `local@domain.tld` shape and return the trimmed address.
pub fn validate_email(email: &str) -> Result<String, ValidationError> {
    let trimmed = email.trim();
    let invalid = || ValidationError::InvalidEmail(email.to_string());

    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let (local, domain) = trimmed.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return Err(invalid());
    }

    Ok(trimmed.to_string())
}

/// Trim a group name and reject blank or oversized names.
pub fn validate_group_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyGroupName);
    }
    if trimmed.chars().count() > MAX_GROUP_NAME_LEN {
        return Err(ValidationError::GroupNameTooLong);
    }
    Ok(trimmed.to_string())
}

/// Magic codes are six ASCII digits.
pub fn validate_code(code: &str) -> Result<String, ValidationError> {
    let trimmed = code.trim();
    if trimmed.len() == 6 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        Ok(trimmed.to_string())
    } else {
        Err(ValidationError::MalformedCode)
    }
}

/// Store path segments: non-empty, no separators or reserved characters.
pub fn validate_path_segment(segment: &str) -> Result<(), ValidationError> {
    const RESERVED: &[char] = &['/', '.', '#', '$', '[', ']'];
    if segment.is_empty() || segment.contains(RESERVED) {
        return Err(ValidationError::InvalidPathSegment(segment.to_string()));
    }
    Ok(())
}
