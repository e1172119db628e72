use crate::social::error::SocialError;

/// Well-formed means non-empty with no whitespace anywhere in it.
pub fn is_well_formed(input: &str) -> bool {
    !input.is_empty() && !input.chars().any(char::is_whitespace)
}

/// Check each named field in order and reject the first malformed one.
pub fn require_well_formed(fields: &[(&'static str, &str)]) -> Result<(), SocialError> {
    for (name, value) in fields {
        if value.is_empty() {
            return Err(SocialError::InvalidInput(format!("{name} must not be empty")));
        }
        if !is_well_formed(value) {
            return Err(SocialError::InvalidInput(format!(
                "{name} must not contain whitespace"
            )));
        }
    }
    Ok(())
}
