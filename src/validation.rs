use crate::error::ApiError;

pub fn check_length(field: &str, value: &str, min: usize, max: usize) -> Result<(), ApiError> {
    let len = value.len();
    if len < min || len > max {
        return Err(ApiError::BadRequest(format!(
            "{field} must be between {min} and {max} characters (got {len})"
        )));
    }
    Ok(())
}

pub fn check_name(field: &str, value: &str) -> Result<(), ApiError> {
    check_length(field, value, 1, 255)?;
    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ApiError::BadRequest(format!(
            "{field} must contain only alphanumeric characters, hyphens, underscores, or dots"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_name() {
        assert!(check_name("agent_id", "k8s-east.1_a").is_ok());
    }

    #[test]
    fn name_too_long() {
        let long = "a".repeat(256);
        assert!(check_name("agent_id", &long).is_err());
    }

    #[test]
    fn name_bad_chars() {
        assert!(check_name("agent_id", "foo bar").is_err());
        assert!(check_name("agent_id", "foo/bar").is_err());
    }

    #[test]
    fn length_bounds() {
        assert!(check_length("user", "", 1, 10).is_err());
        assert!(check_length("user", "ok", 1, 10).is_ok());
    }
}
