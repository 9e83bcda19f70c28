use crate::error::{EngineError, Result};

/// Validate a category label: must be non-empty and match [a-z0-9_-]+
pub fn validate_category(category: &str) -> Result<()> {
    if category.is_empty() {
        return Err(EngineError::InvalidValue("category must not be empty".into()));
    }
    if !category
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(EngineError::InvalidValue(format!(
            "category '{category}' contains invalid characters: only a-z, 0-9, _, - allowed"
        )));
    }
    Ok(())
}

pub fn validate_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(EngineError::InvalidValue("title must not be empty".into()));
    }
    Ok(())
}
