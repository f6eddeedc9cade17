//! Utility functions for the distributed job worker
//!
//! Small validation helpers used across the worker crates.

/// Validate worker ID format
///
/// Worker IDs must contain only alphanumeric characters, hyphens, and
/// underscores. They must not be empty and should be reasonable in length.
pub fn validate_worker_id(worker_id: &str) -> crate::Result<()> {
    if worker_id.is_empty() {
        return Err(
            crate::WorkerError::Validation("Worker ID cannot be empty".to_string()).into(),
        );
    }

    if worker_id.len() > 64 {
        return Err(crate::WorkerError::Validation(
            "Worker ID cannot be longer than 64 characters".to_string(),
        )
        .into());
    }

    if !worker_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::WorkerError::Validation(
            "Worker ID can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        )
        .into());
    }

    Ok(())
}

/// Validate URL format and structure
///
/// Performs proper URL parsing to ensure:
/// - URL is syntactically valid
/// - Uses http or https scheme (or just https if `https_only` is true)
/// - Has a valid host
/// - Does not contain embedded credentials (security risk)
///
/// # Arguments
/// * `url_str` - The URL string to validate
/// * `https_only` - If true, only https:// URLs are allowed
///
/// # Returns
/// * `Ok(())` if the URL is valid
/// * `Err` with a descriptive error message if validation fails
pub fn validate_url(url_str: &str, https_only: bool) -> crate::Result<()> {
    use url::Url;

    let parsed = Url::parse(url_str).map_err(|e| {
        crate::WorkerError::Validation(format!("Invalid URL '{}': {}", url_str, e))
    })?;

    // Check scheme
    let scheme = parsed.scheme();
    if https_only {
        if scheme != "https" {
            return Err(crate::WorkerError::Validation(format!(
                "URL '{}' must use https:// scheme",
                url_str
            ))
            .into());
        }
    } else if scheme != "http" && scheme != "https" {
        return Err(crate::WorkerError::Validation(format!(
            "URL '{}' must use http:// or https:// scheme",
            url_str
        ))
        .into());
    }

    // Check for valid host
    if parsed.host().is_none() {
        return Err(crate::WorkerError::Validation(format!(
            "URL '{}' must have a valid host",
            url_str
        ))
        .into());
    }

    // Security: reject URLs with embedded credentials
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(crate::WorkerError::Validation(format!(
            "URL '{}' must not contain embedded credentials (use separate authentication)",
            url_str
        ))
        .into());
    }

    Ok(())
}
