use std::str::FromStr;

/// Read an environment variable, falling back to `default` when it is unset
/// or unparseable.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => default,
        },
    }
}

/// Read a boolean environment variable ("true"/"1"/"yes" are truthy).
pub fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name).map_or(default, |raw| {
        matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
    })
}

/// Read a string environment variable with a default.
pub fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Read an optional string environment variable, treating empty as unset.
pub fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Build the dashboard edit URL embedded into alert messages.
pub fn admin_edit_url(admin_domain: &str, monitor_id: i64) -> String {
    format!("https://{admin_domain}/member/monitor-item/edit/{monitor_id}")
}

/// Redact a secret for logging, keeping only a short prefix.
pub fn redact(secret: &str) -> String {
    if secret.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", &secret[..4])
    }
}
