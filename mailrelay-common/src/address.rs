//! Helpers for working with bare `local@domain` address strings.

/// Returns the domain part of `address`, lowercased, or `None` if there is no
/// usable domain.
///
/// Angle brackets around the address are tolerated.
pub fn extract_domain(address: &str) -> Option<String> {
    let address = address.trim().trim_start_matches('<').trim_end_matches('>');
    let (local, domain) = address.rsplit_once('@')?;
    let domain = domain.trim();

    if local.is_empty() || domain.is_empty() || domain.contains(char::is_whitespace) {
        return None;
    }

    Some(domain.to_ascii_lowercase())
}

/// Renders a recipient list for log lines, collapsing long lists.
pub fn summarize_recipients(recipients: &[String]) -> String {
    if recipients.len() <= 3 {
        return recipients.join(", ");
    }

    format!(
        "{}, ... ({} total)",
        recipients[..3].join(", "),
        recipients.len()
    )
}

/// Never print the real secret.
pub fn mask_password(password: &str) -> &'static str {
    if password.is_empty() { "" } else { "********" }
}

/// Turns a sender address into something safe to embed in a file name.
pub fn sanitize_for_filename(address: &str) -> String {
    let replaced = address.replace('@', "_at_");
    let sanitized: String = replaced
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = sanitized.trim_start_matches('.');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}
