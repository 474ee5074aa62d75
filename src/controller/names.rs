use crate::resource::{Application, LEGACY_NAME_PREFIX};

/// DNS labels cap out at 63 characters.
const MAX_LABEL_LEN: usize = 63;

/// Sanitise a human name into a DNS-label-safe container name:
/// lowercase, whitespace runs become `-`, anything outside `[a-z0-9-]`
/// is dropped, and the result is trimmed so it neither starts nor ends
/// with a hyphen. Deterministic and idempotent; may be empty.
pub(crate) fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_whitespace = false;
    for ch in name.chars() {
        if ch.is_whitespace() {
            if !in_whitespace && !out.is_empty() {
                out.push('-');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' {
            out.push(ch);
        }
    }
    let trimmed = out.trim_matches('-');
    let mut label = &trimmed[..trimmed.len().min(MAX_LABEL_LEN)];
    label = label.trim_end_matches('-');
    label.to_owned()
}

/// Engine container name for an application: the sanitized human name,
/// or `simplify-<id>` when sanitisation leaves nothing.
pub(crate) fn container_name(app: &Application) -> String {
    let name = sanitize(&app.name);
    if name.is_empty() {
        format!("{LEGACY_NAME_PREFIX}{}", app.id)
    } else {
        name
    }
}
