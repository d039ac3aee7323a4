use kube::runtime::events::{Event, EventType};

#[must_use]
pub fn from_create(src_type: &str, src_name: &str, child_type: &str, child_name: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: format!("{child_type}Created"),
        note: Some(format!("Created {child_type} `{child_name}` for {src_type} `{src_name}`")),
        action: format!("Creating {child_type}"),
        secondary: None,
    }
}

#[must_use]
pub fn from_update(src_type: &str, src_name: &str, child_type: &str, child_name: &str, fields: &[&str]) -> Event {
    Event {
        type_: EventType::Normal,
        reason: format!("{child_type}Updated"),
        note: Some(format!(
            "Updated {child_type} `{child_name}` for {src_type} `{src_name}` ({} changed)",
            fields.join(", ")
        )),
        action: format!("Updating {child_type}"),
        secondary: None,
    }
}

#[must_use]
pub fn invalid(src_type: &str, src_name: &str, message: &str) -> Event {
    Event {
        type_: EventType::Warning,
        reason: "ValidationFailed".to_string(),
        note: Some(format!("{src_type} `{src_name}` is invalid: {message}")),
        action: "Validating".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn deletion_blocked(src_type: &str, src_name: &str, referrers: &[String]) -> Event {
    Event {
        type_: EventType::Warning,
        reason: "DeletionBlocked".to_string(),
        note: Some(format!(
            "{src_type} `{src_name}` is still referenced by {}",
            referrers.join(", ")
        )),
        action: "Deleting".to_string(),
        secondary: None,
    }
}
