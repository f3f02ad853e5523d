//! Human-readable release summaries.

use stevedore_id::ReleaseVersion;

use crate::models::ConfigChanges;

pub(crate) fn initial(owner: &str) -> String {
    format!("{owner} created initial release")
}

pub(crate) fn deployed(owner: &str, image: &str) -> String {
    format!("{owner} deployed {image}")
}

pub(crate) fn rolled_back(owner: &str, target: ReleaseVersion) -> String {
    format!("{owner} rolled back to {target}")
}

pub(crate) fn config_changed(owner: &str, changes: &ConfigChanges) -> String {
    let mut parts = Vec::new();
    if !changes.added.is_empty() {
        parts.push(format!("added {}", changes.added.join(", ")));
    }
    if !changes.changed.is_empty() {
        parts.push(format!("changed {}", changes.changed.join(", ")));
    }
    if !changes.removed.is_empty() {
        parts.push(format!("removed {}", changes.removed.join(", ")));
    }
    if !changes.limits.is_empty() {
        let types: Vec<&str> = changes.limits.iter().map(String::as_str).collect();
        parts.push(format!("changed limits for {}", types.join(", ")));
    }
    if changes.tags {
        parts.push("changed tags".to_string());
    }
    format!("{owner} {}", parts.join(" and "))
}
