//! Topic names and filters.

use xively_core::validate_topic_name;

use crate::state::{Result, State};

/// Telemetry topic `xi/blue/v1/<account>/d/<device>/<name>`.
pub fn telemetry_topic(account_id: &str, device_id: &str, name: &str) -> Result<String> {
    if account_id.is_empty() || device_id.is_empty() || name.is_empty() {
        return Err(State::InvalidParameter);
    }
    Ok(format!("xi/blue/v1/{}/d/{}/{}", account_id, device_id, name))
}

/// Check a topic used for publishing.
pub fn validate_publish_topic(topic: &str) -> Result<()> {
    validate_topic_name(topic).map_err(|_| State::InvalidParameter)
}

/// Check a subscription filter: `+` must fill a whole level and `#` must be
/// the last level.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() || filter.contains('\0') {
        return Err(State::InvalidParameter);
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(State::InvalidParameter);
        }
        if level.contains('+') && *level != "+" {
            return Err(State::InvalidParameter);
        }
    }
    Ok(())
}

/// Whether `topic` is matched by `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_topic() {
        assert_eq!(
            telemetry_topic("acc", "dev", "temperature").unwrap(),
            "xi/blue/v1/acc/d/dev/temperature"
        );
        assert_eq!(telemetry_topic("", "dev", "t"), Err(State::InvalidParameter));
    }

    #[test]
    fn test_matching() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/c"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "x/y"));
        assert!(!topic_matches("a/b/c", "a/b"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(validate_topic_filter("a/+/b").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("a/#/b").is_err());
        assert!(validate_topic_filter("a/b#").is_err());
        assert!(validate_topic_filter("a+/b").is_err());
        assert!(validate_topic_filter("").is_err());
    }
}
