use serde::{Deserialize, Serialize};

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A typed change observed on a storage watch stream
#[derive(Debug, Clone)]
pub struct WatchEvent<T> {
    pub event_type: WatchEventType,
    /// Storage key of the changed object
    pub key: String,
    /// Decoded object. `None` for removals and for payloads that could not be
    /// decoded.
    pub object: Option<T>,
    /// Store revision of the change
    pub revision: u64,
}

impl<T> WatchEvent<T> {
    pub fn is_remove(&self) -> bool {
        self.event_type == WatchEventType::Deleted
    }

    /// Object name, taken from the last key segment
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_event_name_from_key() {
        let event: WatchEvent<()> = WatchEvent {
            event_type: WatchEventType::Deleted,
            key: "berth.io/v1/Node/node-a".to_string(),
            object: None,
            revision: 7,
        };
        assert!(event.is_remove());
        assert_eq!(event.name(), "node-a");
    }

    #[test]
    fn test_event_type_wire_format() {
        let json = serde_json::to_string(&WatchEventType::Modified).unwrap();
        assert_eq!(json, "\"MODIFIED\"");
    }
}
