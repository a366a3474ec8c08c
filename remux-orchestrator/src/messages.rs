use remux_common::model::PushMessage;
use remux_common::SafeDisplay;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum PushMessageError {
    #[error("Invalid push message: {0}")]
    InvalidPayload(String),
}

impl SafeDisplay for PushMessageError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

/// Process-wide notification queue consumed by the UI. Messages are
/// deduplicated by id; reading does not drain.
#[derive(Default)]
pub struct FrontendPushMessages {
    items: Mutex<Vec<PushMessage>>,
}

impl FrontendPushMessages {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(message: &PushMessage) -> Result<(), PushMessageError> {
        if message.id.is_empty() {
            return Err(PushMessageError::InvalidPayload("id must be set".to_string()));
        }
        if message.code.is_empty() {
            return Err(PushMessageError::InvalidPayload(
                "code must be set".to_string(),
            ));
        }
        if message.timeout < 0 {
            return Err(PushMessageError::InvalidPayload(
                "timeout must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Add a message unless one with the same id is already queued.
    /// Returns whether the message was added.
    pub fn add(&self, message: PushMessage) -> Result<bool, PushMessageError> {
        Self::validate(&message)?;
        let mut items = self.items.lock().expect("push message lock poisoned");
        if items.iter().any(|existing| existing.id == message.id) {
            return Ok(false);
        }
        items.push(message);
        Ok(true)
    }

    /// Replace the message with the same id, or add it if absent.
    pub fn update(&self, message: PushMessage) -> Result<(), PushMessageError> {
        Self::validate(&message)?;
        let mut items = self.items.lock().expect("push message lock poisoned");
        if let Some(existing) = items.iter_mut().find(|existing| existing.id == message.id) {
            *existing = message;
        } else {
            items.push(message);
        }
        Ok(())
    }

    /// Idempotent removal by id.
    pub fn remove_item(&self, id: &str) -> bool {
        let mut items = self.items.lock().expect("push message lock poisoned");
        let before = items.len();
        items.retain(|message| message.id != id);
        items.len() != before
    }

    pub fn read_all_items(&self) -> Vec<PushMessage> {
        self.items
            .lock()
            .expect("push message lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use remux_common::model::PushMessageType;

    fn message(id: &str) -> PushMessage {
        PushMessage {
            id: id.to_string(),
            message_type: PushMessageType::Status,
            code: id.to_string(),
            message: "".to_string(),
            timeout: 0,
        }
    }

    #[test]
    fn add_is_deduplicated_by_id() {
        let bus = FrontendPushMessages::new();
        assert!(bus.add(message("a")).unwrap());
        assert!(!bus.add(message("a")).unwrap());
        assert_eq!(bus.read_all_items().len(), 1);
    }

    #[test]
    fn update_replaces_in_place() {
        let bus = FrontendPushMessages::new();
        bus.update(message("a")).unwrap();
        let mut updated = message("a");
        updated.message = "changed".to_string();
        bus.update(updated).unwrap();
        bus.update(message("a").clone()).unwrap();

        let items = bus.read_all_items();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let bus = FrontendPushMessages::new();
        bus.add(message("a")).unwrap();
        assert!(bus.remove_item("a"));
        assert!(!bus.remove_item("a"));
    }

    #[test]
    fn read_does_not_drain() {
        let bus = FrontendPushMessages::new();
        bus.add(message("a")).unwrap();
        assert_eq!(bus.read_all_items().len(), 1);
        assert_eq!(bus.read_all_items().len(), 1);
    }

    #[test]
    fn empty_id_is_rejected() {
        let bus = FrontendPushMessages::new();
        assert!(bus.add(message("")).is_err());
    }
}
