//! Pending interactive permission prompts (spec.md §4.5 "permission.updated/replied").

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PendingPermission {
    pub session_id: String,
    pub permission_id: String,
    pub chat_id: i64,
    pub topic_id: i64,
    pub message_id: i32,
    pub kind: String,
    pub title: String,
}

#[derive(Default)]
pub struct PendingPermissions {
    by_id: HashMap<String, PendingPermission>,
}

impl PendingPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pending: PendingPermission) {
        self.by_id.insert(pending.permission_id.clone(), pending);
    }

    pub fn take(&mut self, permission_id: &str) -> Option<PendingPermission> {
        self.by_id.remove(permission_id)
    }

    pub fn get(&self, permission_id: &str) -> Option<&PendingPermission> {
        self.by_id.get(permission_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_take_removes_entry() {
        let mut pending = PendingPermissions::new();
        pending.insert(PendingPermission {
            session_id: "s1".into(),
            permission_id: "p1".into(),
            chat_id: 1,
            topic_id: 2,
            message_id: 3,
            kind: "bash".into(),
            title: "rm -rf".into(),
        });
        assert!(pending.get("p1").is_some());
        let taken = pending.take("p1").unwrap();
        assert_eq!(taken.session_id, "s1");
        assert!(pending.get("p1").is_none());
    }
}
