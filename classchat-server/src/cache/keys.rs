use shared::models::GroupType;

/// Identity parsed back out of a seen-by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenKey {
    pub message_id: i64,
    pub target_id: i64,
    pub group_type: GroupType,
}

/// Key layout for the cache tier, namespaced by a configurable prefix.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn unread(&self, user_id: i64, target_id: i64, group_type: GroupType) -> String {
        format!(
            "{}:unread:{user_id}:{}:{target_id}",
            self.prefix,
            group_type.as_str()
        )
    }

    pub fn last_read(&self, user_id: i64, target_id: i64, group_type: GroupType) -> String {
        format!(
            "{}:lastread:{user_id}:{}:{target_id}",
            self.prefix,
            group_type.as_str()
        )
    }

    pub fn seen(&self, message_id: i64, target_id: i64, group_type: GroupType) -> String {
        format!(
            "{}:seen:{message_id}:{target_id}:{}",
            self.prefix,
            group_type.as_str()
        )
    }

    /// Scan pattern matching every seen-by key.
    pub fn seen_pattern(&self) -> String {
        format!("{}:seen:*", self.prefix)
    }

    pub fn parse_seen(&self, key: &str) -> Option<SeenKey> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix(":seen:")?;
        let mut parts = rest.split(':');
        let message_id = parts.next()?.parse().ok()?;
        let target_id = parts.next()?.parse().ok()?;
        let group_type = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(SeenKey {
            message_id,
            target_id,
            group_type,
        })
    }
}
