use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use super::{CacheBackend, CacheError};

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Set(BTreeSet<i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

/// Cursors not resumed within this window are forgotten, like an abandoned Redis SCAN.
const CURSOR_IDLE: Duration = Duration::from_secs(60);
const MAX_OPEN_CURSORS: usize = 1024;

#[derive(Debug, Clone)]
struct Cursor {
    /// Last key returned by the page that issued this cursor.
    after: String,
    issued_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    cursors: HashMap<u64, Cursor>,
    next_cursor: u64,
}

impl State {
    fn open_cursor(&mut self, after: String, now: Instant, limit: usize) -> u64 {
        while self.cursors.len() >= limit.max(1) {
            let oldest = self
                .cursors
                .iter()
                .min_by_key(|(id, cursor)| (cursor.issued_at, **id))
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => self.cursors.remove(&id),
                None => break,
            };
        }
        self.next_cursor += 1;
        self.cursors.insert(
            self.next_cursor,
            Cursor {
                after,
                issued_at: now,
            },
        );
        self.next_cursor
    }
}

/// In-process cache backend with the same per-key semantics as the Redis backend.
///
/// Keys live in an ordered map and scan cursors resume after the last returned key, so
/// keys deleted mid-scan never cause surviving keys to be skipped. Open cursors are
/// bounded in number and age.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
    cursor_idle: Duration,
    max_cursors: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_cursor_limits(CURSOR_IDLE, MAX_OPEN_CURSORS)
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_cursor_limits(cursor_idle: Duration, max_cursors: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            cursor_idle,
            max_cursors,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T, CacheError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache lock poisoned".into()))?;
        let now = Instant::now();
        guard.entries.retain(|_, entry| entry.expires_at > now);
        let idle = self.cursor_idle;
        guard
            .cursors
            .retain(|_, cursor| now.saturating_duration_since(cursor.issued_at) < idle);
        Ok(f(&mut guard))
    }

    #[cfg(test)]
    fn open_cursors(&self) -> usize {
        self.with_state(|state| state.cursors.len()).unwrap_or_default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Entry>) -> T,
    ) -> Result<T, CacheError> {
        self.with_state(|state| f(&mut state.entries))
    }
}

fn entry(value: Value, ttl: Duration) -> Entry {
    Entry {
        value,
        expires_at: Instant::now() + ttl,
    }
}

fn counter_of(entry: Option<&Entry>) -> i64 {
    match entry.map(|entry| &entry.value) {
        Some(Value::Counter(value)) => *value,
        _ => 0,
    }
}

/// Glob matcher supporting `*` wildcards, which is all the scan patterns use.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return candidate.is_empty();
    };
    let Some(mut rest) = candidate.strip_prefix(first) else {
        return false;
    };

    let segments: Vec<&str> = parts.collect();
    let Some((last, middle)) = segments.split_last() else {
        return rest.is_empty();
    };

    for segment in middle {
        match rest.find(segment) {
            Some(index) => rest = &rest[index + segment.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        self.with_entries(|entries| {
            let next = counter_of(entries.get(key)) + 1;
            entries.insert(key.to_string(), entry(Value::Counter(next), ttl));
            next
        })
    }

    async fn decr_or_delete(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        self.with_entries(|entries| {
            let Some(existing) = entries.get_mut(key) else {
                return 0;
            };
            match &mut existing.value {
                Value::Counter(value) if *value > by => {
                    *value -= by;
                    *value
                }
                _ => {
                    entries.remove(key);
                    0
                }
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, CacheError> {
        self.with_entries(|entries| match entries.get(key).map(|entry| &entry.value) {
            Some(Value::Counter(value)) => Some(*value),
            _ => None,
        })
    }

    async fn set_if_greater(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<Option<i64>, CacheError> {
        self.with_entries(|entries| {
            let previous = counter_of(entries.get(key));
            if value > previous {
                entries.insert(key.to_string(), entry(Value::Counter(value), ttl));
                Some(previous)
            } else {
                None
            }
        })
    }

    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            if value <= 0 {
                entries.remove(key);
            } else {
                entries.insert(key.to_string(), entry(Value::Counter(value), ttl));
            }
        })
    }

    async fn set_add(&self, key: &str, member: i64, ttl: Duration) -> Result<bool, CacheError> {
        self.with_entries(|entries| {
            let slot = entries
                .entry(key.to_string())
                .or_insert_with(|| entry(Value::Set(BTreeSet::new()), ttl));
            slot.expires_at = Instant::now() + ttl;
            if let Value::Set(members) = &mut slot.value {
                members.insert(member)
            } else {
                let mut members = BTreeSet::new();
                members.insert(member);
                slot.value = Value::Set(members);
                true
            }
        })
    }

    async fn set_members(&self, key: &str) -> Result<Vec<i64>, CacheError> {
        self.with_entries(|entries| match entries.get(key).map(|entry| &entry.value) {
            Some(Value::Set(members)) => members.iter().copied().collect(),
            _ => Vec::new(),
        })
    }

    async fn set_card(&self, key: &str) -> Result<u64, CacheError> {
        self.with_entries(|entries| match entries.get(key).map(|entry| &entry.value) {
            Some(Value::Set(members)) => members.len() as u64,
            _ => 0,
        })
    }

    async fn set_remove(&self, key: &str, members: &[i64]) -> Result<u64, CacheError> {
        self.with_entries(|entries| {
            let Some(Entry {
                value: Value::Set(existing),
                ..
            }) = entries.get_mut(key)
            else {
                return 0;
            };
            let removed = members
                .iter()
                .filter(|member| existing.remove(member))
                .count() as u64;
            if existing.is_empty() {
                entries.remove(key);
            }
            removed
        })
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        self.with_state(|state| {
            let resume_after = if cursor == 0 {
                None
            } else {
                match state.cursors.remove(&cursor) {
                    Some(open) => Some(open.after),
                    None => return (0, Vec::new()),
                }
            };

            let lower = resume_after
                .as_ref()
                .map_or(Bound::Unbounded, |key| Bound::Excluded(key.clone()));
            let window: Vec<String> = state
                .entries
                .range((lower, Bound::Unbounded))
                .take(count.max(1))
                .map(|(key, _)| key.clone())
                .collect();

            let next_cursor = match window.last() {
                Some(last)
                    if state
                        .entries
                        .range((Bound::Excluded(last.clone()), Bound::Unbounded))
                        .next()
                        .is_some() =>
                {
                    state.open_cursor(last.clone(), Instant::now(), self.max_cursors)
                }
                _ => 0,
            };

            let matched = window
                .into_iter()
                .filter(|key| glob_match(pattern, key))
                .collect();
            (next_cursor, matched)
        })
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.with_entries(|_| ())
    }
}
