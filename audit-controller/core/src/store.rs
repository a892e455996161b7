use crate::event::{ChangeEvent, Operation};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Persists change events.
///
/// The pipeline only depends on this contract, so any persistence engine may
/// back it.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn save(&self, event: &ChangeEvent) -> Result<()>;

    /// Returns the matching events, newest first.
    async fn query(&self, filter: &EventFilter) -> Result<Vec<ChangeEvent>>;

    async fn close(&self) -> Result<()>;
}

/// Selects stored events. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub operation: Option<Operation>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Keeps the most recent events in memory.
#[derive(Debug)]
pub struct MemoryStore {
    limit: usize,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    events: VecDeque<ChangeEvent>,
    closed: bool,
}

// === impl EventFilter ===

impl EventFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        fn eq(want: &Option<String>, got: &str) -> bool {
            want.as_deref().map_or(true, |w| w == got)
        }

        eq(&self.namespace, &event.namespace)
            && eq(&self.name, &event.name)
            && eq(&self.kind, &event.resource_kind)
            && self.operation.map_or(true, |op| op == event.operation)
            && self.since.map_or(true, |since| event.timestamp >= since)
    }

    /// Applies the filter to events ordered oldest first.
    pub fn select<'e>(
        &self,
        events: impl DoubleEndedIterator<Item = &'e ChangeEvent>,
    ) -> Vec<ChangeEvent> {
        events
            .rev()
            .filter(|ev| self.matches(ev))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

// === impl MemoryStore ===

impl MemoryStore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(State::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the stored events, oldest first.
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.state.lock().events.iter().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn save(&self, event: &ChangeEvent) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            bail!("store is closed");
        }
        if self.limit == 0 {
            return Ok(());
        }
        while state.events.len() >= self.limit {
            state.events.pop_front();
        }
        state.events.push_back(event.clone());
        Ok(())
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<ChangeEvent>> {
        let state = self.state.lock();
        Ok(filter.select(state.events.iter()))
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Actor, Decision, Mutation};

    fn mk(ns: &str, name: &str, op: Operation) -> ChangeEvent {
        ChangeEvent::new(
            Mutation {
                timestamp: None,
                kind: "Pod".to_string(),
                namespace: ns.to_string(),
                name: name.to_string(),
                operation: op,
                actor: Actor::default(),
                old_object: None,
                new_object: None,
                source_ip: None,
                user_agent: None,
            },
            Decision::Allowed,
        )
    }

    #[tokio::test]
    async fn evicts_oldest() {
        let store = MemoryStore::new(2);
        for name in ["a", "b", "c"] {
            store.save(&mk("ns", name, Operation::Create)).await.unwrap();
        }
        let names = store
            .events()
            .into_iter()
            .map(|ev| ev.name)
            .collect::<Vec<_>>();
        assert_eq!(names, ["b", "c"]);
    }

    #[tokio::test]
    async fn queries_newest_first() {
        let store = MemoryStore::default();
        store.save(&mk("a", "one", Operation::Create)).await.unwrap();
        store.save(&mk("b", "two", Operation::Update)).await.unwrap();
        store.save(&mk("a", "three", Operation::Delete)).await.unwrap();

        let all = store.query(&EventFilter::default()).await.unwrap();
        assert_eq!(
            all.iter().map(|ev| ev.name.as_str()).collect::<Vec<_>>(),
            ["three", "two", "one"]
        );

        let ns_a = store
            .query(&EventFilter {
                namespace: Some("a".to_string()),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ns_a.len(), 1);
        assert_eq!(ns_a[0].name, "three");

        let updates = store
            .query(&EventFilter {
                operation: Some(Operation::Update),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].namespace, "b");
    }

    #[tokio::test]
    async fn rejects_saves_after_close() {
        let store = MemoryStore::default();
        store.close().await.unwrap();
        assert!(store.save(&mk("a", "b", Operation::Create)).await.is_err());
    }
}
