//! Internally synchronised set of subscribed entities and their presence state.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde_json::Value;

use crate::entity::Entity;

/// Point-in-time copy of a [`SubscriptionSet`].
///
/// Names are wire names (presence entries carry the `-pnpres` suffix) and
/// are sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionSnapshot {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub presence_channels: Vec<String>,
    pub presence_groups: Vec<String>,
    /// Presence state keyed by channel or group name.
    pub state: BTreeMap<String, Value>,
}

impl SubscriptionSnapshot {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
            && self.groups.is_empty()
            && self.presence_channels.is_empty()
            && self.presence_groups.is_empty()
    }

    /// Regular and presence channels, as listed in a subscribe request.
    pub fn subscribe_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .chain(&self.presence_channels)
            .cloned()
            .collect()
    }

    /// Regular and presence groups, as listed in a subscribe request.
    pub fn subscribe_groups(&self) -> Vec<String> {
        self.groups
            .iter()
            .chain(&self.presence_groups)
            .cloned()
            .collect()
    }
}

/// The entities the client wants live events for.
///
/// Every operation takes the lock once, so a concurrent [`snapshot`]
/// observes a mutation either completely or not at all.
///
/// [`snapshot`]: SubscriptionSet::snapshot
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    entries: RwLock<BTreeMap<Entity, Option<Value>>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `entities`, returning the ones that were not yet members.
    ///
    /// `Some(state)` replaces the state of every regular entity in the batch,
    /// members included. `None` leaves existing state untouched.
    pub fn add<I>(&self, entities: I, state: Option<&Value>) -> Vec<Entity>
    where
        I: IntoIterator<Item = Entity>,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = Vec::new();
        for entity in entities {
            let entity_state = if entity.is_presence() {
                None
            } else {
                state.cloned()
            };
            match entries.get_mut(&entity) {
                Some(existing) => {
                    if entity_state.is_some() {
                        *existing = entity_state;
                    }
                }
                None => {
                    entries.insert(entity.clone(), entity_state);
                    added.push(entity);
                }
            }
        }
        added
    }

    /// Removes `entities`, returning the ones that were members.
    pub fn remove<'a, I>(&self, entities: I) -> Vec<Entity>
    where
        I: IntoIterator<Item = &'a Entity>,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entities
            .into_iter()
            .filter(|e| entries.remove(*e).is_some())
            .cloned()
            .collect()
    }

    /// Empties the set, returning everything that was in it.
    pub fn clear(&self) -> Vec<Entity> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *entries).into_keys().collect()
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(entity)
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut snap = SubscriptionSnapshot::default();
        for (entity, state) in entries.iter() {
            let name = entity.name();
            if let Some(state) = state {
                snap.state.insert(name.clone(), state.clone());
            }
            match entity {
                Entity::Channel(_) => snap.channels.push(name),
                Entity::ChannelGroup(_) => snap.groups.push(name),
                Entity::PresenceChannel(_) => snap.presence_channels.push(name),
                Entity::PresenceChannelGroup(_) => snap.presence_groups.push(name),
            }
        }
        snap
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn ch(name: &str) -> Entity {
        Entity::channel(name)
    }

    #[test]
    fn add_is_idempotent() {
        let set = SubscriptionSet::new();
        assert_eq!(set.add([ch("a")], None), vec![ch("a")]);
        assert!(set.add([ch("a")], None).is_empty());
        assert_eq!(set.snapshot().channels, vec!["a"]);
    }

    #[test]
    fn re_adding_updates_state() {
        let set = SubscriptionSet::new();
        set.add([ch("a")], Some(&json!({"mood": "calm"})));
        set.add([ch("a")], Some(&json!({"mood": "busy"})));
        set.add([ch("a")], None);
        let snap = set.snapshot();
        assert_eq!(snap.state.get("a"), Some(&json!({"mood": "busy"})));
        assert_eq!(snap.channels.len(), 1);
    }

    #[test]
    fn presence_entities_carry_no_state() {
        let set = SubscriptionSet::new();
        set.add([ch("a"), ch("a-pnpres")], Some(&json!({"k": 1})));
        let snap = set.snapshot();
        assert_eq!(snap.presence_channels, vec!["a-pnpres"]);
        assert!(!snap.state.contains_key("a-pnpres"));
        assert_eq!(snap.subscribe_channels(), vec!["a", "a-pnpres"]);
    }

    #[test]
    fn remove_non_member_is_noop() {
        let set = SubscriptionSet::new();
        set.add([ch("a")], None);
        assert!(set.remove(&[ch("zzz")]).is_empty());
        assert_eq!(set.remove(&[ch("a")]), vec![ch("a")]);
        assert!(set.is_empty());
    }

    #[test]
    fn snapshot_splits_kinds() {
        let set = SubscriptionSet::new();
        set.add(
            [
                Entity::group("g"),
                Entity::group("g-pnpres"),
                ch("c"),
            ],
            None,
        );
        let snap = set.snapshot();
        assert_eq!(snap.channels, vec!["c"]);
        assert_eq!(snap.groups, vec!["g"]);
        assert_eq!(snap.presence_groups, vec!["g-pnpres"]);
        assert_eq!(snap.subscribe_groups(), vec!["g", "g-pnpres"]);
        assert!(set.contains(&Entity::group("g")));
    }

    #[test]
    fn clear_returns_everything() {
        let set = SubscriptionSet::new();
        set.add([ch("a"), Entity::group("g")], None);
        let cleared = set.clear();
        assert_eq!(cleared.len(), 2);
        assert!(set.snapshot().is_empty());
    }

    #[test]
    fn concurrent_snapshots_never_tear() {
        let set = Arc::new(SubscriptionSet::new());
        let writer = {
            let set = Arc::clone(&set);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    set.add([ch("x"), Entity::group("y")], None);
                    set.remove(&[ch("x"), Entity::group("y")]);
                }
            })
        };
        for _ in 0..500 {
            let snap = set.snapshot();
            assert_eq!(snap.channels.len(), snap.groups.len());
        }
        writer.join().unwrap();
    }
}
