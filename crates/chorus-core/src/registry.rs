use std::collections::HashMap;

use chorus_proto::ParticipantId;

use crate::error::RegistryError;
use crate::session::NegotiationState;

/// Anything the registry can hold: it only needs to know whether the entry
/// still counts as active.
pub trait SessionEntry {
    fn state(&self) -> NegotiationState;
}

/// Participant id to session map. Owned by the coordinator actor, so no
/// locking; it is the single answer to "who are we connected to".
pub struct PeerRegistry<E> {
    sessions: HashMap<ParticipantId, E>,
}

impl<E> Default for PeerRegistry<E> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<E: SessionEntry> PeerRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` for `id`. Fails if a session for `id` is still open;
    /// a closed leftover is replaced and handed back to the caller.
    pub fn insert(&mut self, id: ParticipantId, entry: E) -> Result<Option<E>, RegistryError> {
        if self.is_active(&id) {
            return Err(RegistryError::DuplicateSession(id));
        }
        Ok(self.sessions.insert(id, entry))
    }

    pub fn lookup(&self, id: &ParticipantId) -> Result<&E, RegistryError> {
        self.sessions
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&E> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut E> {
        self.sessions.get_mut(id)
    }

    /// Idempotent: removing an unknown id is not an error.
    pub fn remove(&mut self, id: &ParticipantId) -> Option<E> {
        self.sessions.remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &E)> {
        self.sessions.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (ParticipantId, E)> + '_ {
        self.sessions.drain()
    }

    pub fn count_in(&self, state: NegotiationState) -> usize {
        self.sessions
            .values()
            .filter(|entry| entry.state() == state)
            .count()
    }

    pub fn is_active(&self, id: &ParticipantId) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|entry| !entry.state().is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Entry(NegotiationState);

    impl SessionEntry for Entry {
        fn state(&self) -> NegotiationState {
            self.0
        }
    }

    fn id(value: &str) -> ParticipantId {
        ParticipantId::from(value)
    }

    #[test]
    fn rejects_second_open_session() {
        let mut registry = PeerRegistry::new();
        registry
            .insert(id("bob"), Entry(NegotiationState::OfferSent))
            .unwrap();

        let err = registry
            .insert(id("bob"), Entry(NegotiationState::Idle))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateSession(id("bob")));
        assert_eq!(
            registry.lookup(&id("bob")).unwrap(),
            &Entry(NegotiationState::OfferSent)
        );
    }

    #[test]
    fn closed_session_can_be_replaced() {
        let mut registry = PeerRegistry::new();
        registry
            .insert(id("bob"), Entry(NegotiationState::Closed))
            .unwrap();

        let previous = registry
            .insert(id("bob"), Entry(NegotiationState::Idle))
            .unwrap();
        assert_eq!(previous, Some(Entry(NegotiationState::Closed)));
        assert!(registry.is_active(&id("bob")));
    }

    #[test]
    fn lookup_of_unknown_participant_is_not_found() {
        let registry: PeerRegistry<Entry> = PeerRegistry::new();
        assert_eq!(
            registry.lookup(&id("carol")).unwrap_err(),
            RegistryError::NotFound(id("carol"))
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = PeerRegistry::new();
        registry
            .insert(id("bob"), Entry(NegotiationState::Connected))
            .unwrap();

        assert!(registry.remove(&id("bob")).is_some());
        assert!(registry.remove(&id("bob")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn counts_sessions_by_state() {
        let mut registry = PeerRegistry::new();
        registry
            .insert(id("a"), Entry(NegotiationState::Connected))
            .unwrap();
        registry
            .insert(id("b"), Entry(NegotiationState::Connected))
            .unwrap();
        registry
            .insert(id("c"), Entry(NegotiationState::AnswerSent))
            .unwrap();

        assert_eq!(registry.count_in(NegotiationState::Connected), 2);
        assert_eq!(registry.len(), 3);
    }
}
