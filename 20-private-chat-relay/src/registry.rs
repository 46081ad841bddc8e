//! Live mapping from display name to session.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{
    error::RelayError,
    session::{SessionHandle, SessionId},
};

struct Entry {
    name: String,
    session: SessionHandle,
}

/// Name -> session map shared by every connection task.
///
/// Entries are kept in login order so the roster reads the way people joined.
/// All operations take the same lock, which is what makes two concurrent
/// registrations of one name resolve to exactly one winner.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        // Critical sections never panic midway, so a poisoned lock still
        // holds a consistent vector.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `name` for `session`.
    ///
    /// Entries whose connection has already closed are purged first, so a
    /// name frees up as soon as its transport is gone.
    pub fn register(&self, name: &str, session: SessionHandle) -> Result<(), RelayError> {
        let mut entries = self.entries();
        purge_closed(&mut entries);

        if entries.iter().any(|entry| entry.name == name) {
            return Err(RelayError::NameConflict {
                name: name.to_string(),
            });
        }

        entries.push(Entry {
            name: name.to_string(),
            session,
        });
        Ok(())
    }

    /// Releases `name` if `session` still holds it. Returns whether an entry
    /// was removed; calling it again is a no-op.
    ///
    /// Matching on the session keeps a late cleanup from evicting someone who
    /// reclaimed the name after the old entry was purged.
    pub fn unregister(&self, name: &str, session: SessionId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|entry| !(entry.name == name && entry.session.id() == session));
        entries.len() != before
    }

    /// Open session currently holding `name`.
    pub fn lookup(&self, name: &str) -> Option<SessionHandle> {
        self.entries()
            .iter()
            .find(|entry| entry.name == name && entry.session.is_open())
            .map(|entry| entry.session.clone())
    }

    /// Live names in login order.
    pub fn snapshot(&self) -> Vec<String> {
        let mut entries = self.entries();
        purge_closed(&mut entries);
        entries.iter().map(|entry| entry.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.session.is_open())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn purge_closed(entries: &mut Vec<Entry>) {
    entries.retain(|entry| entry.session.is_open());
}
