//! Chat roster tracking.
//!
//! The provider's participant list only covers current members. Authors that
//! show up in history but not in the list are recorded as former members.

use crate::model::{Membership, Participant, RawParticipant, user_part};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Roster {
    members: HashMap<String, Participant>,
}

impl Roster {
    /// Start from a persisted roster.
    #[must_use]
    pub fn from_participants(participants: Vec<Participant>) -> Self {
        Self {
            members: participants
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect(),
        }
    }

    /// Merge the provider's current roster over the known one. Anyone
    /// previously current who is missing from `current` becomes former.
    pub fn merge_current(&mut self, current: &[RawParticipant]) {
        for participant in self.members.values_mut() {
            participant.membership = Membership::Former;
        }
        for raw in current.iter().filter(|raw| !raw.id.is_empty()) {
            let phone_number = raw
                .number
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| user_part(&raw.id).to_string());
            let entry = Participant {
                id: raw.id.clone(),
                display_name: raw.name.clone().filter(|n| !n.is_empty()),
                phone_number,
                is_admin: raw.is_admin || raw.is_super_admin,
                is_super_admin: raw.is_super_admin,
                membership: Membership::Current,
            };
            self.members.insert(entry.id.clone(), entry);
        }
    }

    /// Record a message author. Returns `true` if the author was unknown and
    /// has been added as a former member.
    pub fn observe_author(&mut self, author_id: &str) -> bool {
        if author_id.is_empty() || self.get(author_id).is_some() {
            return false;
        }
        debug!(author_id, "Recording unknown author as former member");
        self.members.insert(
            author_id.to_string(),
            Participant {
                id: author_id.to_string(),
                display_name: None,
                phone_number: user_part(author_id).to_string(),
                is_admin: false,
                is_super_admin: false,
                membership: Membership::Former,
            },
        );
        true
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.members.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of members with the given status.
    #[must_use]
    pub fn count(&self, membership: Membership) -> usize {
        self.members
            .values()
            .filter(|p| p.membership == membership)
            .count()
    }

    /// All members, sorted by id.
    #[must_use]
    pub fn participants(&self) -> Vec<Participant> {
        let mut all: Vec<Participant> = self.members.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}
