use std::collections::HashMap;

use duet_proto::{Message, PlayerInfo, Role};
use tracing::{debug, info, warn};

/// What a received identity record changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceUpdate {
    /// First identity seen from the partner since start or since they left.
    pub first_arrival: bool,
    pub peer_changed: bool,
}

/// Identity cache for the two seats of a session.
#[derive(Debug)]
pub struct Presence {
    local: PlayerInfo,
    seen: HashMap<Role, PlayerInfo>,
}

impl Presence {
    pub fn new(local: PlayerInfo) -> Self {
        Self {
            local,
            seen: HashMap::new(),
        }
    }

    pub fn local(&self) -> &PlayerInfo {
        &self.local
    }

    pub fn info_message(&self) -> Message {
        Message::PlayerInfo(self.local.clone())
    }

    /// Sent after every (re)connect: who we are, then who is there.
    pub fn announce(&self) -> [Message; 2] {
        [self.info_message(), Message::RequestPlayerInfo {}]
    }

    pub fn record(&mut self, info: PlayerInfo) -> PresenceUpdate {
        if info.role == self.local.role {
            warn!(
                target = "duet::presence",
                role = %info.role,
                peer_id = %info.peer_id,
                "identity claims our own role; ignoring"
            );
            return PresenceUpdate {
                first_arrival: false,
                peer_changed: false,
            };
        }
        let previous = self.seen.insert(info.role, info.clone());
        let update = PresenceUpdate {
            first_arrival: previous.is_none(),
            peer_changed: previous.as_ref().map(|p| p.peer_id.as_str()) != Some(info.peer_id.as_str()),
        };
        if update.first_arrival {
            info!(
                target = "duet::presence",
                role = %info.role,
                name = %info.name,
                peer_id = %info.peer_id,
                "partner identified"
            );
        } else if update.peer_changed {
            debug!(target = "duet::presence", peer_id = %info.peer_id, "partner call identity changed");
        }
        update
    }

    pub fn partner(&self) -> Option<&PlayerInfo> {
        self.seen.get(&self.local.role.other())
    }

    pub fn partner_peer_id(&self) -> Option<&str> {
        self.partner().map(|info| info.peer_id.as_str())
    }

    pub fn forget_partner(&mut self) -> Option<PlayerInfo> {
        self.seen.remove(&self.local.role.other())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(role: Role, name: &str, peer: &str) -> PlayerInfo {
        PlayerInfo {
            name: name.into(),
            role,
            peer_id: peer.into(),
        }
    }

    #[test]
    fn announce_sends_identity_then_request() {
        let presence = Presence::new(info(Role::Host, "Alex", "duet-abcd-aaaaaa"));
        let [first, second] = presence.announce();
        assert!(matches!(first, Message::PlayerInfo(ref p) if p.name == "Alex"));
        assert_eq!(second, Message::RequestPlayerInfo {});
    }

    #[test]
    fn records_partner_once_and_tracks_peer_changes() {
        let mut presence = Presence::new(info(Role::Host, "Alex", "h"));
        let first = presence.record(info(Role::Guest, "Sam", "g1"));
        assert!(first.first_arrival);
        assert_eq!(presence.partner_peer_id(), Some("g1"));

        let repeat = presence.record(info(Role::Guest, "Sam", "g1"));
        assert!(!repeat.first_arrival);
        assert!(!repeat.peer_changed);

        let moved = presence.record(info(Role::Guest, "Sam", "g2"));
        assert!(moved.peer_changed);
        assert_eq!(presence.partner_peer_id(), Some("g2"));
    }

    #[test]
    fn ignores_identity_for_own_role() {
        let mut presence = Presence::new(info(Role::Guest, "Sam", "g"));
        let update = presence.record(info(Role::Guest, "Impostor", "x"));
        assert!(!update.first_arrival);
        assert!(presence.partner().is_none());
    }

    #[test]
    fn forgetting_partner_allows_a_new_arrival() {
        let mut presence = Presence::new(info(Role::Guest, "Sam", "g"));
        presence.record(info(Role::Host, "Alex", "h"));
        assert!(presence.forget_partner().is_some());
        assert!(presence.partner_peer_id().is_none());
        assert!(presence.record(info(Role::Host, "Alex", "h2")).first_arrival);
    }
}
