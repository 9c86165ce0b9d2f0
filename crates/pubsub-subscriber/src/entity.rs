//! Subscribable entities and the presence-shadow naming convention.

/// Suffix the service uses to name the presence feed of a channel or group.
pub const PRESENCE_SUFFIX: &str = "-pnpres";

/// One subscribable feed.
///
/// Presence variants hold the *base* name; [`Entity::name`] renders the
/// suffixed wire name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Entity {
    Channel(String),
    ChannelGroup(String),
    PresenceChannel(String),
    PresenceChannelGroup(String),
}

impl Entity {
    /// Channel entity from a wire name; `-pnpres` names become presence channels.
    pub fn channel(name: impl Into<String>) -> Self {
        let name = name.into();
        match strip_presence(&name) {
            Some(base) => Entity::PresenceChannel(base.to_string()),
            None => Entity::Channel(name),
        }
    }

    /// Channel group entity from a wire name; `-pnpres` names become presence groups.
    pub fn group(name: impl Into<String>) -> Self {
        let name = name.into();
        match strip_presence(&name) {
            Some(base) => Entity::PresenceChannelGroup(base.to_string()),
            None => Entity::ChannelGroup(name),
        }
    }

    /// Name as sent on the wire.
    pub fn name(&self) -> String {
        match self {
            Entity::Channel(n) | Entity::ChannelGroup(n) => n.clone(),
            Entity::PresenceChannel(n) | Entity::PresenceChannelGroup(n) => {
                format!("{n}{PRESENCE_SUFFIX}")
            }
        }
    }

    /// Name without the presence suffix.
    pub fn base_name(&self) -> &str {
        match self {
            Entity::Channel(n)
            | Entity::ChannelGroup(n)
            | Entity::PresenceChannel(n)
            | Entity::PresenceChannelGroup(n) => n,
        }
    }

    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            Entity::PresenceChannel(_) | Entity::PresenceChannelGroup(_)
        )
    }

    pub fn is_group(&self) -> bool {
        matches!(
            self,
            Entity::ChannelGroup(_) | Entity::PresenceChannelGroup(_)
        )
    }

    /// The presence feed paired with a regular entity. `None` for presence entities.
    pub fn presence_shadow(&self) -> Option<Entity> {
        match self {
            Entity::Channel(n) => Some(Entity::PresenceChannel(n.clone())),
            Entity::ChannelGroup(n) => Some(Entity::PresenceChannelGroup(n.clone())),
            Entity::PresenceChannel(_) | Entity::PresenceChannelGroup(_) => None,
        }
    }
}

/// Returns the base name if `name` carries the presence suffix.
pub(crate) fn strip_presence(name: &str) -> Option<&str> {
    name.strip_suffix(PRESENCE_SUFFIX).filter(|base| !base.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_from_presence_name() {
        let e = Entity::channel("chat-pnpres");
        assert_eq!(e, Entity::PresenceChannel("chat".into()));
        assert_eq!(e.name(), "chat-pnpres");
        assert_eq!(e.base_name(), "chat");
        assert!(e.is_presence());
        assert!(!e.is_group());
    }

    #[test]
    fn presence_shadow_of_group() {
        let g = Entity::group("room");
        assert_eq!(
            g.presence_shadow(),
            Some(Entity::PresenceChannelGroup("room".into()))
        );
        assert_eq!(
            Entity::PresenceChannelGroup("room".into()).name(),
            "room-pnpres"
        );
        assert!(Entity::PresenceChannel("x".into()).presence_shadow().is_none());
    }

    #[test]
    fn bare_suffix_is_a_regular_channel() {
        assert_eq!(Entity::channel("-pnpres"), Entity::Channel("-pnpres".into()));
    }
}
