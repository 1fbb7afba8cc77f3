#![forbid(unsafe_code)]

// Room moderator policy: per-capability restrictions a presenter can toggle.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeratorPolicyKind {
    AudioCantUnmute,
    VideoCantUnhide,
    ScreenCantShare,
    ChatCantPrivately,
}

/// Per-capability restrictions applied to non-presenter peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModeratorPolicy {
    pub audio_cant_unmute: bool,
    pub video_cant_unhide: bool,
    pub screen_cant_share: bool,
    pub chat_cant_privately: bool,
}

impl ModeratorPolicy {
    pub fn set(&mut self, kind: ModeratorPolicyKind, status: bool) {
        match kind {
            ModeratorPolicyKind::AudioCantUnmute => self.audio_cant_unmute = status,
            ModeratorPolicyKind::VideoCantUnhide => self.video_cant_unhide = status,
            ModeratorPolicyKind::ScreenCantShare => self.screen_cant_share = status,
            ModeratorPolicyKind::ChatCantPrivately => self.chat_cant_privately = status,
        }
    }

    pub fn get(&self, kind: ModeratorPolicyKind) -> bool {
        match kind {
            ModeratorPolicyKind::AudioCantUnmute => self.audio_cant_unmute,
            ModeratorPolicyKind::VideoCantUnhide => self.video_cant_unhide,
            ModeratorPolicyKind::ScreenCantShare => self.screen_cant_share,
            ModeratorPolicyKind::ChatCantPrivately => self.chat_cant_privately,
        }
    }

    /// Replaces every capability restriction at once.
    pub fn set_all(&mut self, policy: ModeratorPolicy) {
        *self = policy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_each_kind() {
        let mut policy = ModeratorPolicy::default();
        for kind in [
            ModeratorPolicyKind::AudioCantUnmute,
            ModeratorPolicyKind::VideoCantUnhide,
            ModeratorPolicyKind::ScreenCantShare,
            ModeratorPolicyKind::ChatCantPrivately,
        ] {
            assert!(!policy.get(kind));
            policy.set(kind, true);
            assert!(policy.get(kind));
        }
    }

    #[test]
    fn set_all_replaces_policy() {
        let mut policy = ModeratorPolicy::default();
        policy.set(ModeratorPolicyKind::AudioCantUnmute, true);

        policy.set_all(ModeratorPolicy {
            screen_cant_share: true,
            ..Default::default()
        });

        assert!(!policy.audio_cant_unmute);
        assert!(policy.screen_cant_share);
    }

    #[test]
    fn kinds_deserialize_from_wire_names() {
        let kind: ModeratorPolicyKind = serde_json::from_str(r#""audio_cant_unmute""#).unwrap();
        assert_eq!(kind, ModeratorPolicyKind::AudioCantUnmute);
    }
}
