//! In-process signaling relay
//!
//! Plays the server side of the signaling protocol for any number of local
//! users. Every message is encoded to its JSON envelope on send and decoded on
//! receive, so the wire format is exercised the same way a socket would.

use crate::identity::{ParticipantInfo, UserId};
use crate::signaling::{SignalingError, SignalingMessage, SignalingTransport};
use crate::types::{CallId, ChannelId, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug)]
struct Member {
    info: ParticipantInfo,
    outbox: mpsc::UnboundedSender<String>,
}

#[derive(Debug, Clone)]
struct DirectCall {
    caller: UserId,
    callee: UserId,
}

#[derive(Debug)]
struct Room {
    call_id: CallId,
    media_kind: MediaKind,
    members: Vec<UserId>,
}

#[derive(Debug, Default)]
struct RelayState {
    members: HashMap<UserId, Member>,
    calls: HashMap<CallId, DirectCall>,
    rooms: HashMap<ChannelId, Room>,
    history: Vec<(UserId, SignalingMessage)>,
}

impl RelayState {
    fn deliver(&self, to: &UserId, message: SignalingMessage) {
        let Some(member) = self.members.get(to) else {
            tracing::debug!(to = %to, message_type = message.message_type(), "Relay dropping message for absent user");
            return;
        };
        match message.to_json() {
            Ok(json) => {
                let _ = member.outbox.send(json);
            }
            Err(e) => tracing::warn!(error = %e, "Relay failed to encode message"),
        }
    }

    fn info(&self, user: &UserId) -> ParticipantInfo {
        self.members
            .get(user)
            .map(|m| m.info.clone())
            .unwrap_or_else(|| ParticipantInfo::anonymous(user.clone()))
    }

    fn counterpart(&self, call_id: &CallId, sender: &UserId) -> Option<UserId> {
        let call = self.calls.get(call_id)?;
        if &call.caller == sender {
            Some(call.callee.clone())
        } else if &call.callee == sender {
            Some(call.caller.clone())
        } else {
            None
        }
    }

    fn leave_room(&mut self, channel_id: &ChannelId, user: &UserId) {
        let Some(room) = self.rooms.get_mut(channel_id) else {
            return;
        };
        let before = room.members.len();
        room.members.retain(|m| m != user);
        if room.members.len() == before {
            return;
        }
        let call_id = room.call_id;
        let remaining = room.members.clone();
        if remaining.is_empty() {
            self.rooms.remove(channel_id);
            tracing::info!(channel = %channel_id, call_id = %call_id, "Relay closed empty group call");
            return;
        }
        for member in &remaining {
            self.deliver(
                member,
                SignalingMessage::GroupPeerLeft {
                    channel_id: channel_id.clone(),
                    call_id,
                    user_id: user.clone(),
                },
            );
        }
    }

    fn route(&mut self, from: &UserId, message: SignalingMessage) {
        self.history.push((from.clone(), message.clone()));
        match message {
            SignalingMessage::CallInitiate {
                call_id,
                receiver_id,
                media_kind,
            } => {
                if !self.members.contains_key(&receiver_id) {
                    self.deliver(
                        from,
                        SignalingMessage::CallDeclined {
                            call_id,
                            callee: receiver_id,
                        },
                    );
                    return;
                }
                self.calls.insert(
                    call_id,
                    DirectCall {
                        caller: from.clone(),
                        callee: receiver_id.clone(),
                    },
                );
                let caller = self.info(from);
                self.deliver(
                    &receiver_id,
                    SignalingMessage::CallIncoming {
                        call_id,
                        caller,
                        media_kind,
                    },
                );
            }
            SignalingMessage::CallAccept { call_id } => {
                if let Some(to) = self.counterpart(&call_id, from) {
                    let callee = self.info(from);
                    self.deliver(&to, SignalingMessage::CallAccepted { call_id, callee });
                }
            }
            SignalingMessage::CallDecline { call_id } => {
                if let Some(to) = self.counterpart(&call_id, from) {
                    self.calls.remove(&call_id);
                    self.deliver(
                        &to,
                        SignalingMessage::CallDeclined {
                            call_id,
                            callee: from.clone(),
                        },
                    );
                }
            }
            SignalingMessage::CallBusy { call_id } => {
                if let Some(to) = self.counterpart(&call_id, from) {
                    self.calls.remove(&call_id);
                    self.deliver(
                        &to,
                        SignalingMessage::CallPeerBusy {
                            call_id,
                            callee: from.clone(),
                        },
                    );
                }
            }
            SignalingMessage::CallCancel { call_id } => {
                if let Some(to) = self.counterpart(&call_id, from) {
                    self.calls.remove(&call_id);
                    self.deliver(
                        &to,
                        SignalingMessage::CallCancelled {
                            call_id,
                            caller: from.clone(),
                        },
                    );
                }
            }
            SignalingMessage::CallEnd {
                call_id,
                duration_secs,
            } => {
                if let Some(to) = self.counterpart(&call_id, from) {
                    self.calls.remove(&call_id);
                    self.deliver(
                        &to,
                        SignalingMessage::CallEnded {
                            call_id,
                            peer: from.clone(),
                            duration_secs,
                        },
                    );
                }
            }
            SignalingMessage::Offer {
                peer_id,
                call_id,
                sdp,
            } => self.deliver(
                &peer_id,
                SignalingMessage::Offer {
                    peer_id: from.clone(),
                    call_id,
                    sdp,
                },
            ),
            SignalingMessage::Answer {
                peer_id,
                call_id,
                sdp,
            } => self.deliver(
                &peer_id,
                SignalingMessage::Answer {
                    peer_id: from.clone(),
                    call_id,
                    sdp,
                },
            ),
            SignalingMessage::IceCandidate {
                peer_id,
                call_id,
                candidate,
            } => self.deliver(
                &peer_id,
                SignalingMessage::IceCandidate {
                    peer_id: from.clone(),
                    call_id,
                    candidate,
                },
            ),
            SignalingMessage::GroupStart {
                channel_id,
                media_kind,
            } => {
                if let Some(room) = self.rooms.get(&channel_id) {
                    let call_id = room.call_id;
                    self.deliver(
                        from,
                        SignalingMessage::GroupAlreadyActive {
                            call_id,
                            channel_id,
                        },
                    );
                    return;
                }
                let call_id = CallId::new();
                self.rooms.insert(
                    channel_id.clone(),
                    Room {
                        call_id,
                        media_kind,
                        members: vec![from.clone()],
                    },
                );
                tracing::info!(channel = %channel_id, call_id = %call_id, "Relay started group call");
                let participants = vec![self.info(from)];
                self.deliver(
                    from,
                    SignalingMessage::GroupStarted {
                        channel_id,
                        call_id,
                        media_kind,
                        participants,
                    },
                );
            }
            SignalingMessage::GroupJoin {
                channel_id,
                call_id,
                ..
            } => {
                let Some(room) = self.rooms.get_mut(&channel_id).filter(|r| r.call_id == call_id)
                else {
                    self.deliver(
                        from,
                        SignalingMessage::GroupEnded {
                            call_id,
                            channel_id,
                        },
                    );
                    return;
                };
                if room.members.contains(from) {
                    return;
                }
                let existing = room.members.clone();
                room.members.push(from.clone());
                let media_kind = room.media_kind;
                let members = room.members.clone();

                let participants = members.iter().map(|m| self.info(m)).collect();
                self.deliver(
                    from,
                    SignalingMessage::GroupJoined {
                        channel_id: channel_id.clone(),
                        call_id,
                        media_kind,
                        participants,
                    },
                );
                let peer = self.info(from);
                for member in &existing {
                    self.deliver(
                        member,
                        SignalingMessage::GroupPeerJoined {
                            channel_id: channel_id.clone(),
                            call_id,
                            peer: peer.clone(),
                        },
                    );
                }
            }
            SignalingMessage::GroupLeave { channel_id, .. } => self.leave_room(&channel_id, from),
            SignalingMessage::GroupOffer {
                peer_id,
                call_id,
                channel_id,
                sdp,
            } => self.deliver(
                &peer_id,
                SignalingMessage::GroupOffer {
                    peer_id: from.clone(),
                    call_id,
                    channel_id,
                    sdp,
                },
            ),
            SignalingMessage::GroupAnswer {
                peer_id,
                call_id,
                channel_id,
                sdp,
            } => self.deliver(
                &peer_id,
                SignalingMessage::GroupAnswer {
                    peer_id: from.clone(),
                    call_id,
                    channel_id,
                    sdp,
                },
            ),
            SignalingMessage::GroupIce {
                peer_id,
                call_id,
                channel_id,
                candidate,
            } => self.deliver(
                &peer_id,
                SignalingMessage::GroupIce {
                    peer_id: from.clone(),
                    call_id,
                    channel_id,
                    candidate,
                },
            ),
            other => {
                tracing::warn!(from = %from, message_type = other.message_type(), "Relay ignoring server-to-client message from client");
            }
        }
    }
}

/// In-process relay shared by every connected user
#[derive(Debug, Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a user. A second connection for the same user replaces the first.
    pub fn connect(&self, info: ParticipantInfo) -> LoopbackTransport {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let user = info.user_id.clone();
        self.state
            .lock()
            .members
            .insert(user.clone(), Member { info, outbox });
        tracing::debug!(user = %user, "Relay connection opened");
        LoopbackTransport {
            user,
            relay: self.clone(),
            inbox: tokio::sync::Mutex::new(inbox),
        }
    }

    /// Drop a user's connection, removing them from any group call
    pub fn disconnect(&self, user: &UserId) {
        let mut state = self.state.lock();
        if state.members.remove(user).is_none() {
            return;
        }
        let channels: Vec<ChannelId> = state
            .rooms
            .iter()
            .filter(|(_, room)| room.members.contains(user))
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in channels {
            state.leave_room(&channel, user);
        }
        tracing::debug!(user = %user, "Relay connection closed");
    }

    /// Check if a user is connected
    pub fn is_connected(&self, user: &UserId) -> bool {
        self.state.lock().members.contains_key(user)
    }

    /// Every message a user has sent through the relay, oldest first
    pub fn sent_by(&self, user: &UserId) -> Vec<SignalingMessage> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|(from, _)| from == user)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Members of the group call running in a channel
    pub fn room_members(&self, channel_id: &ChannelId) -> Vec<UserId> {
        self.state
            .lock()
            .rooms
            .get(channel_id)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    fn route(&self, from: &UserId, json: &str) -> Result<(), SignalingError> {
        let message = SignalingMessage::from_json(json)?;
        let mut state = self.state.lock();
        if !state.members.contains_key(from) {
            return Err(SignalingError::Closed);
        }
        state.route(from, message);
        Ok(())
    }
}

/// One user's connection to a [`LoopbackRelay`]
#[derive(Debug)]
pub struct LoopbackTransport {
    user: UserId,
    relay: LoopbackRelay,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl LoopbackTransport {
    /// The connected user
    pub fn user(&self) -> &UserId {
        &self.user
    }
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    type Error = SignalingError;

    async fn send_message(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let json = message.to_json()?;
        self.relay.route(&self.user, &json)
    }

    async fn receive_message(&self) -> Result<SignalingMessage, SignalingError> {
        let json = self
            .inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(SignalingError::Closed)?;
        SignalingMessage::from_json(&json)
    }

    fn is_connected(&self) -> bool {
        self.relay.is_connected(&self.user)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user(id: &str) -> ParticipantInfo {
        ParticipantInfo::anonymous(UserId::new(id))
    }

    #[tokio::test]
    async fn test_initiate_reaches_callee() {
        let relay = LoopbackRelay::new();
        let alice = relay.connect(user("alice"));
        let bob = relay.connect(user("bob"));
        let call_id = CallId::new();

        alice
            .send_message(SignalingMessage::CallInitiate {
                call_id,
                receiver_id: UserId::new("bob"),
                media_kind: MediaKind::Video,
            })
            .await
            .unwrap();

        assert_eq!(
            bob.receive_message().await.unwrap(),
            SignalingMessage::CallIncoming {
                call_id,
                caller: user("alice"),
                media_kind: MediaKind::Video,
            }
        );
    }

    #[tokio::test]
    async fn test_negotiation_names_sender() {
        let relay = LoopbackRelay::new();
        let alice = relay.connect(user("alice"));
        let bob = relay.connect(user("bob"));
        let call_id = CallId::new();

        alice
            .send_message(SignalingMessage::Offer {
                peer_id: UserId::new("bob"),
                call_id,
                sdp: "v=0".into(),
            })
            .await
            .unwrap();

        match bob.receive_message().await.unwrap() {
            SignalingMessage::Offer { peer_id, .. } => assert_eq!(peer_id, UserId::new("alice")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_group_fan_out() {
        let relay = LoopbackRelay::new();
        let alice = relay.connect(user("alice"));
        let bob = relay.connect(user("bob"));
        let channel_id = ChannelId::new("eng");

        alice
            .send_message(SignalingMessage::GroupStart {
                channel_id: channel_id.clone(),
                media_kind: MediaKind::Voice,
            })
            .await
            .unwrap();
        let SignalingMessage::GroupStarted { call_id, .. } = alice.receive_message().await.unwrap()
        else {
            panic!("expected group.started");
        };

        bob.send_message(SignalingMessage::GroupJoin {
            channel_id: channel_id.clone(),
            call_id,
            media_kind: MediaKind::Voice,
        })
        .await
        .unwrap();

        match bob.receive_message().await.unwrap() {
            SignalingMessage::GroupJoined { participants, .. } => assert_eq!(participants.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        match alice.receive_message().await.unwrap() {
            SignalingMessage::GroupPeerJoined { peer, .. } => assert_eq!(peer, user("bob")),
            other => panic!("unexpected {other:?}"),
        }

        relay.disconnect(&UserId::new("bob"));
        match alice.receive_message().await.unwrap() {
            SignalingMessage::GroupPeerLeft { user_id, .. } => assert_eq!(user_id, UserId::new("bob")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(relay.room_members(&channel_id), vec![UserId::new("alice")]);
    }

    #[tokio::test]
    async fn test_second_start_reports_already_active() {
        let relay = LoopbackRelay::new();
        let alice = relay.connect(user("alice"));
        let bob = relay.connect(user("bob"));
        let channel_id = ChannelId::new("eng");
        let start = SignalingMessage::GroupStart {
            channel_id: channel_id.clone(),
            media_kind: MediaKind::Voice,
        };

        alice.send_message(start.clone()).await.unwrap();
        bob.send_message(start).await.unwrap();
        assert!(matches!(
            bob.receive_message().await.unwrap(),
            SignalingMessage::GroupAlreadyActive { .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnected_send_fails() {
        let relay = LoopbackRelay::new();
        let alice = relay.connect(user("alice"));
        relay.disconnect(&UserId::new("alice"));
        assert!(!alice.is_connected());
        let res = alice
            .send_message(SignalingMessage::CallAccept {
                call_id: CallId::new(),
            })
            .await;
        assert_eq!(res, Err(SignalingError::Closed));
        assert_eq!(alice.receive_message().await, Err(SignalingError::Closed));
    }
}
