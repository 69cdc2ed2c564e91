use tokio::sync::mpsc;

use super::router::SignalingRouter;
use super::session::{AuthClaim, ConnectionId, Role, SessionRegistry};
use super::signaling::{ClientMessage, ServerMessage, SignalEnvelope, SignalKind};
use crate::config::AuthConfig;
use crate::error::{RelayError, Result};

/// Input to the relay loop. Every connect, message and disconnect passes through
/// one channel and is applied in arrival order.
#[derive(Debug)]
pub enum RelayEvent {
    Connected {
        id: ConnectionId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    Message {
        id: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        id: ConnectionId,
    },
}

/// Cloneable entry point used by websocket tasks to feed the relay loop.
#[derive(Clone)]
pub struct RelayHandle {
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayHandle {
    /// Assigns an identity to a new connection and registers its outbound channel.
    pub fn connect(&self, outbound: mpsc::UnboundedSender<ServerMessage>) -> Result<ConnectionId> {
        let id = ConnectionId::generate();
        self.events.send(RelayEvent::Connected {
            id: id.clone(),
            outbound,
        })?;
        Ok(id)
    }

    pub fn submit(&self, id: &ConnectionId, message: ClientMessage) -> Result<()> {
        self.events
            .send(RelayEvent::Message {
                id: id.clone(),
                message,
            })
            .map_err(RelayError::from)
    }

    pub fn disconnect(&self, id: &ConnectionId) {
        if self
            .events
            .send(RelayEvent::Disconnected { id: id.clone() })
            .is_err()
        {
            tracing::warn!(connection_id = %id, "Relay loop stopped before disconnect was processed");
        }
    }
}

/// Owns the session registry and applies relay events one at a time.
pub struct Relay {
    registry: SessionRegistry,
    events: mpsc::UnboundedReceiver<RelayEvent>,
}

impl Relay {
    pub fn new(auth: &AuthConfig) -> (Self, RelayHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Self {
            registry: SessionRegistry::new(auth.admin_password.clone()),
            events: rx,
        };
        (relay, RelayHandle { events: tx })
    }

    /// Starts the relay loop on the runtime and returns its handle.
    pub fn spawn(auth: &AuthConfig) -> RelayHandle {
        let (relay, handle) = Self::new(auth);
        tokio::spawn(relay.run());
        handle
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn run(mut self) {
        tracing::info!("Relay loop started");
        while let Some(event) = self.events.recv().await {
            self.apply(event);
        }
        tracing::info!(remaining = self.registry.len(), "Relay loop stopped");
    }

    pub fn apply(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected { id, outbound } => {
                let _ = outbound.send(ServerMessage::Connected { id: id.clone() });
                self.registry.connect(id, outbound);
            }
            RelayEvent::Message { id, message } => self.handle_message(&id, message),
            RelayEvent::Disconnected { id } => {
                self.registry.deregister(&id);
            }
        }
    }

    fn handle_message(&mut self, id: &ConnectionId, message: ClientMessage) {
        if self.registry.get(id).is_none() {
            tracing::debug!(connection_id = %id, "Message from unregistered connection ignored");
            return;
        }

        match message {
            ClientMessage::AdminAuth(password) => {
                match self
                    .registry
                    .authenticate(id, AuthClaim::Supervisor { password })
                {
                    Ok(_) => {
                        self.registry.send_to(id, ServerMessage::AuthSuccess);
                        self.registry
                            .send_to(id, ServerMessage::UserList(self.registry.roster()));
                    }
                    Err(failure) => {
                        self.registry
                            .send_to(id, ServerMessage::AuthFailed(failure.message().to_string()));
                    }
                }
            }
            ClientMessage::JoinExam(name) => {
                if let Err(failure) = self
                    .registry
                    .authenticate(id, AuthClaim::Participant { name })
                {
                    tracing::warn!(connection_id = %id, reason = failure.message(), "Join rejected");
                    self.registry
                        .send_to(id, ServerMessage::Error(failure.message().to_string()));
                }
            }
            ClientMessage::GetUserList => {
                let is_supervisor = self
                    .registry
                    .get(id)
                    .map(|r| r.is_supervisor())
                    .unwrap_or(false);
                if is_supervisor {
                    self.registry
                        .send_to(id, ServerMessage::UserList(self.registry.roster()));
                }
            }
            ClientMessage::EndExam => {
                let role = self.registry.get(id).map(|r| r.role);
                if role == Some(Role::Participant) {
                    self.registry.end_session(id);
                } else {
                    tracing::debug!(connection_id = %id, "end-exam from non-participant ignored");
                }
            }
            ClientMessage::Offer(envelope) => self.forward(SignalKind::Offer, id, envelope),
            ClientMessage::Answer(envelope) => self.forward(SignalKind::Answer, id, envelope),
            ClientMessage::IceCandidate(envelope) => {
                self.forward(SignalKind::IceCandidate, id, envelope)
            }
        }
    }

    fn forward(&self, kind: SignalKind, source: &ConnectionId, envelope: SignalEnvelope) {
        SignalingRouter::new(&self.registry).forward(kind, source, &envelope.target, envelope.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Roster;
    use serde_json::json;

    struct Client {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn relay() -> Relay {
        let (relay, _handle) = Relay::new(&AuthConfig {
            admin_password: "secret".to_string(),
        });
        relay
    }

    fn connect(relay: &mut Relay, id: &str) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        relay.apply(RelayEvent::Connected {
            id: id.into(),
            outbound: tx,
        });
        let mut client = Client { id: id.into(), rx };
        assert_eq!(
            client.drain(),
            vec![ServerMessage::Connected { id: id.into() }]
        );
        client
    }

    fn send(relay: &mut Relay, client: &Client, message: ClientMessage) {
        relay.apply(RelayEvent::Message {
            id: client.id.clone(),
            message,
        });
    }

    #[test]
    fn test_admin_auth_success_sends_roster() {
        let mut relay = relay();
        let mut admin = connect(&mut relay, "admin");
        let student = connect(&mut relay, "p1");
        send(&mut relay, &student, ClientMessage::JoinExam("Alice".into()));

        send(&mut relay, &admin, ClientMessage::AdminAuth("secret".into()));

        let mut expected = Roster::new();
        expected.insert("p1".into(), "Alice".into());
        assert_eq!(
            admin.drain(),
            vec![ServerMessage::AuthSuccess, ServerMessage::UserList(expected)]
        );
    }

    #[test]
    fn test_admin_auth_failure() {
        let mut relay = relay();
        let mut admin = connect(&mut relay, "admin");

        send(&mut relay, &admin, ClientMessage::AdminAuth("wrong".into()));
        assert_eq!(
            admin.drain(),
            vec![ServerMessage::AuthFailed("Invalid password".into())]
        );
        assert!(!relay.registry().get(&admin.id).unwrap().authenticated);
    }

    #[test]
    fn test_empty_join_reports_error() {
        let mut relay = relay();
        let mut student = connect(&mut relay, "p1");

        send(&mut relay, &student, ClientMessage::JoinExam("  ".into()));
        assert_eq!(
            student.drain(),
            vec![ServerMessage::Error("Name is required".into())]
        );
        assert!(relay.registry().roster().is_empty());
    }

    #[test]
    fn test_get_user_list_is_supervisor_only() {
        let mut relay = relay();
        let mut admin = connect(&mut relay, "admin");
        let mut student = connect(&mut relay, "p1");
        send(&mut relay, &student, ClientMessage::JoinExam("Alice".into()));

        send(&mut relay, &student, ClientMessage::GetUserList);
        assert!(student.drain().is_empty());

        send(&mut relay, &admin, ClientMessage::AdminAuth("secret".into()));
        admin.drain();
        send(&mut relay, &admin, ClientMessage::GetUserList);
        assert_eq!(admin.drain().len(), 1);
    }

    #[test]
    fn test_end_exam_and_disconnect_update_roster() {
        let mut relay = relay();
        let mut admin = connect(&mut relay, "admin");
        send(&mut relay, &admin, ClientMessage::AdminAuth("secret".into()));
        let alice = connect(&mut relay, "alice");
        let bob = connect(&mut relay, "bob");
        send(&mut relay, &alice, ClientMessage::JoinExam("Alice".into()));
        send(&mut relay, &bob, ClientMessage::JoinExam("Bob".into()));
        admin.drain();

        send(&mut relay, &alice, ClientMessage::EndExam);
        relay.apply(RelayEvent::Disconnected { id: bob.id.clone() });

        let pushes = admin.drain();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1], ServerMessage::UserList(Roster::new()));
        // The connection that ended its exam is still registered.
        assert!(relay.registry().get(&alice.id).is_some());
        assert!(relay.registry().get(&bob.id).is_none());
    }

    #[test]
    fn test_offer_answer_ice_round_trip_between_parties() {
        let mut relay = relay();
        let mut admin = connect(&mut relay, "admin");
        let mut student = connect(&mut relay, "p1");
        send(&mut relay, &admin, ClientMessage::AdminAuth("secret".into()));
        send(&mut relay, &student, ClientMessage::JoinExam("Alice".into()));
        admin.drain();

        send(
            &mut relay,
            &admin,
            ClientMessage::Offer(SignalEnvelope {
                target: "p1".into(),
                payload: json!({"type": "offer", "sdp": "o"}),
            }),
        );
        let offer = student.drain();
        assert_eq!(offer.len(), 1);
        let (_, signal) = offer[0].as_signal().unwrap();
        assert_eq!(signal.source, admin.id);

        send(
            &mut relay,
            &student,
            ClientMessage::Answer(SignalEnvelope {
                target: signal.source.clone(),
                payload: json!({"type": "answer", "sdp": "a"}),
            }),
        );
        match admin.drain().as_slice() {
            [ServerMessage::Answer(signal)] => assert_eq!(signal.source, student.id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_signal_to_departed_target_has_no_effect() {
        let mut relay = relay();
        let mut admin = connect(&mut relay, "admin");
        send(&mut relay, &admin, ClientMessage::AdminAuth("secret".into()));
        admin.drain();

        send(
            &mut relay,
            &admin,
            ClientMessage::IceCandidate(SignalEnvelope {
                target: "gone".into(),
                payload: json!({"candidate": ""}),
            }),
        );
        assert!(admin.drain().is_empty());
        assert_eq!(relay.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_relay_processes_events_in_order() {
        let handle = Relay::spawn(&AuthConfig {
            admin_password: "secret".to_string(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = handle.connect(tx).unwrap();
        handle.submit(&id, ClientMessage::AdminAuth("secret".into())).unwrap();

        assert_eq!(rx.recv().await, Some(ServerMessage::Connected { id: id.clone() }));
        assert_eq!(rx.recv().await, Some(ServerMessage::AuthSuccess));
        assert_eq!(rx.recv().await, Some(ServerMessage::UserList(Roster::new())));
    }
}
