use std::collections::{BTreeMap, HashMap};
use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::signaling::ServerMessage;

const CONNECTION_ID_LEN: usize = 20;

/// Opaque routing address assigned to each live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CONNECTION_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Supervisor,
    Participant,
    Unassigned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: ConnectionId,
    pub role: Role,
    pub name: Option<String>,
    pub authenticated: bool,
}

impl SessionRecord {
    fn unassigned(id: ConnectionId) -> Self {
        Self {
            id,
            role: Role::Unassigned,
            name: None,
            authenticated: false,
        }
    }

    pub fn is_supervisor(&self) -> bool {
        self.authenticated && self.role == Role::Supervisor
    }

    pub fn is_participant(&self) -> bool {
        self.authenticated && self.role == Role::Participant
    }
}

/// Participant identity to display name, authenticated participants only.
pub type Roster = BTreeMap<ConnectionId, String>;

/// What a connection claims to be when it authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthClaim {
    Supervisor { password: String },
    Participant { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    InvalidPassword,
    NameRequired,
    SupervisorCannotJoin,
    ParticipantCannotSupervise,
    UnknownConnection,
}

impl AuthFailure {
    pub fn message(&self) -> &'static str {
        match self {
            AuthFailure::InvalidPassword => "Invalid password",
            AuthFailure::NameRequired => "Name is required",
            AuthFailure::SupervisorCannotJoin => "Supervisors cannot join an exam",
            AuthFailure::ParticipantCannotSupervise => "Participants cannot authenticate as supervisor",
            AuthFailure::UnknownConnection => "Unknown connection",
        }
    }
}

struct Session {
    record: SessionRecord,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

/// In-memory table of live connections, owned by the relay loop.
pub struct SessionRegistry {
    admin_password: String,
    sessions: HashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    pub fn new(admin_password: impl Into<String>) -> Self {
        Self {
            admin_password: admin_password.into(),
            sessions: HashMap::new(),
        }
    }

    /// Creates an unassigned record for a freshly accepted connection.
    pub fn connect(&mut self, id: ConnectionId, outbound: mpsc::UnboundedSender<ServerMessage>) {
        tracing::info!(connection_id = %id, "Connection registered");
        let record = SessionRecord::unassigned(id.clone());
        self.sessions.insert(id, Session { record, outbound });
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&SessionRecord> {
        self.sessions.get(id).map(|s| &s.record)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Supervisors are checked against the shared secret; participants only need a
    /// non-empty name. A failed attempt leaves the record untouched.
    pub fn authenticate(&mut self, id: &ConnectionId, claim: AuthClaim) -> Result<Role, AuthFailure> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or(AuthFailure::UnknownConnection)?;

        match claim {
            AuthClaim::Supervisor { password } => {
                if password != self.admin_password {
                    tracing::warn!(connection_id = %id, "Supervisor authentication failed");
                    return Err(AuthFailure::InvalidPassword);
                }
                if session.record.is_participant() {
                    return Err(AuthFailure::ParticipantCannotSupervise);
                }

                session.record.role = Role::Supervisor;
                session.record.name = Some("Supervisor".to_string());
                session.record.authenticated = true;
                tracing::info!(connection_id = %id, "Supervisor authenticated");
                Ok(Role::Supervisor)
            }
            AuthClaim::Participant { name } => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(AuthFailure::NameRequired);
                }
                if session.record.is_supervisor() {
                    return Err(AuthFailure::SupervisorCannotJoin);
                }

                session.record.role = Role::Participant;
                session.record.name = Some(name.to_string());
                session.record.authenticated = true;
                tracing::info!(connection_id = %id, name = %name, "Participant joined exam");

                self.broadcast_roster();
                Ok(Role::Participant)
            }
        }
    }

    /// Removes the record; a departing participant triggers a roster push.
    pub fn deregister(&mut self, id: &ConnectionId) -> Option<SessionRecord> {
        let session = self.sessions.remove(id)?;
        tracing::info!(
            connection_id = %id,
            role = ?session.record.role,
            name = session.record.name.as_deref().unwrap_or("-"),
            "Connection deregistered"
        );

        if session.record.is_participant() {
            self.broadcast_roster();
        }
        Some(session.record)
    }

    /// Ends a participant's exam without dropping the connection. Returns false
    /// when the connection is not an authenticated participant.
    pub fn end_session(&mut self, id: &ConnectionId) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        if !session.record.is_participant() {
            return false;
        }

        tracing::info!(
            connection_id = %id,
            name = session.record.name.as_deref().unwrap_or("-"),
            "Participant ended exam"
        );
        session.record = SessionRecord::unassigned(id.clone());
        self.broadcast_roster();
        true
    }

    /// Recomputed on every call from the live records.
    pub fn roster(&self) -> Roster {
        self.sessions
            .values()
            .filter(|s| s.record.is_participant())
            .filter_map(|s| {
                s.record
                    .name
                    .clone()
                    .map(|name| (s.record.id.clone(), name))
            })
            .collect()
    }

    /// Delivers a message to one live connection. Returns false if the target is
    /// unknown or its outbound channel has already closed.
    pub fn send_to(&self, id: &ConnectionId, message: ServerMessage) -> bool {
        match self.sessions.get(id) {
            Some(session) => session.outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Pushes the full roster snapshot to every authenticated supervisor.
    pub fn broadcast_roster(&self) {
        let roster = self.roster();
        let mut delivered = 0usize;

        for session in self.sessions.values().filter(|s| s.record.is_supervisor()) {
            if session.outbound.send(ServerMessage::UserList(roster.clone())).is_ok() {
                delivered += 1;
            }
        }

        tracing::debug!(
            participants = roster.len(),
            supervisors = delivered,
            "Broadcast roster"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &mut SessionRegistry, id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.connect(ConnectionId::from(id), tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn participant(name: &str) -> AuthClaim {
        AuthClaim::Participant {
            name: name.to_string(),
        }
    }

    fn supervisor(password: &str) -> AuthClaim {
        AuthClaim::Supervisor {
            password: password.to_string(),
        }
    }

    #[test]
    fn test_generated_ids_are_unique_tokens() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_eq!(a.as_str().len(), CONNECTION_ID_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_connect_creates_unassigned_record() {
        let mut registry = SessionRegistry::new("secret");
        let _rx = connect(&mut registry, "c1");

        let record = registry.get(&"c1".into()).unwrap();
        assert_eq!(record.role, Role::Unassigned);
        assert!(!record.authenticated);
        assert!(registry.roster().is_empty());
    }

    #[test]
    fn test_supervisor_auth_with_correct_secret() {
        let mut registry = SessionRegistry::new("secret");
        let _rx = connect(&mut registry, "admin");

        assert_eq!(
            registry.authenticate(&"admin".into(), supervisor("secret")),
            Ok(Role::Supervisor)
        );
        assert!(registry.get(&"admin".into()).unwrap().is_supervisor());

        // Every correct attempt succeeds again.
        assert_eq!(
            registry.authenticate(&"admin".into(), supervisor("secret")),
            Ok(Role::Supervisor)
        );
    }

    #[test]
    fn test_failed_supervisor_auth_never_mutates_record() {
        let mut registry = SessionRegistry::new("secret");
        let _rx = connect(&mut registry, "c1");
        let before = registry.get(&"c1".into()).cloned();

        for attempt in ["", "Secret", "secret ", "admin123"] {
            assert_eq!(
                registry.authenticate(&"c1".into(), supervisor(attempt)),
                Err(AuthFailure::InvalidPassword)
            );
            assert_eq!(registry.get(&"c1".into()).cloned(), before);
        }
    }

    #[test]
    fn test_participant_name_is_trimmed_and_required() {
        let mut registry = SessionRegistry::new("secret");
        let _rx = connect(&mut registry, "p1");

        assert_eq!(
            registry.authenticate(&"p1".into(), participant("   ")),
            Err(AuthFailure::NameRequired)
        );
        assert!(registry.roster().is_empty());

        assert_eq!(
            registry.authenticate(&"p1".into(), participant("  Alice ")),
            Ok(Role::Participant)
        );
        assert_eq!(registry.roster().get(&"p1".into()).map(String::as_str), Some("Alice"));
    }

    #[test]
    fn test_roles_do_not_switch_on_live_connection() {
        let mut registry = SessionRegistry::new("secret");
        let _a = connect(&mut registry, "admin");
        let _p = connect(&mut registry, "p1");

        registry.authenticate(&"admin".into(), supervisor("secret")).unwrap();
        registry.authenticate(&"p1".into(), participant("Alice")).unwrap();

        assert_eq!(
            registry.authenticate(&"admin".into(), participant("Mallory")),
            Err(AuthFailure::SupervisorCannotJoin)
        );
        assert_eq!(
            registry.authenticate(&"p1".into(), supervisor("secret")),
            Err(AuthFailure::ParticipantCannotSupervise)
        );
        assert_eq!(registry.roster().len(), 1);
    }

    #[test]
    fn test_join_and_leave_push_full_roster_to_supervisors() {
        let mut registry = SessionRegistry::new("secret");
        let mut admin_rx = connect(&mut registry, "admin");
        let mut other_rx = connect(&mut registry, "unauthenticated");
        let _p1 = connect(&mut registry, "p1");
        let _p2 = connect(&mut registry, "p2");

        registry.authenticate(&"admin".into(), supervisor("secret")).unwrap();
        registry.authenticate(&"p1".into(), participant("Alice")).unwrap();
        registry.authenticate(&"p2".into(), participant("Bob")).unwrap();
        registry.deregister(&"p1".into());

        let pushes = drain(&mut admin_rx);
        assert_eq!(pushes.len(), 3);
        match pushes.last().unwrap() {
            ServerMessage::UserList(roster) => {
                assert_eq!(roster.len(), 1);
                assert_eq!(roster.get(&"p2".into()).map(String::as_str), Some("Bob"));
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(drain(&mut other_rx).is_empty());
    }

    #[test]
    fn test_deregistering_supervisor_does_not_broadcast() {
        let mut registry = SessionRegistry::new("secret");
        let mut admin_rx = connect(&mut registry, "admin");
        let _other = connect(&mut registry, "admin2");
        registry.authenticate(&"admin".into(), supervisor("secret")).unwrap();
        registry.authenticate(&"admin2".into(), supervisor("secret")).unwrap();

        let removed = registry.deregister(&"admin2".into()).unwrap();
        assert_eq!(removed.role, Role::Supervisor);
        assert!(drain(&mut admin_rx).is_empty());
        assert!(registry.deregister(&"admin2".into()).is_none());
    }

    #[test]
    fn test_end_session_only_applies_to_participants() {
        let mut registry = SessionRegistry::new("secret");
        let mut admin_rx = connect(&mut registry, "admin");
        let _p = connect(&mut registry, "p1");
        registry.authenticate(&"admin".into(), supervisor("secret")).unwrap();

        assert!(!registry.end_session(&"admin".into()));
        assert!(!registry.end_session(&"p1".into()));

        registry.authenticate(&"p1".into(), participant("Alice")).unwrap();
        drain(&mut admin_rx);

        assert!(registry.end_session(&"p1".into()));
        assert!(registry.roster().is_empty());
        assert_eq!(registry.get(&"p1".into()).unwrap().role, Role::Unassigned);
        assert_eq!(
            drain(&mut admin_rx),
            vec![ServerMessage::UserList(Roster::new())]
        );
    }

    #[test]
    fn test_roster_matches_authenticated_participants_after_churn() {
        let mut registry = SessionRegistry::new("secret");
        let mut receivers = Vec::new();
        for i in 0..10 {
            receivers.push(connect(&mut registry, &format!("c{}", i)));
        }

        for i in 0..10 {
            let id = ConnectionId::from(format!("c{}", i));
            if i % 2 == 0 {
                registry.authenticate(&id, participant(&format!("Student {}", i))).unwrap();
            }
        }
        registry.deregister(&"c4".into());
        registry.end_session(&"c6".into());
        registry.deregister(&"c3".into());

        let roster = registry.roster();
        let expected: Vec<ConnectionId> = ["c0", "c2", "c8"].iter().map(|s| (*s).into()).collect();
        assert_eq!(roster.keys().cloned().collect::<Vec<_>>(), expected);
        for id in roster.keys() {
            assert!(registry.get(id).unwrap().is_participant());
        }
    }

    #[test]
    fn test_send_to_unknown_or_closed_target() {
        let mut registry = SessionRegistry::new("secret");
        let rx = connect(&mut registry, "c1");
        drop(rx);

        assert!(!registry.send_to(&"missing".into(), ServerMessage::AuthSuccess));
        assert!(!registry.send_to(&"c1".into(), ServerMessage::AuthSuccess));
    }
}
