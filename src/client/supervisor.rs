use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::SignalingClient;
use crate::compliance::MIN_CHECK_PERIOD;
use crate::config::SupervisorConfig;
use crate::error::{RelayError, Result};
use crate::relay::{ClientMessage, ConnectionId, Roster, ServerMessage};
use crate::supervisor::{PeerManager, StatusUpdate, SupervisorStatus};
use crate::transport::PeerTransport;

/// Sends the shared secret and waits for the verdict. On success returns the
/// roster the relay pushes right after.
pub async fn authenticate(client: &mut SignalingClient, password: &str, within: Duration) -> Result<Roster> {
    client.send(ClientMessage::AdminAuth(password.to_string()))?;

    let verdict = client
        .expect(within, |m| {
            matches!(m, ServerMessage::AuthSuccess | ServerMessage::AuthFailed(_))
        })
        .await?;
    if let ServerMessage::AuthFailed(reason) = verdict {
        return Err(RelayError::AuthenticationFailed(reason));
    }

    match client
        .expect(within, |m| matches!(m, ServerMessage::UserList(_)))
        .await?
    {
        ServerMessage::UserList(roster) => Ok(roster),
        _ => Err(RelayError::internal("unexpected relay message")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    Observe(ConnectionId),
    Release(ConnectionId),
    RefreshRoster,
}

/// An authenticated supervisor connection driving a [`PeerManager`].
pub struct SupervisorSession {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    roster: watch::Receiver<Roster>,
    observed: watch::Receiver<Vec<ConnectionId>>,
    status: mpsc::UnboundedReceiver<StatusUpdate>,
    task: JoinHandle<()>,
}

impl SupervisorSession {
    /// Takes over an already authenticated client.
    pub fn spawn(
        client: SignalingClient,
        initial_roster: Roster,
        config: SupervisorConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let (id, outbound, mut inbound) = client.into_parts();
        let (status_tx, status) = mpsc::unbounded_channel();
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (roster_tx, roster) = watch::channel(initial_roster);
        let (observed_tx, observed) = watch::channel(Vec::new());

        let (mut manager, mut peer_events) = PeerManager::new(transport, outbound.clone(), status_tx);

        let task = tokio::spawn(async move {
            let mut roster_poll = tokio::time::interval(config.roster_poll_interval.max(MIN_CHECK_PERIOD));
            roster_poll.tick().await;

            loop {
                tokio::select! {
                    message = inbound.recv() => {
                        let Some(message) = message else {
                            tracing::warn!("Relay connection lost, releasing all participants");
                            manager.reset().await;
                            observed_tx.send_replace(Vec::new());
                            break;
                        };
                        if let ServerMessage::UserList(ref latest) = message {
                            roster_tx.send_replace(latest.clone());
                        }
                        if let Err(e) = manager.handle_signal(message).await {
                            tracing::warn!(error = %e, "Failed to apply relay message");
                        }
                    }
                    Some(event) = peer_events.recv() => manager.handle_peer_event(event),
                    command = command_rx.recv() => {
                        let Some(command) = command else {
                            manager.reset().await;
                            break;
                        };
                        match command {
                            SupervisorCommand::Observe(participant) => {
                                if let Err(e) = manager.observe(participant.clone()).await {
                                    tracing::error!(participant = %participant, error = %e, "Failed to observe participant");
                                }
                            }
                            SupervisorCommand::Release(participant) => {
                                manager.release(&participant).await;
                            }
                            SupervisorCommand::RefreshRoster => {
                                let _ = outbound.send(ClientMessage::GetUserList);
                            }
                        }
                    }
                    _ = roster_poll.tick() => {
                        let _ = outbound.send(ClientMessage::GetUserList);
                    }
                }

                let current = manager.observed();
                observed_tx.send_if_modified(|observed| {
                    if *observed == current {
                        false
                    } else {
                        *observed = current;
                        true
                    }
                });
            }
        });

        Self {
            id,
            commands,
            roster,
            observed,
            status,
            task,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn observe(&self, participant: ConnectionId) -> Result<()> {
        self.command(SupervisorCommand::Observe(participant))
    }

    pub fn release(&self, participant: ConnectionId) -> Result<()> {
        self.command(SupervisorCommand::Release(participant))
    }

    pub fn refresh_roster(&self) -> Result<()> {
        self.command(SupervisorCommand::RefreshRoster)
    }

    fn command(&self, command: SupervisorCommand) -> Result<()> {
        self.commands.send(command).map_err(RelayError::from)
    }

    pub fn roster(&self) -> Roster {
        self.roster.borrow().clone()
    }

    pub fn roster_updates(&self) -> watch::Receiver<Roster> {
        self.roster.clone()
    }

    pub fn observed(&self) -> Vec<ConnectionId> {
        self.observed.borrow().clone()
    }

    pub async fn next_status(&mut self) -> Option<StatusUpdate> {
        self.status.recv().await
    }

    /// Waits for a roster satisfying `predicate`.
    pub async fn wait_for_roster<F>(&self, within: Duration, predicate: F) -> Result<Roster>
    where
        F: Fn(&Roster) -> bool,
    {
        wait_for(self.roster.clone(), within, predicate).await
    }

    /// Waits until the set of observed participants satisfies `predicate`.
    pub async fn wait_for_observed<F>(&self, within: Duration, predicate: F) -> Result<Vec<ConnectionId>>
    where
        F: Fn(&Vec<ConnectionId>) -> bool,
    {
        wait_for(self.observed.clone(), within, predicate).await
    }

    /// Waits for `participant` to reach `status`, skipping other updates.
    pub async fn wait_for_status(
        &mut self,
        participant: &ConnectionId,
        status: SupervisorStatus,
        within: Duration,
    ) -> Result<()> {
        let wait = async {
            while let Some(update) = self.status.recv().await {
                if &update.participant == participant && update.status == status {
                    return Ok(());
                }
            }
            Err(RelayError::ChannelClosed)
        };
        tokio::time::timeout(within, wait)
            .await
            .map_err(|_| RelayError::Timeout(format!("waiting for {} to be {:?}", participant, status)))?
    }

    /// Releases every participant and stops the driver.
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Supervisor task failed");
        }
    }
}

async fn wait_for<T, F>(mut rx: watch::Receiver<T>, within: Duration, predicate: F) -> Result<T>
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    let wait = async {
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&*current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| RelayError::ChannelClosed)?;
        }
    };
    tokio::time::timeout(within, wait)
        .await
        .map_err(|_| RelayError::Timeout("waiting for supervisor state".to_string()))?
}
