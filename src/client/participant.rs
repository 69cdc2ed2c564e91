use std::sync::Arc;

use tokio::task::JoinHandle;

use super::SignalingClient;
use crate::compliance::{CaptureProvider, ComplianceHandle, ComplianceMachine, ExamHost};
use crate::config::ComplianceConfig;
use crate::relay::ConnectionId;
use crate::transport::PeerTransport;

/// A participant's compliance machine wired to a relay connection.
pub struct ParticipantSession {
    id: ConnectionId,
    handle: ComplianceHandle,
    machine: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl ParticipantSession {
    /// Spawns the machine and a task pumping relay messages into it. When the
    /// connection drops the machine is told signaling was lost.
    pub fn spawn(
        client: SignalingClient,
        config: ComplianceConfig,
        capture: Arc<dyn CaptureProvider>,
        transport: Arc<dyn PeerTransport>,
        host: Arc<dyn ExamHost>,
    ) -> Self {
        let (id, outbound, mut inbound) = client.into_parts();
        let (handle, machine) = ComplianceMachine::spawn(config, capture, transport, host, outbound);

        let events = handle.clone();
        let pump_id = id.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if events.signal(message).is_err() {
                    return;
                }
            }
            tracing::warn!(connection_id = %pump_id, "Relay connection lost");
            let _ = events.signaling_lost();
        });

        Self {
            id,
            handle,
            machine,
            pump,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn handle(&self) -> &ComplianceHandle {
        &self.handle
    }

    /// Stops the pump and lets the machine release everything it holds.
    pub async fn shutdown(self) {
        self.pump.abort();
        let _ = self.pump.await;
        drop(self.handle);
        if let Err(e) = self.machine.await {
            tracing::error!(error = %e, "Compliance machine task failed");
        }
    }
}
