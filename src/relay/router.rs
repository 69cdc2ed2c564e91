use serde_json::Value;

use super::session::{ConnectionId, SessionRegistry};
use super::signaling::{ForwardedSignal, SignalKind};

/// Result of one forwarding attempt. Only `Delivered` reaches anyone; the other
/// outcomes are silent drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered,
    SourceUnauthenticated,
    UnknownTarget,
}

/// Forwards negotiation payloads between connections by identity.
pub struct SignalingRouter<'a> {
    registry: &'a SessionRegistry,
}

impl<'a> SignalingRouter<'a> {
    pub fn new(registry: &'a SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn forward(
        &self,
        kind: SignalKind,
        source: &ConnectionId,
        target: &ConnectionId,
        payload: Value,
    ) -> ForwardOutcome {
        let authenticated = self
            .registry
            .get(source)
            .map(|record| record.authenticated)
            .unwrap_or(false);

        if !authenticated {
            tracing::debug!(
                kind = kind.as_str(),
                source = %source,
                target = %target,
                "Dropping signal from unauthenticated connection"
            );
            return ForwardOutcome::SourceUnauthenticated;
        }

        let message = kind.into_server_message(ForwardedSignal {
            source: source.clone(),
            payload,
        });

        if self.registry.send_to(target, message) {
            tracing::debug!(kind = kind.as_str(), source = %source, target = %target, "Forwarded signal");
            ForwardOutcome::Delivered
        } else {
            tracing::debug!(
                kind = kind.as_str(),
                source = %source,
                target = %target,
                "Target not connected, dropping signal"
            );
            ForwardOutcome::UnknownTarget
        }
    }
}
