mod router;
mod server;
mod session;
mod signaling;

pub use router::{ForwardOutcome, SignalingRouter};
pub use server::{Relay, RelayEvent, RelayHandle};
pub use session::{AuthClaim, AuthFailure, ConnectionId, Role, Roster, SessionRecord, SessionRegistry};
pub use signaling::{ClientMessage, ForwardedSignal, ServerMessage, SignalEnvelope, SignalKind};
