//! Peer-facing HTTP surface
//!
//! Only the ledger replication route lives here; the SAE-facing API is served
//! by a separate layer on top of [`crate::KeyManager`].

pub mod handlers;
pub mod router;
pub mod state;
pub mod tls;

pub use router::{bind, build_router, serve, LEDGER_ROUTE};
pub use state::ApiState;
pub use tls::PeerIdentity;
