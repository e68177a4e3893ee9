//! Request/response over one-way queues.
//!
//! ```text
//!  caller                                             responder
//!  ──────                                             ─────────
//!  RpcClient::call
//!    register PendingRequest(cid) ─┐
//!    publish ─── reply-to=bus:q-7f3a, cid ──▶ RpcResponder
//!                                   │           decode, invoke_in_new_scope
//!  ReplyQueue ◀──────── reply, same cid ──────── ReplyRouter ─▶ bus
//!    remove(cid) ─▶ resolve ────────┘
//!    (missing: late or duplicate, discarded)
//! ```
//!
//! One reply queue and one pending map serve every call a client makes.
//! Several command types can share a request queue; the responder picks the
//! consumer by the `message-namespace` header.

mod client;
mod pending;
mod server;

use serde::{Deserialize, Serialize};

pub use client::{ReplyQueue, RpcClient, CAUSATION_ID};
pub use pending::{PendingGuard, PendingRequests};
pub use server::RpcResponder;

/// Body of a reply whose error header is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Snake-case error kind, e.g. `handler_failed`.
    pub kind: String,
    pub message: String,
}
