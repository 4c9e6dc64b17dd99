//! Web portal: routes, access gate and server lifecycle

mod gate;
mod pages;
mod router;
mod server;

pub use gate::{ACCESS_DENIED_PATH, AccessGate, GateDecision, NOT_SIGNED_IN_PATH, gate_middleware};
pub use pages::escape_html;
pub use router::{AppState, create_router, external_url};
pub use server::{Bootstrap, Portal, spawn_session_purge};
