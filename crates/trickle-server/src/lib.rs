//! # trickle-server
//!
//! The Trickle chat server: HTTP streaming, long-poll and WebSocket
//! transports over one shared hub.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /chat` | Open a streaming connection |
//! | `POST /chat` | Control channel (`send` / `close`) |
//! | `GET /chat/poll` | Open or poll a long-poll connection |
//! | `GET /chat/ws` | WebSocket connection |
//! | `GET /health` | Health check |

pub mod chat;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use chat::{ChatPayload, ChatRenderer};
pub use config::Config;
pub use handlers::{build_router, run_server, AppState};
