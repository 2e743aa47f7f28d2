//! # Live Endpoint
//!
//! Everything that talks to the remote inference service.
//!
//! ## Key Components:
//! - **Protocol**: setup / realtime input / server content messages and their parsing
//! - **Channel**: the connector and channel seams plus the WebSocket implementation

pub mod channel; // LiveConnector / LiveChannel and the WebSocket transport
pub mod protocol; // Wire messages
