//! Agora: the runtime core of an Agent-Client Protocol (ACP) connection.
//!
//! ACP connects an AI agent process to a client (editor, shell, host)
//! over JSON-RPC. This crate implements the failure-sensitive middle of
//! that protocol: request/response correlation, per-session prompt
//! execution with retry/cancellation/permission gating, the
//! reverse-channel permission bridge, the session registry, and the
//! multi-client WebSocket id router. Transports, the model client, and
//! runtime providers (fs, terminal) are injected collaborators.

pub mod bridge;
pub mod error;
pub mod gate;
pub mod methods;
pub mod permission;
pub mod prompt;
pub mod rpc;
pub mod router;
pub mod service;
pub mod session;

pub use error::Error;
