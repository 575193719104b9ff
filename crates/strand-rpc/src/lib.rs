//! Protocol layers over the transport/peer substrate: a JSON-RPC session
//! with request/response correlation, and the D-Bus control bridge.

pub mod bridge;
pub mod jsonrpc;

pub use bridge::{AgentError, Bridge, Cmd, DbusAgent, ErrorCode, MethodReply, NameWatch};
pub use jsonrpc::{CallHandle, CallOutcome, MethodCall, Session};
