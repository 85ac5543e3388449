//! An AgentX (RFC 2741) subagent runtime.
//!
//! Connects to a master SNMP agent over a local stream socket, registers
//! OID subtrees, and serves GET / GETNEXT / GETBULK / SET and notification
//! traffic from application-supplied [`Updater`]s and [`SetHandler`]s.

pub mod agent;
pub mod error;
pub mod handler;
pub mod oid;
pub mod parallel;
pub mod pdu;
pub mod protocol;
pub mod set_handler;
pub mod store;
pub mod updater;
pub mod value;

pub use crate::agent::{Agent, AgentConfig, AgentHandle, DEFAULT_PRIORITY};
pub use crate::error::{Error, Result};
pub use crate::oid::Oid;
pub use crate::set_handler::SetHandler;
pub use crate::store::DataStore;
pub use crate::updater::{Snapshot, Updater};
pub use crate::value::{Value, VarBind};
