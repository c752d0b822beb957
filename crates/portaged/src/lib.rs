//! portaged — the Portage node runtime.
//!
//! Wires the codec, chunk store, and registries into a running node:
//! a dispatcher supervising one session actor per peer and one engine
//! actor per active transfer, plus UDP discovery.

pub mod discovery;
pub mod dispatch;
pub mod session;
pub mod transfer;

pub use dispatch::{Dispatcher, DispatchError, FloodPolicy};
