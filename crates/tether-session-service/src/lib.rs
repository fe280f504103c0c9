// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tether session host: server sessions around a state tree, and the
//! Unix-socket hub that binds client connections to them.

pub mod demo;
pub mod hub;
pub mod session;

pub use demo::{App, DemoApp};
pub use hub::{handle_client, handle_message, push_tick, spawn_push_task, HubState, SharedHub};
pub use session::{Resume, SessionHandle, SyncSession};
