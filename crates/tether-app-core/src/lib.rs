// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for Tether tools (config store port, typed
//! client and host settings). Keeps runtime adapters thin.

pub mod config;
pub mod settings;
