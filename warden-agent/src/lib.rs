// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the warden agent.
//!
//! The agent runs on every node of a warden cluster. At startup it detects
//! the node's role from the identity store, constructs the matching role
//! controller, brings the node's certificates and workloads up to date, and
//! then maintains them until shutdown or a deliberate restart.

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod command;
pub mod config;
pub mod detector;
pub mod discovery;
mod http_entrypoints;
pub mod middleware;
pub mod monitor;
pub mod params;
pub mod platform;
pub mod roles;
pub mod server;

#[cfg(test)]
mod fakes;

#[macro_use]
extern crate slog;
