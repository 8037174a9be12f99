// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared facilities for the warden cluster node monitor.
//!
//! Every node of a warden cluster runs the monitor agent; the crates in this
//! workspace implement it. This crate holds the data model both sides of
//! every interface agree on (cluster identity, certificate roles) along with
//! small utilities used by all the executables.

pub mod backoff;
pub mod cluster;
pub mod cmd;
