// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunnel port emulation for a software virtual switch.
//!
//! This crate owns the registry of logical tunnel ports and answers
//! two questions at dataplane speed: which tunnel port does an
//! encapsulated packet belong to (ingress), and what outer-header
//! fields must be stamped onto a flow selected for output through a
//! tunnel port (egress). Registration is driven by a single
//! control-plane thread while lookups run concurrently from the
//! forwarding threads.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod api;
pub mod engine;
pub mod print;
