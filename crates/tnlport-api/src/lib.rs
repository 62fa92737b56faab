// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API types shared between the tunnel-port engine and its control
//! plane.
//!
//! Everything in this crate is a plain value type: addresses, port
//! identifiers, the tunnel configuration read from a netdev, and the
//! response types used to dump engine state.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

pub mod ip;
pub mod port;
pub mod tunnel;

pub use ip::*;
pub use port::*;
pub use tunnel::*;
