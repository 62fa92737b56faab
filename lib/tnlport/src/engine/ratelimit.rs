// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Token-bucket rate limiting for log messages.
//!
//! The packet path can hit its warning and debug logging sites once
//! per packet, so every such site is gated on a rate limiter with a
//! small fixed budget. A limiter admits up to `burst` messages
//! immediately and refills at `rate` messages per minute.

use std::sync::Mutex;
use std::time::Instant;

// Milli-token units per message, so refill arithmetic stays integral:
// `rate` tokens per 60_000 ms means one milli-token per ms at rate 1.
const TOKEN_COST: u64 = 60_000;

#[derive(Debug)]
struct RlState {
    tokens: u64,
    last_fill: Option<Instant>,
}

#[derive(Debug)]
pub struct RateLimit {
    /// Messages admitted per minute, once the burst is spent.
    rate: u32,
    /// Messages admitted back to back.
    burst: u32,
    state: Mutex<RlState>,
}

impl RateLimit {
    pub const fn new(rate: u32, burst: u32) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(RlState { tokens: 0, last_fill: None }),
        }
    }

    /// Returns true if the caller should suppress its message. Never
    /// blocks beyond the internal mutex.
    pub fn should_drop(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        let now = Instant::now();

        match st.last_fill.replace(now) {
            // First use starts with a full bucket.
            None => st.tokens = u64::from(self.burst) * TOKEN_COST,
            Some(last) => {
                let elapsed_ms =
                    u64::try_from(now.duration_since(last).as_millis())
                        .unwrap_or(u64::MAX);
                st.tokens = st
                    .tokens
                    .saturating_add(
                        elapsed_ms.saturating_mul(u64::from(self.rate)),
                    )
                    .min(u64::from(self.burst) * TOKEN_COST);
            }
        }

        if st.tokens >= TOKEN_COST {
            st.tokens -= TOKEN_COST;
            false
        } else {
            true
        }
    }
}
