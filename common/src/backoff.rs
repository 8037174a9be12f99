// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Return a backoff policy for contacting cluster peers which may not be up
/// for a relatively long amount of time.
pub fn peer_service_policy() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(250);
    const MAX_INTERVAL: Duration = Duration::from_secs(60);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, None)
}

/// Return a backoff policy for local collaborators (the orchestration
/// platform, the identity store) which are expected to answer quickly.
pub fn local_service_policy() -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(50);
    const MAX_INTERVAL: Duration = Duration::from_secs(1);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, None)
}

/// Like [`peer_service_policy`], but gives up after `max_elapsed`.
pub fn peer_service_policy_bounded(
    max_elapsed: Duration,
) -> ::backoff::ExponentialBackoff {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(250);
    const MAX_INTERVAL: Duration = Duration::from_secs(60);
    policy_with_max(INITIAL_INTERVAL, MAX_INTERVAL, Some(max_elapsed))
}

fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed_time: Option<Duration>,
) -> ::backoff::ExponentialBackoff {
    let current_interval = initial_interval;
    ::backoff::ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time,
        ..::backoff::ExponentialBackoff::default()
    }
}
