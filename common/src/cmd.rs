// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities used by command-line executables.

/// Process exit code for a normal, operator-requested shutdown.
pub const EXIT_CODE_SHUTDOWN: i32 = 0;

/// Process exit code telling the supervisor to relaunch us immediately.
///
/// Completing a bootstrap step (finalizing a node, self-signing a brand-new
/// root of trust) deliberately ends the process so the next launch starts
/// from the persisted state. The supervisor must treat this code as "restart
/// now", not as a crash.
pub const EXIT_CODE_RESTART: i32 = 14;

/// Exit code for a usage error (bad arguments).
pub const EXIT_CODE_USAGE: i32 = 2;

/// Exit code for a fatal runtime failure.
pub const EXIT_CODE_FAILURE: i32 = 1;

/// An error produced by a command-line executable.
#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    /// The arguments didn't make sense.
    #[error("{0}")]
    Usage(String),
    /// The command was well-formed but failed.
    #[error("{0}")]
    Failure(String),
}

/// Report a fatal error and exit with the matching code.
pub fn fatal(error: CmdError) -> ! {
    let (code, message) = match &error {
        CmdError::Usage(m) => (EXIT_CODE_USAGE, m),
        CmdError::Failure(m) => (EXIT_CODE_FAILURE, m),
    };
    let arg0_owned = std::env::args().next().unwrap_or_else(|| "warden".into());
    let arg0 = arg0_owned.rsplit('/').next().unwrap_or(&arg0_owned);
    eprintln!("{}: {}", arg0, message);
    std::process::exit(code);
}
