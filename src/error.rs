//! Typed domain error enums.
//!
//! Only failures the pipeline branches on get a variant here; everything else
//! is wrapped with `anyhow::Context` at the call site and propagated unchanged.

use thiserror::Error;

/// Errors from the bounded readiness poller.
#[derive(Debug, Error)]
pub enum PollError {
    /// The condition never became true within the attempt cap.
    #[error("timed out after {attempts} attempts: {hint}")]
    TimedOut { attempts: u32, hint: &'static str },

    /// The status query itself failed or produced unparseable output.
    /// Never retried - a broken status source is not an eventual-consistency
    /// condition.
    #[error(transparent)]
    Check(#[from] anyhow::Error),
}

/// Errors from the two-phase Dragon Net verification.
///
/// `RegistrationNotFound` and `Unreachable` are distinct variants (not
/// message prefixes) because the caller's remediation branch keys on exactly
/// one of them.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Phase 1 never returned 200 within the retry cap. The chain may still
    /// work locally, but Dragon Net support will not.
    #[error(
        "registration could not be found for this chain. The chain may be installed and \
         working locally, but Dragon Net support will not work. Check the logs of the \
         transaction processor for more details"
    )]
    RegistrationNotFound,

    /// Phase 1 succeeded but phase 2 reported the chain unreachable from the
    /// public internet. `detail` is the matchmaking response body.
    #[error(
        "although registered, Dragon Net reports that the chain is not reachable \
         (did you port-forward correctly?): {detail}"
    )]
    Unreachable { detail: String },

    /// Could not talk to the matchmaking service at all.
    #[error("error communicating with matchmaking: {0:#}")]
    Transport(#[source] anyhow::Error),
}
