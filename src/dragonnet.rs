//! Dragon Net matchmaking verification.
//!
//! Two phases against the matchmaking service: first confirm the chain
//! managed to register at all (retried, registration propagates from the
//! transaction processor), then ask matchmaking to dial the chain's broadcast
//! endpoint from the outside. The phases fail differently, so each gets its
//! own [`VerifyError`] variant.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::{PollError, VerifyError};
use crate::poll;

/// Base URL of the Dragon Net matchmaking service.
pub const MATCHMAKING_URL: &str = "https://matchmaking.api.dragonchain.com";

/// Attempt cap for the registration check (1s interval).
pub const REGISTRATION_ATTEMPTS: u32 = 30;

/// Abstraction over the matchmaking HTTP API.
#[allow(async_fn_in_trait)]
pub trait Matchmaking {
    /// `GET /registration/{public_id}`; returns the HTTP status code.
    async fn registration_status(&self, public_id: &str) -> Result<u16>;

    /// `GET /registration/verify/{public_id}?source=installscript`; returns
    /// the HTTP status code and response body.
    async fn reachability(&self, public_id: &str) -> Result<(u16, String)>;
}

/// Production implementation backed by reqwest.
pub struct HttpMatchmaking {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMatchmaking {
    /// Client against the production matchmaking service.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base_url(MATCHMAKING_URL)
    }

    /// Client against an arbitrary base URL (used in tests).
    #[must_use]
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }
}

impl Default for HttpMatchmaking {
    fn default() -> Self {
        Self::new()
    }
}

impl Matchmaking for HttpMatchmaking {
    async fn registration_status(&self, public_id: &str) -> Result<u16> {
        let response = self
            .client
            .get(format!("{}/registration/{public_id}", self.base_url))
            .send()
            .await
            .context("requesting registration status")?;
        Ok(response.status().as_u16())
    }

    async fn reachability(&self, public_id: &str) -> Result<(u16, String)> {
        let response = self
            .client
            .get(format!(
                "{}/registration/verify/{public_id}?source=installscript",
                self.base_url
            ))
            .send()
            .await
            .context("requesting reachability verification")?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .context("reading matchmaking response body")?;
        Ok((status, body))
    }
}

/// Phase 1: wait for the chain's registration to appear in matchmaking.
///
/// # Errors
///
/// [`VerifyError::RegistrationNotFound`] after [`REGISTRATION_ATTEMPTS`]
/// non-200 answers, [`VerifyError::Transport`] if the service cannot be
/// reached.
pub async fn verify_registration(
    api: &impl Matchmaking,
    public_id: &str,
    max_attempts: u32,
    interval: Duration,
) -> Result<(), VerifyError> {
    let result = poll::wait_until(max_attempts, interval, "registration", move || async move {
        let status = api.registration_status(public_id).await?;
        Ok((status == 200).then_some(()))
    })
    .await;
    match result {
        Ok(()) => Ok(()),
        Err(PollError::TimedOut { .. }) => Err(VerifyError::RegistrationNotFound),
        Err(PollError::Check(e)) => Err(VerifyError::Transport(e)),
    }
}

/// Phase 2: ask matchmaking to dial the chain from the public internet.
/// Not retried; an unreachable endpoint stays unreachable until something
/// about the network changes.
///
/// # Errors
///
/// [`VerifyError::Unreachable`] with the matchmaking response body on a
/// non-200 answer, [`VerifyError::Transport`] if the service cannot be
/// reached.
pub async fn verify_reachability(
    api: &impl Matchmaking,
    public_id: &str,
) -> Result<(), VerifyError> {
    let (status, body) = api
        .reachability(public_id)
        .await
        .map_err(VerifyError::Transport)?;
    if status == 200 {
        Ok(())
    } else {
        Err(VerifyError::Unreachable { detail: body })
    }
}

/// Full two-phase verification.
///
/// # Errors
///
/// The first phase's error, or the second's.
pub async fn verify(
    api: &impl Matchmaking,
    public_id: &str,
    interval: Duration,
) -> Result<(), VerifyError> {
    verify_registration(api, public_id, REGISTRATION_ATTEMPTS, interval).await?;
    verify_reachability(api, public_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::test_support::MockMatchmaking;

    #[tokio::test]
    async fn both_phases_passing_verifies() {
        let api = MockMatchmaking::new(vec![200], vec![(200, String::new())]);
        verify(&api, "pubid", Duration::ZERO).await.expect("verified");
        assert_eq!(api.registration_queries(), 1);
        assert_eq!(api.reachability_queries(), 1);
    }

    #[tokio::test]
    async fn registration_retries_until_found() {
        let api = MockMatchmaking::new(vec![404, 404, 200], vec![(200, String::new())]);
        verify(&api, "pubid", Duration::ZERO).await.expect("verified");
        assert_eq!(api.registration_queries(), 3);
    }

    #[tokio::test]
    async fn registration_cap_yields_not_found() {
        let api = MockMatchmaking::new(vec![404; 40], vec![]);
        let err = verify(&api, "pubid", Duration::ZERO)
            .await
            .expect_err("should fail");
        assert!(matches!(err, VerifyError::RegistrationNotFound));
        assert_eq!(api.registration_queries(), REGISTRATION_ATTEMPTS as usize);
        // Phase 2 must never run when phase 1 fails.
        assert_eq!(api.reachability_queries(), 0);
    }

    #[tokio::test]
    async fn unreachable_carries_response_body() {
        let api = MockMatchmaking::new(
            vec![200],
            vec![(400, "connection timed out".to_owned())],
        );
        let err = verify(&api, "pubid", Duration::ZERO)
            .await
            .expect_err("should fail");
        match err {
            VerifyError::Unreachable { detail } => assert_eq!(detail, "connection timed out"),
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_is_not_retried() {
        let api = MockMatchmaking::failing();
        let err = verify(&api, "pubid", Duration::ZERO)
            .await
            .expect_err("should fail");
        assert!(matches!(err, VerifyError::Transport(_)));
        assert_eq!(api.registration_queries(), 1);
    }
}
