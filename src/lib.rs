//! Dragonchain installer library.
//!
//! The binary in `main.rs` is a thin wrapper; everything lives here so the
//! provisioning pipeline can be exercised with test doubles.

#![cfg_attr(test, allow(clippy::expect_used))]

pub mod cli;
pub mod command_runner;
pub mod config;
pub mod dragonnet;
pub mod error;
pub mod helm;
pub mod installer;
pub mod kubectl;
pub mod minikube;
pub mod output;
pub mod poll;
pub mod provision;
pub mod secrets;
pub mod upnp;
