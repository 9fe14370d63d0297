//! Step-by-step install progress reporting.
//!
//! Provisioning functions take a [`ProgressReporter`] instead of printing
//! directly, so tests can run them silently and capture what was reported.

use owo_colors::OwoColorize as _;

use super::{OutputContext, Styles};

/// Receives one line per notable install step.
pub trait ProgressReporter {
    /// Report a step of the install.
    fn step(&self, msg: &str);
}

/// Prints steps to stdout with the shared stylesheet.
pub struct ConsoleReporter {
    styles: Styles,
    quiet: bool,
}

impl ConsoleReporter {
    #[must_use]
    pub fn new(output: &OutputContext) -> Self {
        Self {
            styles: output.styles.clone(),
            quiet: output.quiet,
        }
    }
}

impl ProgressReporter for ConsoleReporter {
    fn step(&self, msg: &str) {
        if !self.quiet {
            println!("  {} {msg}", "•".style(self.styles.info));
        }
    }
}
