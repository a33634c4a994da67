// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::error::Error;
use std::fmt;

use crate::bind::BindError;
use crate::config::ConfigError;

type BoxError = Box<dyn Error + Send + Sync>;

/// Failures that abort namespace assembly.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("CPUD:{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    pub(crate) fn transport(context: &'static str, source: impl Into<BoxError>) -> Self {
        SessionError::Transport { context, source: source.into() }
    }
}

/// Bind mounts that failed while the session went ahead without them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OverlayWarning {
    failures: Vec<String>,
}

impl OverlayWarning {
    pub(crate) fn push(&mut self, failure: String) {
        self.failures.push(failure);
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for OverlayWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.failures.join("\n"))
    }
}

impl Error for OverlayWarning {}
