//! Per-query execution context

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Limits and knobs for one query
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Memory ceiling for Sort and Aggregate, in bytes
    pub memory_limit: usize,
    pub spill_enabled: bool,
    pub spill_dir: Option<PathBuf>,
    /// Rows per batch emitted by Sort and Aggregate
    pub batch_rows: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ExecOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            memory_limit: config.sort_memory_limit,
            spill_enabled: config.spill_enabled,
            spill_dir: config.spill_dir.clone(),
            batch_rows: config.page_rows.max(1),
        }
    }
}

/// Cancellation and deadline shared by every operator of one query
#[derive(Debug, Clone)]
pub struct ExecContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    options: ExecOptions,
}

impl ExecContext {
    pub fn new(options: ExecOptions) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            options,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn options(&self) -> &ExecOptions {
        &self.options
    }

    /// Fail if the query was cancelled or ran past its deadline
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_and_deadline() {
        let ctx = ExecContext::new(ExecOptions::default());
        assert!(ctx.check().is_ok());
        ctx.token().cancel();
        assert!(matches!(ctx.check(), Err(Error::Cancelled)));

        let ctx = ExecContext::new(ExecOptions::default()).with_timeout(Some(Duration::ZERO));
        assert!(matches!(ctx.check(), Err(Error::DeadlineExceeded)));
    }
}
