//! Teardown Stack
//!
//! Release actions are pushed as resources are acquired and run last-in,
//! first-out. A failing action never stops the ones after it.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

type Action = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Every failure from one [`TeardownStack::close`] run
#[derive(Debug)]
pub struct TeardownError {
    pub failures: Vec<(String, anyhow::Error)>,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} teardown step(s) failed: ", self.failures.len())?;
        for (i, (label, error)) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {:#}", label, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {}

/// LIFO list of release actions
#[derive(Default)]
pub struct TeardownStack {
    actions: Mutex<Vec<(String, Action)>>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the release of a just-acquired resource
    pub fn push<F>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let label = label.into();
        debug!("Registered teardown step '{}'", label);
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((label, Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every action in reverse registration order. The stack is empty
    /// afterwards, so a second call is a no-op.
    pub fn close(&self) -> Result<(), TeardownError> {
        let actions = std::mem::take(
            &mut *self
                .actions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let mut failures = Vec::new();
        for (label, action) in actions.into_iter().rev() {
            debug!("Running teardown step '{}'", label);
            if let Err(e) = action() {
                warn!("Teardown step '{}' failed: {:#}", label, e);
                failures.push((label, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }
}

impl fmt::Debug for TeardownStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownStack")
            .field("pending", &self.len())
            .finish()
    }
}
