//! Process-wide single-flight gate for the render executable.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::RenderError;

/// At most one [`RenderPermit`] exists at a time. Acquisition never waits.
#[derive(Debug, Clone, Default)]
pub struct RenderLock {
    holder: Arc<Mutex<Option<String>>>,
}

impl RenderLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `job_id`, or fails with [`RenderError::Busy`]
    /// naming the current holder.
    pub fn try_acquire(&self, job_id: &str) -> Result<RenderPermit, RenderError> {
        let mut holder = self.slot();
        if let Some(current) = holder.as_ref() {
            return Err(RenderError::Busy {
                holder: current.clone(),
            });
        }
        *holder = Some(job_id.to_string());
        Ok(RenderPermit {
            holder: Arc::clone(&self.holder),
            job_id: job_id.to_string(),
        })
    }

    /// Job currently holding the lock, if any.
    pub fn holder(&self) -> Option<String> {
        self.slot().clone()
    }

    fn slot(&self) -> MutexGuard<'_, Option<String>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct RenderPermit {
    holder: Arc<Mutex<Option<String>>>,
    job_id: String,
}

impl RenderPermit {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for RenderPermit {
    fn drop(&mut self) {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if holder.as_deref() == Some(self.job_id.as_str()) {
            *holder = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_fast() {
        let lock = RenderLock::new();
        let permit = lock.try_acquire("a").unwrap();
        assert_eq!(permit.job_id(), "a");

        let err = lock.try_acquire("b").unwrap_err();
        assert!(matches!(err, RenderError::Busy { ref holder } if holder == "a"));
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn drop_releases() {
        let lock = RenderLock::new();
        drop(lock.try_acquire("a").unwrap());
        assert!(lock.holder().is_none());
        assert!(lock.try_acquire("b").is_ok());
    }

    #[test]
    fn clones_share_state() {
        let lock = RenderLock::new();
        let other = lock.clone();
        let _permit = lock.try_acquire("a").unwrap();
        assert_eq!(other.holder().as_deref(), Some("a"));
        assert!(other.try_acquire("b").is_err());
    }
}
