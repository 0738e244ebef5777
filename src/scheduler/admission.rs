use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Semaphore, TryAcquireError};

use crate::error::{PoolError, Result};

/// Backpressure for producers.
///
/// The bounded pool consumes one slot per queued job and returns it when the
/// job is done. The cluster variant admits everything.
#[derive(Debug)]
pub(crate) enum Admission {
    Unbounded,
    Slots {
        semaphore: Semaphore,
        capacity: usize,
        /// Slots handed out and not yet returned
        outstanding: AtomicUsize,
    },
}

impl Admission {
    pub fn bounded(capacity: usize) -> Self {
        Admission::Slots {
            semaphore: Semaphore::new(capacity),
            capacity,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Waits for a free slot. Fails once the admission has been closed.
    pub async fn acquire(&self) -> Result<()> {
        if let Admission::Slots {
            semaphore,
            outstanding,
            ..
        } = self
        {
            let permit = semaphore
                .acquire()
                .await
                .map_err(|_| PoolError::AlreadyShutdown)?;
            permit.forget();
            outstanding.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Result<bool> {
        match self {
            Admission::Unbounded => Ok(true),
            Admission::Slots {
                semaphore,
                outstanding,
                ..
            } => match semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    outstanding.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
                Err(TryAcquireError::NoPermits) => Ok(false),
                Err(TryAcquireError::Closed) => Err(PoolError::AlreadyShutdown),
            },
        }
    }

    /// Returns one slot. Extra releases are ignored so the capacity never grows.
    pub fn release(&self) {
        if let Admission::Slots {
            semaphore,
            outstanding,
            ..
        } = self
        {
            let returned = outstanding
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if returned {
                semaphore.add_permits(1);
            }
        }
    }

    /// Wakes blocked producers with `AlreadyShutdown`.
    pub fn close(&self) {
        if let Admission::Slots { semaphore, .. } = self {
            semaphore.close();
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        match self {
            Admission::Unbounded => None,
            Admission::Slots { capacity, .. } => Some(*capacity),
        }
    }

    pub fn outstanding(&self) -> usize {
        match self {
            Admission::Unbounded => 0,
            Admission::Slots { outstanding, .. } => outstanding.load(Ordering::SeqCst),
        }
    }
}

/// Returns a slot when dropped, whatever happens in between.
pub(crate) struct SlotGuard<'a>(pub &'a Admission);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slots_are_bounded() {
        let admission = Admission::bounded(2);
        admission.acquire().await.unwrap();
        assert!(admission.try_acquire().unwrap());
        assert!(!admission.try_acquire().unwrap());
        assert_eq!(admission.outstanding(), 2);

        admission.release();
        assert!(admission.try_acquire().unwrap());
    }

    #[tokio::test]
    async fn test_extra_releases_are_ignored() {
        let admission = Admission::bounded(1);
        admission.release();
        admission.release();

        admission.acquire().await.unwrap();
        assert!(!admission.try_acquire().unwrap());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let admission = std::sync::Arc::new(Admission::bounded(1));
        admission.acquire().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        admission.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(PoolError::AlreadyShutdown)));
        assert!(matches!(
            admission.try_acquire(),
            Err(PoolError::AlreadyShutdown)
        ));
    }

    #[tokio::test]
    async fn test_unbounded_always_admits() {
        let admission = Admission::Unbounded;
        for _ in 0..100 {
            admission.acquire().await.unwrap();
        }
        assert!(admission.try_acquire().unwrap());
        assert_eq!(admission.capacity(), None);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let admission = Admission::bounded(1);
        assert!(admission.try_acquire().unwrap());
        {
            let _guard = SlotGuard(&admission);
        }
        assert_eq!(admission.outstanding(), 0);
        assert!(admission.try_acquire().unwrap());
    }
}
