use std::future::Future;

use tokio::sync::Semaphore;

use super::PoolError;

/// A counting pool of admission slots.
///
/// Permits taken from the pool are consumed: they only come back through
/// [`PermitPool::release`], which the refill job calls once per window. At every
/// observation point `available() <= capacity()`.
pub trait PermitPool: Send + Sync + 'static {
    /// Builds a full pool.
    fn with_capacity(capacity: usize) -> Self
    where
        Self: Sized;

    fn capacity(&self) -> usize;

    fn available(&self) -> usize;

    /// Takes a permit if one is immediately available.
    fn try_acquire(&self) -> bool;

    /// Waits until a permit is available and takes it. Fails only once the pool
    /// has been closed.
    fn acquire(&self) -> impl Future<Output = Result<(), PoolError>> + Send + '_;

    /// Returns one permit to the pool.
    fn release(&self) -> Result<(), PoolError>;

    /// Wakes every waiting acquirer with [`PoolError::Closed`]. Closed pools
    /// neither grant nor accept permits.
    fn close(&self);
}

/// [`PermitPool`] backed by a tokio semaphore.
#[derive(Debug)]
pub struct SemaphorePool {
    capacity: usize,
    semaphore: Semaphore,
}

impl PermitPool for SemaphorePool {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            semaphore: Semaphore::new(capacity),
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn try_acquire(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    fn acquire(&self) -> impl Future<Output = Result<(), PoolError>> + Send + '_ {
        async move {
            let permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| PoolError::Closed)?;
            permit.forget();
            Ok(())
        }
    }

    // Only the refill job releases, so the check-then-add below cannot overshoot:
    // concurrent acquirers can only lower `available` in between.
    fn release(&self) -> Result<(), PoolError> {
        if self.semaphore.is_closed() {
            return Err(PoolError::Closed);
        }
        if self.semaphore.available_permits() >= self.capacity {
            return Err(PoolError::Overflow {
                capacity: self.capacity,
            });
        }
        self.semaphore.add_permits(1);
        Ok(())
    }

    fn close(&self) {
        self.semaphore.close();
    }
}
