//! Bounded-concurrency gate for outbound sends.
//!
//! Limits the number of simultaneously in-flight sends on a transport. A
//! waiter that is cancelled while blocked never consumes a permit it did
//! not receive: acquisition goes through `Semaphore::acquire_owned`, which
//! releases nothing unless it actually returned a permit.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Error;

#[derive(Clone)]
pub struct SendGate {
    semaphore: Arc<Semaphore>,
}

/// Holds one in-flight-send slot; released on drop.
pub struct SendPermit {
    _permit: OwnedSemaphorePermit,
}

impl SendGate {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<SendPermit, Error> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::NotConnected)?;
        Ok(SendPermit { _permit: permit })
    }

    /// Slots currently free. Mostly useful for leak checks in tests.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_returned_on_drop() {
        let gate = SendGate::new(2);
        let first = gate.acquire().await.unwrap();
        let second = gate.acquire().await.unwrap();
        assert_eq!(gate.available(), 0);

        drop(first);
        assert_eq!(gate.available(), 1);
        drop(second);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn a_cancelled_waiter_does_not_leak_a_permit() {
        let gate = SendGate::new(1);
        let held = gate.acquire().await.unwrap();

        // This waiter blocks on the gate, then is cancelled while
        // suspended.
        let blocked = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire().await;
                std::future::pending::<()>().await;
            })
        };
        tokio::task::yield_now().await;
        blocked.abort();
        let _ = blocked.await;

        // The only permit is still accounted for by `held`, and comes
        // back in full once released.
        drop(held);
        for _ in 0..100 {
            if gate.available() == 1 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("permit leaked after cancellation");
    }
}
