//! Single-threaded reactor over the slot pool.
//!
//! The reactor waits on every slot's completion signal and the stop signal
//! at once, then advances exactly one signaled slot per wake. Fatal slot
//! errors end the loop; disconnects never leave the slot layer.
//!
//! # Wait Model
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ select! (biased)                               │
//! │   stop signal ───────────────► exit            │
//! │   select_all(slot[0..N].wait()) ─► advance(i)  │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! The waits are rebuilt on every iteration; slots that did not fire lose
//! nothing because every endpoint wait is cancellation safe.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::select_all;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{Error, Result};

use super::endpoint::Endpoint;
use super::slot::{RequestHandler, Signal, Slot};
use super::stats::Counters;

// ============================================================================
// Types
// ============================================================================

/// What ended a multi-source wait.
enum Wake<C> {
    /// The stop signal fired (or its sender went away).
    Stop,
    /// Slot `index` fired with `signal`.
    Slot(usize, Signal<C>),
}

// ============================================================================
// Reactor
// ============================================================================

/// Owns the slot pool for one server run.
pub(crate) struct Reactor<E: Endpoint> {
    slots: Vec<Slot<E>>,
    handler: RequestHandler,
}

impl<E: Endpoint> Reactor<E> {
    /// Wraps each endpoint instance in a slot and submits its first accept.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `endpoints` is empty
    /// - Any fatal error from arming a slot
    pub(crate) fn new(
        endpoints: Vec<E>,
        max_message_size: usize,
        handler: RequestHandler,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::config("at least one endpoint instance is required"));
        }

        let mut slots: Vec<Slot<E>> = endpoints
            .into_iter()
            .enumerate()
            .map(|(index, endpoint)| {
                Slot::new(index, endpoint, max_message_size, Arc::clone(&counters))
            })
            .collect();

        for slot in &mut slots {
            slot.arm()?;
        }

        debug!(instances = slots.len(), "Slots armed");

        Ok(Self { slots, handler })
    }

    /// Number of slots in the pool.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Runs until stopped or until a slot raises a fatal error.
    pub(crate) async fn run(
        &mut self,
        stop_rx: &mut oneshot::Receiver<()>,
        stop_requested: &AtomicBool,
    ) -> Result<()> {
        debug!("Reactor loop started");

        loop {
            let wake = self.wait_any(stop_rx).await;

            if stop_requested.load(Ordering::Acquire) {
                break;
            }

            match wake {
                Wake::Stop => break,
                Wake::Slot(index, signal) => {
                    if let Err(e) = self.slots[index].advance(signal, &self.handler) {
                        error!(slot = index, error = %e, "Fatal slot error");
                        return Err(e);
                    }
                }
            }
        }

        debug!("Reactor loop terminated");
        Ok(())
    }

    /// Blocks until any slot's signal or the stop signal fires.
    async fn wait_any(&self, stop_rx: &mut oneshot::Receiver<()>) -> Wake<E::Client> {
        let waits = self.slots.iter().map(|slot| Box::pin(slot.wait()));

        tokio::select! {
            biased;

            _ = stop_rx => Wake::Stop,

            (signal, index, _) = select_all(waits) => Wake::Slot(index, signal),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::transport::endpoint::Submission;
    use crate::transport::slot::SlotState;
    use crate::transport::slot::tests::ScriptedEndpoint;

    fn echo_handler() -> RequestHandler {
        Arc::new(|request: &[u8], response: &mut [u8]| {
            response[..request.len()].copy_from_slice(request);
            request.len()
        })
    }

    fn reactor(endpoints: Vec<ScriptedEndpoint>) -> Result<Reactor<ScriptedEndpoint>> {
        Reactor::new(endpoints, 32, echo_handler(), Arc::new(Counters::default()))
    }

    #[test]
    fn test_new_arms_every_slot() {
        let reactor = reactor(vec![
            ScriptedEndpoint::default(),
            ScriptedEndpoint::default(),
            ScriptedEndpoint::default(),
        ])
        .expect("reactor should build");

        assert_eq!(reactor.len(), 3);
        for slot in &reactor.slots {
            assert_eq!(slot.state(), SlotState::Connecting);
            assert!(slot.is_pending());
        }
    }

    #[test]
    fn test_new_rejects_empty_pool() {
        let result = reactor(Vec::new());
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_new_fails_on_synchronous_accept() {
        let mut bad = ScriptedEndpoint::default();
        bad.accepts.push_back(Ok(Submission::Completed));

        let result = reactor(vec![ScriptedEndpoint::default(), bad]);
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_run_returns_on_stop_signal() {
        let mut stalled = ScriptedEndpoint::default();
        stalled.stall = true;
        let mut reactor = reactor(vec![stalled]).expect("reactor should build");

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let flag = Arc::clone(&stop_requested);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::Release);
            let _ = stop_tx.send(());
        });

        reactor
            .run(&mut stop_rx, &stop_requested)
            .await
            .expect("stop should end the loop cleanly");
    }

    #[tokio::test]
    async fn test_run_returns_when_stop_sender_dropped() {
        let mut stalled = ScriptedEndpoint::default();
        stalled.stall = true;
        let mut reactor = reactor(vec![stalled]).expect("reactor should build");

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        drop(stop_tx);

        reactor
            .run(&mut stop_rx, &AtomicBool::new(false))
            .await
            .expect("dropped sender should end the loop");
    }

    #[tokio::test]
    async fn test_fatal_slot_error_ends_loop() {
        let mut stalled = ScriptedEndpoint::default();
        stalled.stall = true;
        let mut failing = ScriptedEndpoint::default();
        failing.fail_accept = true;
        let mut reactor = reactor(vec![stalled, failing]).expect("reactor should build");

        let (_stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let err = reactor
            .run(&mut stop_rx, &AtomicBool::new(false))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Accept { slot: 1, .. }));
    }

    #[tokio::test]
    async fn test_disconnect_does_not_end_loop() {
        // Slot 1 disconnects once, is re-armed, then its next accept fails
        // fatally; reaching that failure proves the disconnect was absorbed.
        let mut stalled = ScriptedEndpoint::default();
        stalled.stall = true;
        let mut flaky = ScriptedEndpoint::default();
        flaky.reads.push_back(Ok(Vec::new()));
        flaky.accepts.push_back(Ok(Submission::Connected));
        flaky.fail_accept = true;
        let mut reactor = reactor(vec![stalled, flaky]).expect("reactor should build");

        let (_stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let err = reactor
            .run(&mut stop_rx, &AtomicBool::new(false))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Accept { slot: 1, .. }));
        assert_eq!(reactor.slots[1].state(), SlotState::Connecting);
    }
}
