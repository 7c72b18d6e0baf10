//! Settlement handles for enqueued mutations.

use crate::error::{EngineError, EngineResult};
use crate::remote::ServerEntity;
use driftsync_core::MutationId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// A handle that settles when its mutation reaches `Committed` or `Failed`.
///
/// The caller of `enqueue_mutation` receives this alongside the immediate
/// optimistic value. Transient failures never settle the handle - only a
/// commit or a permanent rejection does.
pub struct SettledHandle {
    rx: Receiver<EngineResult<ServerEntity>>,
}

impl SettledHandle {
    /// Blocks until the mutation settles.
    ///
    /// # Errors
    ///
    /// Returns the rejection for a permanently failed mutation,
    /// [`EngineError::Cancelled`] for a cancelled one, or
    /// [`EngineError::ShutDown`] if the engine was dropped first.
    pub fn wait(self) -> EngineResult<ServerEntity> {
        self.rx.recv().unwrap_or(Err(EngineError::ShutDown))
    }

    /// Blocks until the mutation settles or the timeout elapses.
    ///
    /// Returns `None` on timeout; the handle stays usable.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<EngineResult<ServerEntity>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(EngineError::ShutDown)),
        }
    }

    /// Returns the outcome if the mutation has already settled.
    pub fn try_settled(&self) -> Option<EngineResult<ServerEntity>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(EngineError::ShutDown)),
        }
    }
}

/// Tracks the settlement channel for every unsettled mutation.
///
/// Records recovered from a previous process have no waiting caller; their
/// settlement is a no-op.
#[derive(Default)]
pub(crate) struct Settlements {
    senders: Mutex<HashMap<MutationId, Sender<EngineResult<ServerEntity>>>>,
}

impl Settlements {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a handle for a newly enqueued mutation.
    pub(crate) fn register(&self, id: MutationId) -> SettledHandle {
        let (tx, rx) = mpsc::channel();
        self.senders.lock().insert(id, tx);
        SettledHandle { rx }
    }

    /// Settles a mutation, delivering the outcome to its waiting caller.
    pub(crate) fn settle(&self, id: MutationId, result: EngineResult<ServerEntity>) {
        if let Some(tx) = self.senders.lock().remove(&id) {
            let _ = tx.send(result);
        }
    }

    /// Drops the sender for a registration that never became durable.
    ///
    /// The matching handle reports [`EngineError::ShutDown`] if waited on.
    pub(crate) fn forget(&self, id: MutationId) {
        self.senders.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settle_delivers_outcome() {
        let settlements = Settlements::new();
        let id = MutationId::new_v4();
        let handle = settlements.register(id);

        settlements.settle(id, Ok(json!({"id": "srv-1"})));
        assert_eq!(handle.wait().unwrap(), json!({"id": "srv-1"}));
    }

    #[test]
    fn try_settled_before_settlement() {
        let settlements = Settlements::new();
        let handle = settlements.register(MutationId::new_v4());
        assert!(handle.try_settled().is_none());
    }

    #[test]
    fn wait_timeout_elapses() {
        let settlements = Settlements::new();
        let handle = settlements.register(MutationId::new_v4());
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn dropped_engine_surfaces_shutdown() {
        let settlements = Settlements::new();
        let handle = settlements.register(MutationId::new_v4());
        drop(settlements);

        assert!(matches!(handle.wait(), Err(EngineError::ShutDown)));
    }

    #[test]
    fn forgotten_registration_disconnects_handle() {
        let settlements = Settlements::new();
        let id = MutationId::new_v4();
        let handle = settlements.register(id);

        settlements.forget(id);
        assert!(matches!(
            handle.try_settled(),
            Some(Err(EngineError::ShutDown))
        ));
    }

    #[test]
    fn settle_unknown_id_is_noop() {
        let settlements = Settlements::new();
        settlements.settle(MutationId::new_v4(), Ok(json!({})));
    }
}
