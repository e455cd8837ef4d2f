//! drydock ops: incremental patches and run-to-completion pods.

#![forbid(unsafe_code)]

use tokio::sync::oneshot;

pub mod patch;
pub mod poll;
pub mod run;

pub use patch::{apply_patch, build as build_patch, Mutation, PatchError, PatchPayload};
pub use poll::{poll_until, Check, PollError};
pub use run::{delete_pod, JobRunner, RunError, RunSession, RunState, RunnerConfig};

/// Cancellation handle for an in-flight operation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}
