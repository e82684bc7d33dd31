//! Background drain thread for in-process sessions
//!
//! Passes are paced by a `crossbeam_channel::tick`; a stop channel or the
//! session's shutdown flag ends the loop, after which the worker finalizes.

use super::worker::{DrainReport, DrainWorker};
use crate::clock;
use crate::domain::SessionError;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, error};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug)]
pub struct DrainThread {
    stop_tx: Sender<()>,
    handle: JoinHandle<Result<DrainReport, SessionError>>,
}

impl DrainThread {
    pub fn spawn(mut worker: DrainWorker) -> Result<Self, SessionError> {
        let interval = Duration::from_millis(worker.session().config().drain.poll_interval_ms);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("ada-drain".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if let Err(e) = worker.run_pass(clock::now_ns()) {
                                error!("drain pass failed: {e}");
                                return Err(e);
                            }
                            if worker.session().control().shutdown_requested() {
                                debug!("drain saw shutdown flag");
                                break;
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                worker.finalize(clock::now_ns())
            })
            .map_err(|e| SessionError::Trace(e.into()))?;
        Ok(Self { stop_tx, handle })
    }

    /// Stop after the current pass, finalize and return the report
    pub fn stop(self) -> Result<DrainReport, SessionError> {
        // The thread may already have exited on the shutdown flag
        let _ = self.stop_tx.try_send(());
        self.handle.join().map_err(|_| SessionError::DrainPanicked)?
    }
}
