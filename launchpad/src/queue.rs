//! Deployment request queue and dispatcher.
//!
//! `submit` persists a pending run and enqueues a [`DeploymentEvent`]; the
//! dispatcher task turns each event into one engine execution, bounded by
//! `max_concurrent_runs`. Delivery is at-least-once: redelivered events
//! for finished runs are no-ops in the engine.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::WorkflowEngine;
use crate::error::{PipelineError, Result};
use crate::model::DeploymentRequest;
use crate::runid::RunId;

/// Trigger for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentEvent {
    pub run_id: RunId,
}

#[derive(Clone)]
pub struct DeploymentRequestQueue {
    engine: Arc<WorkflowEngine>,
    tx: mpsc::UnboundedSender<DeploymentEvent>,
}

impl DeploymentRequestQueue {
    /// Create the queue and spawn its dispatcher. The dispatcher stops
    /// taking events when `shutdown` fires and waits for in-flight runs.
    pub fn start(
        engine: Arc<WorkflowEngine>,
        max_concurrent_runs: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(
            engine.clone(),
            rx,
            Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            shutdown,
        ));
        (Self { engine, tx }, dispatcher)
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Accept a request and return its tracking id.
    pub fn submit(&self, request: DeploymentRequest) -> Result<RunId> {
        request.validate()?;
        let run_id = RunId::generate();
        self.engine.store().insert_run(&run_id, &request)?;
        info!(run_id = %run_id, project = %request.project_name, "deployment accepted");
        self.enqueue(run_id.clone())?;
        Ok(run_id)
    }

    /// Deliver the trigger for an existing run again.
    pub fn redeliver(&self, run_id: &RunId) -> Result<()> {
        if self.engine.store().load(run_id)?.is_none() {
            return Err(PipelineError::UnknownRun(run_id.to_string()));
        }
        debug!(run_id = %run_id, "redelivering");
        self.enqueue(run_id.clone())
    }

    /// Re-enqueue every run that has not reached a terminal status.
    pub fn resume_pending(&self) -> Result<usize> {
        let unfinished = self.engine.store().unfinished()?;
        for run_id in &unfinished {
            self.enqueue(run_id.clone())?;
        }
        if !unfinished.is_empty() {
            info!(count = unfinished.len(), "resuming unfinished runs");
        }
        Ok(unfinished.len())
    }

    pub fn cancel(&self, run_id: &RunId) -> Result<bool> {
        self.engine.cancel(run_id)
    }

    fn enqueue(&self, run_id: RunId) -> Result<()> {
        self.tx
            .send(DeploymentEvent { run_id })
            .map_err(|e| PipelineError::Cancelled(format!("dispatcher stopped, dropped {}", e.0.run_id)))
    }
}

async fn dispatch(
    engine: Arc<WorkflowEngine>,
    mut rx: mpsc::UnboundedReceiver<DeploymentEvent>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let permit = tokio::select! {
            () = shutdown.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        in_flight.retain(|h| !h.is_finished());
        let engine = engine.clone();
        in_flight.push(tokio::spawn(async move {
            let _permit = permit;
            let run_id = event.run_id;
            match engine.execute(&run_id).await {
                Ok(run) => debug!(run_id = %run_id, status = %run.status, "run finished"),
                Err(e) => error!(run_id = %run_id, error = %e, "run execution aborted"),
            }
        }));
    }

    in_flight.retain(|h| !h.is_finished());
    if !in_flight.is_empty() {
        warn!(count = in_flight.len(), "dispatcher stopping, waiting for in-flight runs");
    }
    futures::future::join_all(in_flight).await;
    info!("dispatcher stopped");
}
