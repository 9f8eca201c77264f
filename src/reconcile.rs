//! The reconciliation loop.
//!
//! Engine events keep the registry current between ticks. Every tick
//! refreshes the registry from scratch, retries pending starts, runs one
//! drift check per known container and finally looks at the driver set.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::error::Result;
use crate::operator::Operator;
use crate::replace::DriftOutcome;
use crate::runtime::EngineEvent;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

impl Operator {
    /// Rebuilds the registry from the engine and republishes DNS.
    pub async fn refresh(&self) -> Result<()> {
        let containers = self.engine.list_containers().await?;
        let ids: Vec<String> = containers.iter().map(|c| c.id.clone()).collect();
        self.registry.replace_all(containers).await;
        debug!("Registry refreshed: {} containers", ids.len());

        for id in ids {
            self.publish_dns(&id).await;
        }
        Ok(())
    }

    pub async fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Started(id) => match self.engine.inspect_container(&id).await {
                Ok(detail) => {
                    let record = detail.to_record();
                    info!("Container started: {}", record);
                    self.registry.upsert(record).await;
                }
                Err(e) => warn!("Inspecting started container {} failed: {}", id, e),
            },
            EngineEvent::Stopped(id) => {
                if let Some(record) = self.registry.remove(&id).await {
                    info!("Container stopped: {}", record);
                }
            }
        }
    }

    /// One reconciliation pass.
    pub async fn tick(self: &Arc<Self>) {
        if let Err(e) = self.refresh().await {
            error!("Refreshing containers failed: {}", e);
        }
        self.retry_pending().await;
        self.ensure_dns().await;

        let mut checks = JoinSet::new();
        for record in self.registry.snapshot().await {
            let operator = Arc::clone(self);
            checks.spawn(async move {
                let outcome = operator.check_drift(&record.id).await;
                (record, outcome)
            });
        }
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((record, Ok(DriftOutcome::Replaced(new_id)))) => {
                    info!("Replaced {} with {}", record, new_id)
                }
                Ok((_, Ok(_))) => {}
                Ok((record, Err(e))) => error!("Drift check for {} failed: {}", record, e),
                Err(e) => error!("Drift check task panicked: {}", e),
            }
        }

        if let Err(e) = self.check_drivers().await {
            error!("Checking drivers failed: {}", e);
        }
    }

    /// Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events = self.engine.events();
        let mut running: Option<JoinHandle<()>> = None;

        info!("Reconciling every {}s", self.config.interval().as_secs());
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        let operator = Arc::clone(&self);
                        tokio::spawn(async move { operator.handle_event(event).await });
                    }
                    Some(Err(e)) => error!("Engine event stream error: {}", e),
                    None => {
                        warn!("Engine event stream ended, resubscribing");
                        sleep(RESUBSCRIBE_DELAY).await;
                        events = self.engine.events();
                    }
                },
                _ = ticker.tick() => {
                    if running.as_ref().is_some_and(|t| !t.is_finished()) {
                        debug!("Previous tick still running, skipping");
                    } else {
                        let operator = Arc::clone(&self);
                        running = Some(tokio::spawn(async move { operator.tick().await }));
                    }
                }
            }
        }
    }
}
