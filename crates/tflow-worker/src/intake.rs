//! Turns asset-ready signals into transcode jobs.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tflow_models::{Asset, Preset, ResourceClass};
use tflow_queue::{EnqueueRequest, JobQueue};

/// One job created for every new asset.
#[derive(Debug, Clone)]
pub struct IntakeRule {
    pub preset: Preset,
    pub resource_class: ResourceClass,
    pub priority: u8,
}

impl IntakeRule {
    pub fn new(preset: Preset, resource_class: ResourceClass, priority: u8) -> Self {
        Self {
            preset,
            resource_class,
            priority,
        }
    }

    /// One 720p H.264 rendition on CPU at normal priority.
    pub fn defaults() -> Vec<Self> {
        vec![Self::new(
            Preset::new("h264-720p")
                .with_param("codec", "h264")
                .with_param("height", "720"),
            ResourceClass::Cpu,
            5,
        )]
    }
}

/// Enqueue one job per rule for every asset received on `assets`.
pub fn spawn_asset_intake(
    queue: Arc<JobQueue>,
    mut assets: broadcast::Receiver<Asset>,
    rules: Vec<IntakeRule>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let asset = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = assets.recv() => match received {
                    Ok(asset) => asset,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Asset intake lagged, some assets got no jobs");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            for rule in &rules {
                let request = EnqueueRequest::new(
                    asset.id.clone(),
                    rule.preset.clone(),
                    rule.priority,
                    rule.resource_class,
                );
                match queue.enqueue(request).await {
                    Ok(job_id) => info!(
                        asset_id = %asset.id,
                        job_id = %job_id,
                        preset = %rule.preset.name,
                        "Enqueued job for new asset"
                    ),
                    Err(e) => error!(
                        asset_id = %asset.id,
                        preset = %rule.preset.name,
                        error = %e,
                        "Failed to enqueue job for new asset"
                    ),
                }
            }
        }

        debug!("Asset intake stopped");
    })
}
