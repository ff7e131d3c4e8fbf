//! One image move: validate, fetch, normalize, transfer

use std::sync::Arc;
use std::time::Instant;

use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::archive::{ArchiveFormat, ScratchSpace};
use crate::config::{ConfigSource, RunConfig};
use crate::error::{MoverError, Result};
use crate::fetch::Fetcher;
use crate::output::ProgressReporter;
use crate::request::MoveRequest;
use crate::transfer::{CopyEngine, TransferEngine};

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOutcome {
    pub run_id: Uuid,
    pub destination: String,
    pub manifest_digest: String,
    pub archive_format: ArchiveFormat,
}

/// Shared by every run; holds nothing mutable.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<dyn ConfigSource>,
    fetcher: Fetcher,
    transfer: TransferEngine,
    report: ProgressReporter,
}

impl Pipeline {
    pub fn new(config: Arc<dyn ConfigSource>, engine: Arc<dyn CopyEngine>, report: ProgressReporter) -> Self {
        Self {
            config,
            fetcher: Fetcher::default(),
            transfer: TransferEngine::new(engine),
            report,
        }
    }

    /// Run for a raw invocation payload.
    pub async fn move_image(&self, payload: &[u8]) -> Result<MoveOutcome> {
        let request = MoveRequest::from_payload(payload)?;
        self.move_request(request).await
    }

    pub async fn move_request(&self, request: MoveRequest) -> Result<MoveOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("move", %run_id, tag = request.destination_tag());
        self.run(run_id, request).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, request: MoveRequest) -> Result<MoveOutcome> {
        let started = Instant::now();
        let config = RunConfig::load(self.config.as_ref());
        let report = &self.report;

        report.section(&format!("Moving image to tag {}", request.destination_tag()));

        let artifact = self
            .fetcher
            .fetch(&request, &config.source, config.registry.timeout)
            .await?;

        // Removed when this function returns, on every path.
        let scratch = ScratchSpace::create_in(&config.scratch_dir)?;
        let (_, bytes) = scratch.materialize(artifact).await?;
        report.step(&format!("Downloaded {}", report.format_size(bytes)));

        let artifact_path = scratch.artifact_path();
        let extraction_root = scratch.extraction_root();
        let normalized = tokio::task::spawn_blocking(move || {
            crate::archive::normalize(&artifact_path, &extraction_root)
        })
        .await
        .map_err(|e| MoverError::io("normalize artifact", std::io::Error::other(e)))??;

        match normalized.format {
            ArchiveFormat::Zip => report.detail(&format!(
                "Extracted {} entries, using {}",
                normalized.extracted.len(),
                normalized.archive_path.display()
            )),
            ArchiveFormat::NotAZip => report.detail("Artifact is not a zip, using it as the image archive"),
            ArchiveFormat::CorruptZip => {
                report.warning("Artifact looks like a zip but cannot be read, using it as the image archive")
            }
        }

        let outcome = self
            .transfer
            .transfer(&normalized.archive_path, request.destination_tag(), &config, report)
            .await?;

        info!(
            destination = %outcome.destination,
            digest = %outcome.manifest_digest,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "image moved"
        );
        report.success(&format!(
            "Image moved in {}",
            report.format_duration(started.elapsed())
        ));

        drop(scratch);
        Ok(MoveOutcome {
            run_id,
            destination: outcome.destination,
            manifest_digest: outcome.manifest_digest,
            archive_format: normalized.format,
        })
    }
}
