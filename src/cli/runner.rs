//! Runs one CLI invocation through the pipeline

use std::sync::Arc;

use tokio::io::AsyncReadExt;

use crate::cli::args::{Cli, Commands};
use crate::config::EnvConfig;
use crate::error::{MoverError, Result};
use crate::output::ProgressReporter;
use crate::pipeline::{MoveOutcome, Pipeline};
use crate::registry::RegistryCopyEngine;
use crate::request::MoveRequest;

pub struct Runner {
    cli: Cli,
    output: ProgressReporter,
}

impl Runner {
    pub fn new(cli: Cli) -> Self {
        let output = if cli.quiet {
            ProgressReporter::new_quiet()
        } else {
            ProgressReporter::new(cli.verbose)
        };

        Self { cli, output }
    }

    pub async fn run(&self) -> Result<MoveOutcome> {
        let pipeline = Pipeline::new(
            Arc::new(EnvConfig),
            Arc::new(RegistryCopyEngine::new()),
            self.output.clone(),
        );

        let outcome = match &self.cli.command {
            Commands::Move(args) => {
                let request = MoveRequest::new(args.url.as_str(), args.tag.as_str())?;
                pipeline.move_request(request).await?
            }
            Commands::Invoke(args) => {
                let payload = match &args.payload {
                    Some(payload) => payload.clone().into_bytes(),
                    None => read_stdin().await?,
                };
                pipeline.move_image(&payload).await?
            }
        };

        self.output.info(&format!("{}@{}", outcome.destination, outcome.manifest_digest));
        Ok(outcome)
    }
}

async fn read_stdin() -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut payload)
        .await
        .map_err(|e| MoverError::io("read payload from stdin", e))?;
    Ok(payload)
}
