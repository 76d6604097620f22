use std::sync::Arc;

use chrono::Local;
use tracing::info_span;

use crate::artifact::{artifact_path, write_workbook};
use crate::broadcast::job_progress::JobStatus;
use crate::records::{parse_export, RecordStatus};
use crate::remote::TargetConnector;
use crate::retry::RetryError;
use crate::secrets::Credentials;
use crate::session::{RemoteSession, SessionError};
use crate::worker::job::{Artifact, Job};

use super::config::PipelineConfig;
use super::context::PipelineContext;
use super::error::PipelineError;
use super::progress::{ProgressEvent, ProgressReporter};

/// Longest per-record failure reason kept in the job log.
const MAX_REASON_CHARS: usize = 200;

/// How a pipeline run ended. The terminal event has already been reported.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed(Artifact),
    Failed(String),
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed(_))
    }
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    connector: Arc<dyn TargetConnector>,
    credentials: Arc<Credentials>,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        connector: Arc<dyn TargetConnector>,
        credentials: Arc<Credentials>,
    ) -> Self {
        Self {
            config,
            connector,
            credentials,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every stage for `job` and reports exactly one terminal event.
    pub fn run(&self, job: &Job, progress: &dyn ProgressReporter) -> PipelineOutcome {
        let _pipeline_span = info_span!("pipeline",
            job_id = %job.id,
            kind = job.kind.as_str(),
            date_range = %job.date_range,
        )
        .entered();

        let mut ctx = PipelineContext::new(job.clone());
        match self.execute(&mut ctx, progress) {
            Ok(artifact) => {
                progress.report(ProgressEvent::Completed {
                    artifact: artifact.clone(),
                });
                PipelineOutcome::Completed(artifact)
            }
            Err(e) => {
                let error = e.to_string();
                log::error!("Job {} failed: {}", job.id, error);
                progress.report(ProgressEvent::Failed {
                    error: error.clone(),
                });
                PipelineOutcome::Failed(error)
            }
        }
    }

    fn execute(
        &self,
        ctx: &mut PipelineContext,
        progress: &dyn ProgressReporter,
    ) -> Result<Artifact, PipelineError> {
        // Step 1: Authenticate
        let mut session = {
            let _step = info_span!("authenticate").entered();
            progress.report(ProgressEvent::Phase(JobStatus::Authenticating));
            progress.report(ProgressEvent::log("Logging in to remote system"));
            let session = RemoteSession::establish(
                self.connector.as_ref(),
                Arc::clone(&self.credentials),
                self.config.session,
                &self.config.login_retry,
            )?;
            progress.report(ProgressEvent::log("Login successful"));
            session
        };

        // Step 2: Export
        let exported = {
            let _step = info_span!("export").entered();
            progress.report(ProgressEvent::Phase(JobStatus::Exporting));
            let range = ctx.job.date_range;
            progress.report(ProgressEvent::log(format!("Exporting notes for {}", range)));

            let bytes = self
                .config
                .export_retry
                .run(
                    "Export",
                    |_| {
                        session.keep_alive()?;
                        session.export(&range)
                    },
                    SessionError::is_transient,
                )
                .map_err(|e| PipelineError::remote(PipelineError::Export, e))?;
            progress.report(ProgressEvent::log(format!(
                "Export downloaded ({} bytes)",
                bytes.len()
            )));
            bytes
        };

        // Step 3: Convert
        {
            let _step = info_span!("convert").entered();
            progress.report(ProgressEvent::Phase(JobStatus::Converting));
            let mut records = parse_export(&exported)?;
            ctx.discovered = records.len();

            let limit = ctx.job.client_limit as usize;
            if limit > 0 && records.len() > limit {
                records.truncate(limit);
            }
            ctx.records = records;

            progress.report(ProgressEvent::Total(ctx.total() as u32));
            progress.report(ProgressEvent::log(format!(
                "Found {} clients; processing {}",
                ctx.discovered,
                ctx.total()
            )));
        }

        // Step 4: Refresh the view so lookups see the exported data
        {
            let _step = info_span!("refresh").entered();
            self.config
                .lookup_retry
                .run(
                    "Refresh",
                    |_| {
                        session.keep_alive()?;
                        session.refresh_twice()
                    },
                    SessionError::is_transient,
                )
                .map_err(|e| PipelineError::remote(PipelineError::Refresh, e))?;
        }

        // Step 5: Enrich
        {
            let _step = info_span!("enrich", total = ctx.total()).entered();
            progress.report(ProgressEvent::Phase(JobStatus::Enriching));
            self.enrich(ctx, &mut session, progress)?;

            progress.report(ProgressEvent::log(format!(
                "Enrichment finished: {} processed, {} failed",
                ctx.count(RecordStatus::Enriched),
                ctx.count(RecordStatus::Failed)
            )));
            drop(session);
            progress.report(ProgressEvent::log("Remote session closed"));
        }

        // Step 6: Generate
        let _step = info_span!("generate").entered();
        progress.report(ProgressEvent::Phase(JobStatus::Generating));
        let path = artifact_path(
            &self.config.output_directory,
            ctx.job.id,
            ctx.job.kind,
            Local::now().naive_local(),
        );
        let artifact = write_workbook(&path, &ctx.records)?;
        progress.report(ProgressEvent::log(format!(
            "Report written to {}",
            artifact.path.display()
        )));
        Ok(artifact)
    }

    /// Looks up every record in order. A record that cannot be enriched is
    /// marked failed and the loop moves on; only a dead session stops it.
    fn enrich(
        &self,
        ctx: &mut PipelineContext,
        session: &mut RemoteSession,
        progress: &dyn ProgressReporter,
    ) -> Result<(), PipelineError> {
        let total = ctx.total();

        for (idx, record) in ctx.records.iter_mut().enumerate() {
            let position = idx + 1;
            let name = record.identity.display_name();

            session.keep_alive().map_err(PipelineError::SessionLost)?;

            let result = self.config.lookup_retry.run(
                &format!("Lookup of {}", name),
                |attempt| {
                    if attempt > 1 {
                        session.keep_alive()?;
                    }
                    session.lookup(&record.identity)
                },
                SessionError::is_transient,
            );

            match result {
                Ok(fields) => {
                    record.enrich(fields);
                    progress.report(ProgressEvent::RecordProcessed {
                        message: format!("[{}/{}] Successfully processed {}", position, total, name),
                    });
                }
                Err(RetryError::Fatal(e @ SessionError::Dead { .. })) => {
                    return Err(PipelineError::SessionLost(e));
                }
                Err(e) => {
                    let reason = truncate(&e.to_string(), MAX_REASON_CHARS);
                    record.mark_failed(&reason);
                    progress.report(ProgressEvent::RecordFailed {
                        message: format!(
                            "[{}/{}] Failed to process {}: {}",
                            position, total, name, reason
                        ),
                    });
                }
            }

            session.mark_activity();
        }

        Ok(())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
