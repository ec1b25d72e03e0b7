//! Job kinds a worker can hand to the pipeline.
//!
//! Each kind pairs one payload with one result shape, so a job queue can
//! carry them as tagged JSON and the pipeline dispatches exhaustively.
//!
//! ```json
//! {"kind": "ingest", "content": "...", "title": "...", "page_id": "p1", ...}
//! ```

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::pipeline::orchestrator::GraphPipeline;
use crate::traits::llm::LanguageModel;
use crate::traits::store::GraphStore;
use crate::types::entity::ResolvedEntity;
use crate::types::ingest::{IngestOutcome, IngestRequest};

/// A unit of work for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphJob {
    /// Full extraction, resolution and persistence
    Ingest(IngestRequest),

    /// Extract and resolve entities without writing anything
    PreviewEntities(IngestRequest),
}

impl GraphJob {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ingest(_) => "ingest",
            Self::PreviewEntities(_) => "preview_entities",
        }
    }

    pub fn request(&self) -> &IngestRequest {
        match self {
            Self::Ingest(request) | Self::PreviewEntities(request) => request,
        }
    }
}

/// Entities a preview run would write or merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityPreview {
    pub resolved_entities: Vec<ResolvedEntity>,
    pub actions: Vec<String>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// Result of a [`GraphJob`], one variant per job kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphJobResult {
    Ingest(IngestOutcome),
    PreviewEntities(EntityPreview),
}

impl<S: GraphStore, L: LanguageModel> GraphPipeline<S, L> {
    /// Run a job to completion.
    pub async fn run_job(&self, job: GraphJob, cancel: Option<CancellationToken>) -> GraphJobResult {
        info!(kind = job.kind(), page_id = %job.request().page_id, "Running job");
        match job {
            GraphJob::Ingest(request) => GraphJobResult::Ingest(match cancel {
                Some(cancel) => self.ingest_with_cancel(&request, cancel).await,
                None => self.ingest(&request).await,
            }),
            GraphJob::PreviewEntities(request) => {
                GraphJobResult::PreviewEntities(self.preview_entities(&request, cancel.as_ref()).await)
            }
        }
    }
}
