use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Instant;

use crate::analysis_queue::{AnalysisJobStore, AnalysisProcessor, RecordCache};

pub type GuardedProcessor = Arc<AnalysisProcessor>;
pub type GuardedJobStore = Arc<dyn AnalysisJobStore>;
pub type GuardedRecordCache = Arc<RecordCache>;

#[derive(Clone)]
pub struct ServerState {
    pub start_time: Instant,
    pub processor: GuardedProcessor,
    pub job_store: GuardedJobStore,
    pub record_cache: GuardedRecordCache,
}

impl ServerState {
    pub fn new(
        processor: GuardedProcessor,
        job_store: GuardedJobStore,
        record_cache: GuardedRecordCache,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            processor,
            job_store,
            record_cache,
        }
    }
}

impl FromRef<ServerState> for GuardedProcessor {
    fn from_ref(input: &ServerState) -> Self {
        input.processor.clone()
    }
}

impl FromRef<ServerState> for GuardedJobStore {
    fn from_ref(input: &ServerState) -> Self {
        input.job_store.clone()
    }
}

impl FromRef<ServerState> for GuardedRecordCache {
    fn from_ref(input: &ServerState) -> Self {
        input.record_cache.clone()
    }
}
