use crate::records::{ClientRecord, RecordStatus};
use crate::worker::job::Job;

pub struct PipelineContext {
    // Input
    pub job: Job,

    // Converting result, already cut to the job's client limit
    pub records: Vec<ClientRecord>,

    // Size of the export before the limit was applied
    pub discovered: usize,
}

impl PipelineContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            records: Vec::new(),
            discovered: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn count(&self, status: RecordStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}
