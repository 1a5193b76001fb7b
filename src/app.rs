use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;

use crate::archive;
use crate::domain::{
    ConfigBatch, ConfigRecord, ConfigRequest, MvmRecord, MvmRequest, RejectedEntry, RequestId,
    RequestStatus, Stage, StatusReport, TreatmentIdentity,
};
use crate::error::HobsError;
use crate::hobs::HobsClient;
use crate::mirror::{ConfigMirror, ObjectStore};
use crate::poll::{PollPolicy, Sleeper, ThreadSleeper};
use crate::staging::{self, StagedTable, StagingReport};

pub const HOBS_TABLE_NAME: &str = "hobs_table";

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Submit,
    Wait,
    Fetch,
    Mirror,
    Stage,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// A submit call, optionally followed by waiting for and fetching the result.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestOutcome<T> {
    Submitted { request_id: RequestId },
    Completed { request_id: RequestId, result: T },
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorResult {
    pub request_id: RequestId,
    pub keys: Vec<String>,
    pub rejected: Vec<RejectedEntry>,
}

pub struct App<C: HobsClient, O: ObjectStore> {
    client: C,
    store: O,
    base_folder: String,
    sleeper: Box<dyn Sleeper>,
}

impl<C: HobsClient, O: ObjectStore> App<C, O> {
    pub fn new(client: C, store: O, base_folder: impl Into<String>) -> Self {
        Self {
            client,
            store,
            base_folder: base_folder.into(),
            sleeper: Box::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn submit_configs(
        &self,
        request: &ConfigRequest,
        sink: &dyn ProgressSink,
    ) -> Result<RequestId, HobsError> {
        emit(
            sink,
            format!(
                "phase=Submit; configs for {} studies (refresh={})",
                request.study_names.len(),
                request.refresh_config
            ),
        );
        let start = Instant::now();
        let id = self.client.submit_configs(request)?;
        emit_timed(sink, format!("hobs.submit request_id={id}"), start);
        Ok(id)
    }

    pub fn submit_mvm(
        &self,
        request: &MvmRequest,
        sink: &dyn ProgressSink,
    ) -> Result<RequestId, HobsError> {
        emit(
            sink,
            format!(
                "phase=Submit; measured-vs-modeled for {} studies",
                request.study_names.len()
            ),
        );
        let start = Instant::now();
        let id = self.client.submit_mvm(request)?;
        emit_timed(sink, format!("hobs.submit request_id={id}"), start);
        Ok(id)
    }

    pub fn poll_status(&self, id: &RequestId) -> Result<StatusReport, HobsError> {
        self.client.status(id)
    }

    /// Re-checks status every `policy.interval` until SUCCESS or ERROR.
    ///
    /// An ERROR status is returned as a report, not as an `Err`, so the caller
    /// can inspect the payload. Running out of attempts yields `WaitExhausted`.
    pub fn wait_until_done(
        &self,
        id: &RequestId,
        policy: &PollPolicy,
        sink: &dyn ProgressSink,
    ) -> Result<StatusReport, HobsError> {
        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let report = self.client.status(id)?;
            emit_timed(
                sink,
                format!(
                    "phase=Poll; request {id} is {} (check {attempt})",
                    report.status
                ),
                start,
            );
            if report.status.is_terminal() {
                return Ok(report);
            }
            if !policy.allows(attempt.saturating_add(1)) {
                return Err(HobsError::WaitExhausted {
                    request_id: id.to_string(),
                    attempts: attempt,
                });
            }
            self.sleeper.sleep(policy.interval);
        }
    }

    pub fn result_url(&self, id: &RequestId) -> Result<String, HobsError> {
        self.client.result_url(id)
    }

    pub fn fetch_configs(
        &self,
        id: &RequestId,
        sink: &dyn ProgressSink,
    ) -> Result<ConfigBatch, HobsError> {
        let entries = self.download_entries(id, sink)?;
        emit(
            sink,
            format!("phase=Normalize; {} config entries", entries.len()),
        );
        let mut batch = ConfigBatch::default();
        for entry in entries {
            match TreatmentIdentity::from_label(&entry.label) {
                Ok(identity) => batch.records.push(ConfigRecord {
                    identity,
                    config: entry.payload,
                }),
                Err(err) => {
                    emit(sink, format!("skipping entry {}: {err}", entry.label));
                    batch.rejected.push(RejectedEntry {
                        label: entry.label,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(batch)
    }

    pub fn fetch_mvm(
        &self,
        id: &RequestId,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<MvmRecord>, HobsError> {
        let entries = self.download_entries(id, sink)?;
        emit(sink, format!("phase=Normalize; {} mvm entries", entries.len()));
        Ok(entries
            .into_iter()
            .map(|entry| MvmRecord::from_entry(&entry.label, entry.payload))
            .collect())
    }

    pub fn request_configs(
        &self,
        request: &ConfigRequest,
        wait: Option<&PollPolicy>,
        sink: &dyn ProgressSink,
    ) -> Result<RequestOutcome<ConfigBatch>, HobsError> {
        let request_id = self.submit_configs(request, sink)?;
        let Some(policy) = wait else {
            return Ok(RequestOutcome::Submitted { request_id });
        };
        self.ensure_success(&request_id, policy, sink)?;
        let result = self.fetch_configs(&request_id, sink)?;
        Ok(RequestOutcome::Completed { request_id, result })
    }

    pub fn request_mvm(
        &self,
        request: &MvmRequest,
        wait: Option<&PollPolicy>,
        sink: &dyn ProgressSink,
    ) -> Result<RequestOutcome<Vec<MvmRecord>>, HobsError> {
        let request_id = self.submit_mvm(request, sink)?;
        let Some(policy) = wait else {
            return Ok(RequestOutcome::Submitted { request_id });
        };
        self.ensure_success(&request_id, policy, sink)?;
        let result = self.fetch_mvm(&request_id, sink)?;
        Ok(RequestOutcome::Completed { request_id, result })
    }

    /// Fetches a request's configs and mirrors them under `<base>/<request_id>/`.
    pub fn save_configs(
        &self,
        id: &RequestId,
        sink: &dyn ProgressSink,
    ) -> Result<MirrorResult, HobsError> {
        let batch = self.fetch_configs(id, sink)?;
        emit(
            sink,
            format!("phase=Mirror; writing {} configs", batch.records.len()),
        );
        let keys = self.mirror().save(id, &batch.records)?;
        Ok(MirrorResult {
            request_id: id.clone(),
            keys,
            rejected: batch.rejected,
        })
    }

    pub fn retrieve_configs(
        &self,
        id: &RequestId,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<ConfigRecord>, HobsError> {
        let mirror = self.mirror();
        emit(
            sink,
            format!("phase=Mirror; reading {}", mirror.request_prefix(id)),
        );
        mirror.load(id)
    }

    pub fn stage_concat_tables(
        &self,
        stage: &Stage,
        conn: &mut Connection,
        sink: &dyn ProgressSink,
    ) -> Result<StagingReport, HobsError> {
        emit(
            sink,
            format!("phase=Download; concatenated tables for stage {stage}"),
        );
        let start = Instant::now();
        let bytes = self.client.concat_tables(stage)?;
        emit_timed(
            sink,
            format!("hobs.export bytes={}", bytes.len()),
            start,
        );
        emit(sink, "phase=Stage; loading CSV entries".to_string());
        let report = staging::stage(&bytes, conn)?;
        for failure in &report.failures {
            emit(sink, format!("skipped {}: {}", failure.entry, failure.error));
        }
        emit(
            sink,
            format!(
                "phase=Stage; {} tables staged, {} skipped",
                report.tables.len(),
                report.failures.len()
            ),
        );
        Ok(report)
    }

    pub fn stage_hobs_table(
        &self,
        conn: &mut Connection,
        sink: &dyn ProgressSink,
    ) -> Result<StagedTable, HobsError> {
        emit(sink, "phase=Download; HOBS overview table".to_string());
        let bytes = self.client.hobs_table()?;
        emit(sink, format!("phase=Stage; loading {HOBS_TABLE_NAME}"));
        staging::stage_csv(conn, HOBS_TABLE_NAME, "hobs_table.csv", &bytes)
    }

    fn mirror(&self) -> ConfigMirror<'_, O> {
        ConfigMirror::new(&self.store, &self.base_folder)
    }

    fn ensure_success(
        &self,
        id: &RequestId,
        policy: &PollPolicy,
        sink: &dyn ProgressSink,
    ) -> Result<(), HobsError> {
        let report = self.wait_until_done(id, policy, sink)?;
        match report.status {
            RequestStatus::Success => Ok(()),
            _ => Err(HobsError::RequestFailed {
                request_id: id.to_string(),
                detail: report.detail(),
            }),
        }
    }

    fn download_entries(
        &self,
        id: &RequestId,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<archive::JsonEntry>, HobsError> {
        let fetch = || -> Result<Vec<archive::JsonEntry>, HobsError> {
            let url = self.client.result_url(id)?;
            emit(sink, format!("phase=Download; result archive of {id}"));
            let start = Instant::now();
            let bytes = self.client.download(&url)?;
            emit_timed(sink, format!("hobs.download bytes={}", bytes.len()), start);
            archive::read_json_entries(&bytes)
        };
        fetch().map_err(|source| HobsError::ResultDownload {
            request_id: id.to_string(),
            source: Box::new(source),
        })
    }
}

fn emit(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

fn emit_timed(sink: &dyn ProgressSink, message: String, start: Instant) {
    let elapsed = start.elapsed();
    sink.event(ProgressEvent {
        message: format!("{message} latency_ms={}", elapsed.as_millis()),
        elapsed: Some(elapsed),
    });
}
