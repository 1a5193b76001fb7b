use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use rusqlite::Connection;
use serde_json::json;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use hobs_toolkit::app::{App, RequestOutcome};
use hobs_toolkit::domain::{
    ConfigRequest, MvmRequest, RequestId, RequestStatus, Stage, StatusReport,
};
use hobs_toolkit::error::HobsError;
use hobs_toolkit::hobs::HobsClient;
use hobs_toolkit::mirror::FsObjectStore;
use hobs_toolkit::output::Quiet;
use hobs_toolkit::poll::{PollPolicy, Sleeper};
use hobs_toolkit::staging;

fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[derive(Default)]
struct MockHobs {
    statuses: Mutex<VecDeque<&'static str>>,
    status_calls: Mutex<usize>,
    archive: Vec<u8>,
    fail_download: bool,
}

impl MockHobs {
    fn with_statuses(statuses: &[&'static str]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            ..Self::default()
        }
    }

    fn with_archive(mut self, archive: Vec<u8>) -> Self {
        self.archive = archive;
        self
    }
}

impl HobsClient for MockHobs {
    fn submit_configs(&self, _request: &ConfigRequest) -> Result<RequestId, HobsError> {
        "req-configs".parse()
    }

    fn submit_mvm(&self, _request: &MvmRequest) -> Result<RequestId, HobsError> {
        "req-mvm".parse()
    }

    fn status(&self, _id: &RequestId) -> Result<StatusReport, HobsError> {
        *self.status_calls.lock().unwrap() += 1;
        let status = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or("RUNNING");
        StatusReport::from_json(json!({"request_status": status, "message": "solver crashed"}))
    }

    fn result_url(&self, id: &RequestId) -> Result<String, HobsError> {
        Ok(format!("https://storage.local/{id}.zip"))
    }

    fn download(&self, _url: &str) -> Result<Vec<u8>, HobsError> {
        if self.fail_download {
            return Err(HobsError::Status {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(self.archive.clone())
    }

    fn concat_tables(&self, _stage: &Stage) -> Result<Vec<u8>, HobsError> {
        Ok(self.archive.clone())
    }

    fn hobs_table(&self) -> Result<Vec<u8>, HobsError> {
        Ok(b"study,site\nsehy_2003,north\n".to_vec())
    }
}

#[derive(Clone, Default)]
struct CountingSleeper {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl Sleeper for CountingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

fn app_with(
    client: MockHobs,
    mirror_root: &std::path::Path,
) -> (App<MockHobs, FsObjectStore>, CountingSleeper) {
    let root = Utf8PathBuf::from_path_buf(mirror_root.to_path_buf()).unwrap();
    let store = FsObjectStore::new(&root, "scratch");
    let sleeper = CountingSleeper::default();
    let app = App::new(client, store, "hobs/temp_configs").with_sleeper(sleeper.clone());
    (app, sleeper)
}

fn config_request() -> ConfigRequest {
    ConfigRequest {
        study_names: vec!["sehy_2003".to_string()],
        stages: Vec::new(),
        refresh_config: false,
    }
}

fn policy(max_attempts: u32) -> PollPolicy {
    PollPolicy::bounded(Duration::from_secs(60), max_attempts)
}

#[test]
fn waits_once_per_running_status() {
    let temp = tempfile::tempdir().unwrap();
    let (app, sleeper) = app_with(
        MockHobs::with_statuses(&["RUNNING", "RUNNING", "SUCCESS"]),
        temp.path(),
    );
    let id: RequestId = "r1".parse().unwrap();

    let report = app.wait_until_done(&id, &policy(10), &Quiet).unwrap();

    assert_eq!(report.status, RequestStatus::Success);
    assert_eq!(*app.client().status_calls.lock().unwrap(), 3);
    assert_eq!(
        *sleeper.sleeps.lock().unwrap(),
        vec![Duration::from_secs(60); 2]
    );
}

#[test]
fn immediate_error_does_not_sleep() {
    let temp = tempfile::tempdir().unwrap();
    let (app, sleeper) = app_with(MockHobs::with_statuses(&["ERROR"]), temp.path());
    let id: RequestId = "r1".parse().unwrap();

    let report = app.wait_until_done(&id, &policy(10), &Quiet).unwrap();

    assert_eq!(report.status, RequestStatus::Error);
    assert!(sleeper.sleeps.lock().unwrap().is_empty());
}

#[test]
fn bounded_wait_gives_up() {
    let temp = tempfile::tempdir().unwrap();
    let (app, sleeper) = app_with(MockHobs::with_statuses(&[]), temp.path());
    let id: RequestId = "r1".parse().unwrap();

    let err = app.wait_until_done(&id, &policy(3), &Quiet).unwrap_err();

    assert_matches!(err, HobsError::WaitExhausted { attempts: 3, .. });
    assert_eq!(*app.client().status_calls.lock().unwrap(), 3);
    assert_eq!(sleeper.sleeps.lock().unwrap().len(), 2);
}

#[test]
fn unknown_status_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let (app, _sleeper) = app_with(MockHobs::with_statuses(&["QUEUED"]), temp.path());
    let id: RequestId = "r1".parse().unwrap();

    let err = app.wait_until_done(&id, &policy(3), &Quiet).unwrap_err();
    assert_matches!(err, HobsError::InvalidStatus(_));
}

#[test]
fn failed_request_surfaces_server_detail() {
    let temp = tempfile::tempdir().unwrap();
    let (app, _sleeper) = app_with(MockHobs::with_statuses(&["RUNNING", "ERROR"]), temp.path());

    let err = app
        .request_configs(&config_request(), Some(&policy(10)), &Quiet)
        .unwrap_err();

    assert_matches!(
        err,
        HobsError::RequestFailed { request_id, detail }
            if request_id == "req-configs" && detail == "solver crashed"
    );
}

#[test]
fn submit_without_wait_returns_request_id() {
    let temp = tempfile::tempdir().unwrap();
    let (app, _sleeper) = app_with(MockHobs::default(), temp.path());

    let outcome = app.request_configs(&config_request(), None, &Quiet).unwrap();

    assert_matches!(outcome, RequestOutcome::Submitted { request_id } if request_id.as_str() == "req-configs");
    assert_eq!(*app.client().status_calls.lock().unwrap(), 0);
}

#[test]
fn download_failure_keeps_its_cause() {
    let temp = tempfile::tempdir().unwrap();
    let client = MockHobs {
        fail_download: true,
        ..MockHobs::default()
    };
    let (app, _sleeper) = app_with(client, temp.path());
    let id: RequestId = "r1".parse().unwrap();

    let err = app.fetch_configs(&id, &Quiet).unwrap_err();

    assert!(err.is_remote());
    assert_matches!(
        err,
        HobsError::ResultDownload { source, .. }
            if matches!(*source, HobsError::Status { status: 503, .. })
    );
}

#[test]
fn malformed_labels_are_rejected_not_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let archive = zip_of(&[
        ("configs/sehy___north___till___s1.json", r#"{"name": "a"}"#),
        ("configs/sehy___north___s2.json", r#"{"name": "b"}"#),
    ]);
    let (app, _sleeper) = app_with(MockHobs::default().with_archive(archive), temp.path());
    let id: RequestId = "r1".parse().unwrap();

    let batch = app.fetch_configs(&id, &Quiet).unwrap();

    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.records[0].identity.treatment_name, "till");
    assert_eq!(batch.rejected.len(), 1);
    assert_eq!(batch.rejected[0].label, "configs/sehy___north___s2");
}

#[test]
fn mvm_request_completes_with_records() {
    let temp = tempfile::tempdir().unwrap();
    let archive = zip_of(&[("sehy_2003/measured_vs_modeled.json", r#"[{"obs": 1.0}]"#)]);
    let client = MockHobs::with_statuses(&["SUCCESS"]).with_archive(archive);
    let (app, _sleeper) = app_with(client, temp.path());
    let request = MvmRequest {
        study_names: vec!["sehy_2003".to_string()],
        stages: Vec::new(),
        interpolation_method: None,
    };

    let outcome = app.request_mvm(&request, Some(&policy(5)), &Quiet).unwrap();

    let RequestOutcome::Completed { result, .. } = outcome else {
        panic!("expected a completed request");
    };
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].study_name, "sehy_2003");
    assert_eq!(result[0].mvms, json!([{"obs": 1.0}]));
}

#[test]
fn mirrored_configs_round_trip() {
    let temp = tempfile::tempdir().unwrap();
    let archive = zip_of(&[
        ("configs/sehy___north___till___s1.json", r#"{"name": "sehy-north-till"}"#),
        ("configs/sehy___south___notill___s2.json", r#"{"years": 3}"#),
    ]);
    let (app, _sleeper) = app_with(MockHobs::default().with_archive(archive), temp.path());
    let id: RequestId = "r42".parse().unwrap();

    let saved = app.save_configs(&id, &Quiet).unwrap();
    assert_eq!(
        saved.keys,
        vec![
            "hobs/temp_configs/r42/sehy-north-till.json",
            "hobs/temp_configs/r42/sehy___south___notill___s2.json",
        ]
    );

    let restored = app.retrieve_configs(&id, &Quiet).unwrap();
    assert_eq!(restored.len(), 2);
    assert_eq!(restored[1].identity.site_name, "south");
    assert_eq!(restored[1].config, json!({"years": 3}));
}

#[test]
fn retrieving_unknown_request_is_empty() {
    let temp = tempfile::tempdir().unwrap();
    let (app, _sleeper) = app_with(MockHobs::default(), temp.path());
    let id: RequestId = "missing".parse().unwrap();

    assert!(app.retrieve_configs(&id, &Quiet).unwrap().is_empty());
}

#[test]
fn concat_tables_are_staged() {
    let temp = tempfile::tempdir().unwrap();
    let archive = zip_of(&[
        ("concat_sites.csv", "site,lat\nnorth,1.5\n"),
        ("concat_events.csv", "Event,event.1\nplant,x\n"),
    ]);
    let (app, _sleeper) = app_with(MockHobs::default().with_archive(archive), temp.path());
    let mut conn = Connection::open_in_memory().unwrap();

    let report = app
        .stage_concat_tables(&Stage::production(), &mut conn, &Quiet)
        .unwrap();
    let staged = app.stage_hobs_table(&mut conn, &Quiet).unwrap();

    assert!(report.is_complete());
    assert_eq!(staged.rows, 1);
    assert_eq!(
        staging::table_names(&conn).unwrap(),
        vec!["events", "hobs_table", "sites"]
    );
}
