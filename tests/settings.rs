use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use assert_matches::assert_matches;

use hobs_toolkit::error::HobsError;
use hobs_toolkit::poll::PollPolicy;
use hobs_toolkit::settings::{CREDENTIALS_PATH_VAR, Settings, SettingsLoader, USER_EMAIL_VAR};

fn write_credentials(dir: &Path, content: &str) -> String {
    let path = dir.join("service-account.json");
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

fn resolve(vars: &[(&str, String)]) -> Result<Settings, HobsError> {
    let vars = vars
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect::<HashMap<_, _>>();
    SettingsLoader::resolve(|name| vars.get(name).cloned())
}

fn base_vars(dir: &Path) -> Vec<(&'static str, String)> {
    vec![
        (
            CREDENTIALS_PATH_VAR,
            write_credentials(dir, r#"{"type": "service_account", "project_id": "scratch"}"#),
        ),
        (USER_EMAIL_VAR, "modeler@example.com".to_string()),
    ]
}

#[test]
fn defaults_apply_when_only_required_vars_are_set() {
    let temp = tempfile::tempdir().unwrap();
    let settings = resolve(&base_vars(temp.path())).unwrap();

    assert_eq!(settings.user_email, "modeler@example.com");
    assert_eq!(settings.credentials["project_id"], "scratch");
    assert_eq!(settings.hobs_url, "http://api.us.prod.internal:9089/hobs-service/");
    assert_eq!(settings.bucket, "env_sci_scratch");
    assert_eq!(settings.base_folder, "hobs/temp_configs");
    assert_eq!(settings.poll, PollPolicy::default());
    assert_eq!(settings.download_timeout, Duration::from_secs(6000));
    assert_eq!(settings.db_path, Path::new("hobs_concat_tables.db"));
}

#[test]
fn missing_email_is_reported_by_name() {
    let temp = tempfile::tempdir().unwrap();
    let mut vars = base_vars(temp.path());
    vars.retain(|(name, _)| *name != USER_EMAIL_VAR);

    let err = resolve(&vars).unwrap_err();
    assert_matches!(err, HobsError::MissingSetting(name) if name == USER_EMAIL_VAR);
}

#[test]
fn blank_value_counts_as_missing() {
    let temp = tempfile::tempdir().unwrap();
    let mut vars = base_vars(temp.path());
    for (name, value) in vars.iter_mut() {
        if *name == USER_EMAIL_VAR {
            *value = "   ".to_string();
        }
    }

    let err = resolve(&vars).unwrap_err();
    assert_matches!(err, HobsError::MissingSetting(_));
}

#[test]
fn unreadable_credentials_file() {
    let temp = tempfile::tempdir().unwrap();
    let vars = vec![
        (
            CREDENTIALS_PATH_VAR,
            temp.path().join("absent.json").to_string_lossy().into_owned(),
        ),
        (USER_EMAIL_VAR, "modeler@example.com".to_string()),
    ];

    let err = resolve(&vars).unwrap_err();
    assert_matches!(err, HobsError::CredentialsRead { .. });
}

#[test]
fn credentials_must_be_json() {
    let temp = tempfile::tempdir().unwrap();
    let vars = vec![
        (CREDENTIALS_PATH_VAR, write_credentials(temp.path(), "not json")),
        (USER_EMAIL_VAR, "modeler@example.com".to_string()),
    ];

    let err = resolve(&vars).unwrap_err();
    assert_matches!(err, HobsError::CredentialsParse { .. });
}

#[test]
fn overrides_are_honored() {
    let temp = tempfile::tempdir().unwrap();
    let mut vars = base_vars(temp.path());
    vars.extend([
        ("HOBS_URL", "http://localhost:9089/hobs".to_string()),
        ("HOBS_GCS_BASE_FOLDER", "/scratch/configs/".to_string()),
        ("HOBS_MIRROR_ROOT", "/var/tmp/mirror".to_string()),
        ("HOBS_POLL_INTERVAL_SECS", "5".to_string()),
        ("HOBS_POLL_MAX_ATTEMPTS", "0".to_string()),
        ("HOBS_DB_PATH", "/data/hobs.db".to_string()),
    ]);

    let settings = resolve(&vars).unwrap();

    assert_eq!(settings.hobs_url, "http://localhost:9089/hobs/");
    assert_eq!(settings.base_folder, "scratch/configs");
    assert_eq!(settings.mirror_root.as_str(), "/var/tmp/mirror");
    assert_eq!(settings.poll, PollPolicy::unbounded(Duration::from_secs(5)));
    assert_eq!(settings.db_path, Path::new("/data/hobs.db"));
}

#[test]
fn non_numeric_interval_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let mut vars = base_vars(temp.path());
    vars.push(("HOBS_POLL_INTERVAL_SECS", "1m".to_string()));

    let err = resolve(&vars).unwrap_err();
    assert_matches!(err, HobsError::InvalidSetting { name, .. } if name == "HOBS_POLL_INTERVAL_SECS");
}
