use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn rcache_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("rcache");
    path
}

fn record(identifier: &str, datestamp: &str, sets: &[&str]) -> String {
    let sets: String = sets
        .iter()
        .map(|s| format!("    <setSpec>{s}</setSpec>\n"))
        .collect();
    format!(
        "<record>\n  <header>\n    <identifier>{identifier}</identifier>\n    <datestamp>{datestamp}</datestamp>\n{sets}  </header>\n  <metadata>\n    <dc><title>{identifier}</title></dc>\n  </metadata>\n</record>\n"
    )
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Repository laid out on disk
    let repo = root.join("repo");
    fs::create_dir_all(repo.join("records")).unwrap();
    fs::create_dir_all(repo.join("sets")).unwrap();
    fs::create_dir_all(repo.join("formats")).unwrap();
    fs::write(
        repo.join("identity.xml"),
        "<Identify><repositoryName>Test Repository</repositoryName></Identify>",
    )
    .unwrap();
    fs::write(
        repo.join("formats/oai_dc.txt"),
        "http://www.openarchives.org/OAI/2.0/oai_dc/\nhttp://www.openarchives.org/OAI/2.0/oai_dc.xsd\n",
    )
    .unwrap();
    fs::write(
        repo.join("sets/physics.xml"),
        "<set><setSpec>physics</setSpec><setName>Physics</setName></set>",
    )
    .unwrap();
    fs::write(
        repo.join("records/alpha-oai_dc-2005-01-01T08-50-44.xml"),
        record("oai:test:alpha", "2005-01-01T08:50:44Z", &["physics"]),
    )
    .unwrap();
    fs::write(
        repo.join("records/beta-oai_dc-2005-01-02T00-00-00.xml"),
        record("oai:test:beta", "2005-01-02T00:00:00Z", &[]),
    )
    .unwrap();
    fs::write(
        repo.join("records/gamma-oai_dc-2005-01-03T00-00-00.xml"),
        record("oai:test:gamma", "2005-01-03", &["physics"]),
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/cache.sqlite"

[cache]
dir = "{root}/data/records"

[sessions]
dir = "{root}/data/sessions"
poll_interval_ms = 20

[responder]
incomplete_record_list_size = 2
incomplete_identifier_list_size = 2
incomplete_set_list_size = 10

[updater]
max_workers = 2
max_work_batch_size = 2
handoff_poll_ms = 20

[source]
dir = "{root}/repo"
identifier_prefix = "oai:test:"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("rcache.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_rcache(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = rcache_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rcache binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn harvested_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_rcache(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    let (stdout, stderr, success) = run_rcache(&config_path, &["update"]);
    assert!(success, "update failed: stdout={}, stderr={}", stdout, stderr);
    (tmp, config_path)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_rcache(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_rcache(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_rcache(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_update_harvests_repository() {
    let (_tmp, config_path) = setup_test_env();
    run_rcache(&config_path, &["init"]);

    let (stdout, stderr, success) = run_rcache(&config_path, &["update"]);
    assert!(success, "update failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("queued:     3"));
    assert!(stdout.contains("polled:     yes"));

    let (stdout, _, success) = run_rcache(&config_path, &["stats", "--json"]);
    assert!(success);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["records"], 3);
    assert_eq!(stats["sets"], 1);
    assert_eq!(stats["queued"], 0);
    assert_eq!(stats["failures"], 0);
    assert_eq!(stats["by_format"][0]["prefix"], "oai_dc");
}

#[test]
fn test_second_update_is_a_no_op() {
    let (_tmp, config_path) = harvested_env();

    let (stdout, _, success) = run_rcache(&config_path, &["update"]);
    assert!(success);
    assert!(stdout.contains("queued:     0"));
    assert!(stdout.contains("polled:     no"));
}

#[test]
fn test_list_records_follows_tokens() {
    let (_tmp, config_path) = harvested_env();

    let (stdout, stderr, success) = run_rcache(&config_path, &["list-records", "--prefix", "oai_dc"]);
    assert!(success, "list-records failed: {}", stderr);
    assert_eq!(stdout.matches("<ListRecords>").count(), 2);
    assert_eq!(stdout.matches("<metadata>").count(), 3);
    assert!(stdout.contains("<resumptionToken cursor=\"0\">"));
    assert!(stdout.contains("<resumptionToken cursor=\"2\"/>"));
}

#[test]
fn test_list_identifiers_by_set() {
    let (_tmp, config_path) = harvested_env();

    let (stdout, stderr, success) = run_rcache(
        &config_path,
        &["list-records", "--prefix", "oai_dc", "--set", "physics", "--identifiers"],
    );
    assert!(success, "list-records failed: {}", stderr);
    assert!(stdout.contains("<ListIdentifiers>"));
    assert!(stdout.contains("oai:test:alpha"));
    assert!(stdout.contains("oai:test:gamma"));
    assert!(!stdout.contains("oai:test:beta"));
    assert!(!stdout.contains("<metadata>"));
}

#[test]
fn test_list_records_errors() {
    let (_tmp, config_path) = harvested_env();

    let (_, stderr, success) = run_rcache(&config_path, &["list-records", "--prefix", "marc"]);
    assert!(!success);
    assert!(stderr.contains("cannotDisseminateFormat"));

    let (_, stderr, success) = run_rcache(
        &config_path,
        &["list-records", "--prefix", "oai_dc", "--until", "2000-01-01"],
    );
    assert!(!success);
    assert!(stderr.contains("noRecordsMatch"));

    let (_, stderr, success) = run_rcache(
        &config_path,
        &["list-records", "--prefix", "oai_dc", "--from", "tomorrow"],
    );
    assert!(!success);
    assert!(stderr.contains("badArgument"));
}

#[test]
fn test_get_record() {
    let (_tmp, config_path) = harvested_env();

    let (stdout, stderr, success) = run_rcache(&config_path, &["get-record", "oai:test:beta", "oai_dc"]);
    assert!(success, "get-record failed: {}", stderr);
    assert!(stdout.contains("<identifier>oai:test:beta</identifier>"));
    assert!(!stdout.contains("2005-01-02T00:00:00Z"));

    let (_, stderr, success) = run_rcache(&config_path, &["get-record", "oai:test:nothing", "oai_dc"]);
    assert!(!success);
    assert!(stderr.contains("idDoesNotExist"));
}

#[test]
fn test_identify_formats_and_sets() {
    let (_tmp, config_path) = harvested_env();

    let (stdout, _, success) = run_rcache(&config_path, &["identify"]);
    assert!(success);
    assert!(stdout.contains("Test Repository"));

    let (stdout, _, success) = run_rcache(&config_path, &["formats"]);
    assert!(success);
    assert!(stdout.contains("<metadataPrefix>oai_dc</metadataPrefix>"));

    let (stdout, _, success) = run_rcache(&config_path, &["formats", "--identifier", "oai:test:alpha"]);
    assert!(success);
    assert!(stdout.contains("oai_dc"));

    let (stdout, _, success) = run_rcache(&config_path, &["list-sets"]);
    assert!(success);
    assert!(stdout.contains("<setName>Physics</setName>"));
}

#[test]
fn test_identify_before_harvest_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_rcache(&config_path, &["init"]);

    let (_, stderr, success) = run_rcache(&config_path, &["identify"]);
    assert!(!success);
    assert!(stderr.contains("not been polled"));
}

#[test]
fn test_invalid_record_is_reported_as_failure() {
    let (tmp, config_path) = setup_test_env();
    fs::write(
        tmp.path().join("repo/records/delta-oai_dc-2005-01-04T00-00-00.xml"),
        "<record><header><identifier>oai:test:delta</identifier><datestamp>soon</datestamp></header></record>",
    )
    .unwrap();
    run_rcache(&config_path, &["init"]);
    let (_, stderr, success) = run_rcache(&config_path, &["update"]);
    assert!(success, "update failed: {}", stderr);

    let (stdout, _, success) = run_rcache(&config_path, &["failures"]);
    assert!(success);
    assert!(stdout.contains("oai:test:delta"));
    assert!(stdout.contains("Unparsable datestamp"));

    let (stdout, _, _) = run_rcache(&config_path, &["stats", "--json"]);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["records"], 3);
    assert_eq!(stats["failures"], 1);
}

#[test]
fn test_polling_off_skips_remote() {
    let (_tmp, config_path) = setup_test_env();
    run_rcache(&config_path, &["init"]);

    let (stdout, _, success) = run_rcache(&config_path, &["polling", "off"]);
    assert!(success);
    assert!(stdout.contains("disabled"));

    let (stdout, _, success) = run_rcache(&config_path, &["update"]);
    assert!(success);
    assert!(stdout.contains("queued:     0"));

    let (_, stderr, success) = run_rcache(&config_path, &["queue"]);
    assert!(success);
    assert!(stderr.contains("0 queued item(s)"));

    let (stdout, _, success) = run_rcache(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Polling:     disabled"));
}

#[test]
fn test_prune_with_nothing_to_prune() {
    let (_tmp, config_path) = harvested_env();

    let (stdout, _, success) = run_rcache(&config_path, &["prune"]);
    assert!(success);
    assert!(stdout.contains("Pruned 0 file(s)."));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_rcache(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
