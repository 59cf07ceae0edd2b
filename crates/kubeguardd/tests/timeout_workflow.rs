use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

struct DaemonHarness {
    child: Child,
    root: PathBuf,
    state_path: PathBuf,
    kubectl_dir: PathBuf,
}

impl DaemonHarness {
    fn start(config_yaml: &str, contexts: &[&str], current: &str) -> Self {
        Self::start_with(config_yaml, contexts, current, None)
    }

    fn start_with(
        config_yaml: &str,
        contexts: &[&str],
        current: &str,
        seed_state: Option<(&str, Duration)>,
    ) -> Self {
        let root = unique_temp_dir("timeout-workflow");
        fs::create_dir_all(&root).expect("failed to create harness root");
        let kubectl_dir = root.join("bin");
        write_fake_kubectl(&kubectl_dir, contexts, current);

        let config_path = root.join("config.yaml");
        fs::write(&config_path, config_yaml).expect("failed to write config");
        let state_path = root.join("state.json");
        if let Some((context, age)) = seed_state {
            write_state(&state_path, context, age);
        }

        let child = spawn_daemon(&root, &config_path, &state_path, &kubectl_dir);
        let harness = Self {
            child,
            root,
            state_path,
            kubectl_dir,
        };
        harness.wait_for_pid_file();
        harness
    }

    fn pid_path(&self) -> PathBuf {
        self.root.join("kubeguardd.pid")
    }

    fn wait_for_pid_file(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.pid_path().exists() {
                return;
            }
            thread::sleep(Duration::from_millis(25));
        }
        panic!("timed out waiting for daemon to write its pid file");
    }

    fn wait_for_state_file(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.state_path.exists() {
                return;
            }
            thread::sleep(Duration::from_millis(25));
        }
        panic!("timed out waiting for the initial activity record");
    }

    fn current_context(&self) -> String {
        fs::read_to_string(self.kubectl_dir.join("current.txt"))
            .expect("failed to read current context")
            .trim()
            .to_string()
    }

    fn recorded_context(&self) -> String {
        let raw = fs::read_to_string(&self.state_path).expect("failed to read activity record");
        let record: serde_json::Value =
            serde_json::from_str(&raw).expect("activity record is not valid JSON");
        record["context"].as_str().unwrap_or_default().to_string()
    }

    fn switch_calls(&self) -> usize {
        let log = self.kubectl_dir.join("calls.log");
        match fs::read_to_string(log) {
            Ok(content) => content
                .lines()
                .filter(|line| line.starts_with("config use-context"))
                .count(),
            Err(_) => 0,
        }
    }

    fn write_state(&self, context: &str, age: Duration) {
        write_state(&self.state_path, context, age);
    }
}

impl Drop for DaemonHarness {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = fs::remove_dir_all(&self.root);
    }
}

#[test]
fn inactivity_triggers_switch_and_closes_the_loop() {
    let config = "timeout:\n  default: 2s\n  check_interval: 500ms\ndefault_context: test-default\n";
    let harness = DaemonHarness::start(config, &["test-default", "test-prod"], "test-prod");
    harness.wait_for_state_file();

    // Stale activity appears while the daemon is running.
    harness.write_state("test-prod", Duration::from_secs(3));

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.current_context() != "test-default" {
        assert!(
            Instant::now() < deadline,
            "daemon did not switch to the safe default in time"
        );
        thread::sleep(Duration::from_millis(50));
    }

    // The record closes the loop with the new context.
    let deadline = Instant::now() + Duration::from_secs(2);
    while harness.recorded_context() != "test-default" {
        assert!(
            Instant::now() < deadline,
            "activity record was not updated after the switch"
        );
        thread::sleep(Duration::from_millis(50));
    }

    // Post-switch stability: another interval passes without a second switch.
    let switches = harness.switch_calls();
    assert_eq!(switches, 1, "expected exactly one switch");
    thread::sleep(Duration::from_millis(1200));
    assert_eq!(harness.switch_calls(), switches);
    assert_eq!(harness.current_context(), "test-default");
}

#[test]
fn ongoing_activity_prevents_the_switch() {
    let config = "timeout:\n  default: 1s\n  check_interval: 300ms\ndefault_context: test-default\n";
    let harness = DaemonHarness::start(config, &["test-default", "test-prod"], "test-prod");
    harness.wait_for_state_file();

    let stop_at = Instant::now() + Duration::from_millis(2500);
    while Instant::now() < stop_at {
        harness.write_state("test-prod", Duration::ZERO);
        thread::sleep(Duration::from_millis(400));
        assert_eq!(harness.current_context(), "test-prod");
    }
    assert_eq!(harness.switch_calls(), 0);
}

#[test]
fn protected_context_is_never_switched_away_from() {
    let config = "timeout:\n  default: 1s\n  check_interval: 300ms\ndefault_context: test-default\nsafety:\n  never_switch_from:\n    - test-prod\n";
    let harness = DaemonHarness::start(config, &["test-default", "test-prod"], "test-prod");
    harness.wait_for_state_file();
    harness.write_state("test-prod", Duration::from_secs(3600));

    thread::sleep(Duration::from_millis(1500));
    assert_eq!(harness.current_context(), "test-prod");
    assert_eq!(harness.switch_calls(), 0);
}

#[test]
fn startup_with_stale_record_resets_without_switching() {
    let config = "timeout:\n  default: 30s\n  check_interval: 500ms\ndefault_context: test-default\n";
    let harness = DaemonHarness::start_with(
        config,
        &["test-default", "test-prod"],
        "test-prod",
        Some(("test-prod", Duration::from_secs(48 * 3600))),
    );

    // The countdown restarts: the record gets a fresh timestamp and the
    // first ticks do not switch.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let raw = fs::read_to_string(&harness.state_path).unwrap();
        let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
        if let Some(timestamp) = record["last_activity"].as_str() {
            let timestamp = chrono::DateTime::parse_from_rfc3339(timestamp).unwrap();
            let age = chrono::Utc::now().signed_duration_since(timestamp);
            if age < chrono::Duration::seconds(5) {
                break;
            }
        }
        assert!(
            Instant::now() < deadline,
            "stale record was not refreshed on startup"
        );
        thread::sleep(Duration::from_millis(50));
    }

    thread::sleep(Duration::from_millis(1500));
    assert_eq!(harness.switch_calls(), 0);
    assert_eq!(harness.current_context(), "test-prod");
    assert_eq!(harness.recorded_context(), "test-prod");
}

#[test]
fn startup_after_external_switch_rewrites_the_record() {
    let config = "timeout:\n  default: 30s\n  check_interval: 500ms\ndefault_context: test-default\n";
    let harness = DaemonHarness::start_with(
        config,
        &["test-default", "test-prod"],
        "test-default",
        Some(("some-old-name", Duration::from_secs(10))),
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.recorded_context() != "test-default" {
        assert!(
            Instant::now() < deadline,
            "record was not rewritten to the current context"
        );
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(harness.switch_calls(), 0);
}

fn write_fake_kubectl(dir: &Path, contexts: &[&str], current: &str) {
    fs::create_dir_all(dir).expect("failed to create fake kubectl dir");
    fs::write(dir.join("contexts.txt"), format!("{}\n", contexts.join("\n")))
        .expect("failed to write contexts");
    fs::write(dir.join("current.txt"), format!("{current}\n"))
        .expect("failed to write current context");

    let script = "#!/bin/sh\n\
dir=\"$(cd \"$(dirname \"$0\")\" && pwd)\"\n\
echo \"$@\" >> \"$dir/calls.log\"\n\
case \"$1 $2\" in\n\
  \"config get-contexts\") cat \"$dir/contexts.txt\" ;;\n\
  \"config current-context\") cat \"$dir/current.txt\" ;;\n\
  \"config use-context\") printf '%s\\n' \"$3\" > \"$dir/current.txt\"; printf 'Switched to context \"%s\".\\n' \"$3\" ;;\n\
  *) echo \"unknown kubectl invocation: $*\" >&2; exit 1 ;;\n\
esac\n";
    let path = dir.join("kubectl");
    fs::write(&path, script).expect("failed to write fake kubectl");
    let mut perms = fs::metadata(&path).expect("missing script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("failed to mark fake kubectl executable");
}

fn write_state(path: &Path, context: &str, age: Duration) {
    let timestamp = chrono::Utc::now() - chrono::Duration::from_std(age).unwrap();
    let record = serde_json::json!({
        "version": 1,
        "last_activity": timestamp.to_rfc3339(),
        "context": context,
    });
    // Rename keeps the daemon from ever reading a half-written record.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&record).unwrap())
        .expect("failed to stage activity record");
    fs::rename(&tmp, path).expect("failed to replace activity record");
}

fn spawn_daemon(root: &Path, config_path: &Path, state_path: &Path, kubectl_dir: &Path) -> Child {
    let path_env = format!(
        "{}:{}",
        kubectl_dir.display(),
        std::env::var("PATH").unwrap_or_default()
    );
    Command::new(env!("CARGO_BIN_EXE_kubeguardd"))
        .arg("--config")
        .arg(config_path)
        .arg("--state")
        .arg(state_path)
        .arg("--pid-file")
        .arg(root.join("kubeguardd.pid"))
        .arg("--no-log-file")
        .env("PATH", path_env)
        .env("XDG_STATE_HOME", root.join("xdg-state"))
        .env("XDG_CONFIG_HOME", root.join("xdg-config"))
        .env("KUBECONFIG", root.join("kubeconfig"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn kubeguardd")
}

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock drift before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("kubeguard-it-{label}-{nanos}"))
}
