#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use courier::Session;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/courier-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_daemon(path: &Path, timeout: Duration) {
    let start = Instant::now();
    loop {
        if Session::connect(path).is_ok() {
            return;
        }
        if start.elapsed() >= timeout {
            panic!("daemon did not come up");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

struct Daemon {
    child: Child,
    dir: PathBuf,
    sock: PathBuf,
}

impl Daemon {
    fn start(tag: &str) -> Self {
        let dir = unique_temp_dir(tag);
        let sock = dir.join("demo.sock");
        let child = Command::new(env!("CARGO_BIN_EXE_courier"))
            .arg("--log-level")
            .arg("error")
            .arg("serve")
            .arg(&sock)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve command should start");
        wait_for_daemon(&sock, Duration::from_secs(3));
        Self { child, dir, sock }
    }

    fn courier(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_courier"))
            .arg("--log-level")
            .arg("error")
            .arg("--format")
            .arg("json")
            .args(&args[..1])
            .arg(&self.sock)
            .args(&args[1..])
            .output()
            .expect("courier should run")
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn call_prints_reply_as_json() {
    let daemon = Daemon::start("call");

    let output = daemon.courier(&["call", "--op", "2", "--data", "hello"]);
    assert!(output.status.success());

    let reply: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("call should emit json");
    assert_eq!(reply["operation_id"], 2);
    assert_eq!(reply["body"], "olleh");
    assert_eq!(reply["body_size"], 5);
}

#[test]
fn ops_lists_demo_operations() {
    let daemon = Daemon::start("ops");

    let output = daemon.courier(&["ops"]);
    assert!(output.status.success());

    let listing: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("ops should emit json");
    let names: Vec<&str> = listing["operations"]
        .as_array()
        .expect("operations should be an array")
        .iter()
        .filter_map(|op| op["name"].as_str())
        .collect();
    assert_eq!(names, vec!["echo", "reverse", "sleep", "list_operations"]);
}

#[test]
fn unknown_operation_exits_with_remote_error() {
    let daemon = Daemon::start("unknown");

    let output = daemon.courier(&["call", "--op", "99"]);
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown_operation"));
}

#[test]
fn slow_call_times_out_with_124() {
    let daemon = Daemon::start("timeout");

    let output = daemon.courier(&["call", "--op", "3", "--json", "2000", "--timeout", "100ms"]);
    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn missing_daemon_is_a_transport_error() {
    let dir = unique_temp_dir("missing");
    let output = Command::new(env!("CARGO_BIN_EXE_courier"))
        .arg("call")
        .arg(dir.join("nobody.sock"))
        .arg("--op")
        .arg("1")
        .output()
        .expect("courier should run");

    assert_eq!(output.status.code(), Some(3));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_reports_protocol() {
    let output = Command::new(env!("CARGO_BIN_EXE_courier"))
        .arg("version")
        .arg("--extended")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(&format!("version: {}", env!("CARGO_PKG_VERSION"))));
    assert!(stdout.contains("protocol: courier/1.0"));
}
