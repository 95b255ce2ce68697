//! End-to-end tests against the built worker binary, with a shell script
//! standing in for the Python bridge.
#![cfg(unix)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use serde_json::{json, Value};

fn fake_bridge() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("fake_bridge.sh")
}

/// Run the worker on `lines` with the fake bridge, closing stdin afterwards.
fn run_worker(lines: &[Value], envs: &[(&str, &str)]) -> Output {
    run_worker_with_script(lines, envs, &fake_bridge())
}

fn run_worker_with_script(lines: &[Value], envs: &[(&str, &str)], script: &Path) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_audiosr-worker"));
    cmd.arg("--python")
        .arg("sh")
        .arg("--bridge-script")
        .arg(script)
        .arg("--log-level")
        .arg("debug")
        .env_remove("FAKE_BRIDGE_POSITIONAL_ONLY")
        .env_remove("AUDIOSR_NO_STDOUT_ISOLATION")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in envs {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn().expect("spawn worker");
    {
        let stdin = child.stdin.as_mut().expect("stdin");
        for line in lines {
            stdin
                .write_all(format!("{line}\n").as_bytes())
                .expect("write command");
        }
    }
    drop(child.stdin.take());
    child.wait_with_output().expect("wait for worker")
}

/// Every stdout line must be a response object.
fn responses(output: &Output) -> Vec<Value> {
    let stdout = String::from_utf8(output.stdout.clone()).expect("utf-8 stdout");
    stdout
        .lines()
        .map(|line| {
            let value: Value = serde_json::from_str(line)
                .unwrap_or_else(|e| panic!("non-JSON line on protocol stream {line:?}: {e}"));
            let status = value.get("status").and_then(Value::as_str);
            assert!(
                matches!(status, Some("ok") | Some("error")),
                "unexpected response shape: {value}"
            );
            assert!(value.get("message").and_then(Value::as_str).is_some());
            value
        })
        .collect()
}

fn messages(output: &Output) -> Vec<String> {
    responses(output)
        .iter()
        .map(|r| r["message"].as_str().unwrap_or_default().to_string())
        .collect()
}

fn process(device: &str, input: &str) -> Value {
    json!({
        "command": "process",
        "model_name": "basic",
        "device": device,
        "input": input,
        "output": "b.wav"
    })
}

fn launches(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn ping_process_shutdown() {
    let output = run_worker(
        &[
            json!({"command": "ping"}),
            process("cpu", "a.wav"),
            json!({"command": "shutdown"}),
        ],
        &[],
    );
    assert_eq!(messages(&output), vec!["ready", "done", "shutdown"]);
    assert!(responses(&output).iter().all(|r| r["status"] == "ok"));
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn end_of_input_exits_cleanly() {
    let output = run_worker(&[json!({"command": "ping"})], &[]);
    assert_eq!(messages(&output), vec!["ready"]);
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn lines_after_shutdown_are_not_answered() {
    let output = run_worker(
        &[json!({"command": "shutdown"}), json!({"command": "ping"})],
        &[],
    );
    assert_eq!(messages(&output), vec!["shutdown"]);
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn malformed_json_then_ping() {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_audiosr-worker"));
    let mut child = cmd
        .arg("--bridge-script")
        .arg(fake_bridge())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn worker");
    child
        .stdin
        .as_mut()
        .expect("stdin")
        .write_all(b"{\"command\": \n\n{\"command\":\"ping\"}\n")
        .expect("write");
    drop(child.stdin.take());
    let output = child.wait_with_output().expect("wait");

    let responses = responses(&output);
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["status"], "error");
    assert_eq!(responses[1]["message"], "ready");
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn same_model_and_device_launch_one_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("launches.log");
    let output = run_worker(
        &[process("cpu", "a.wav"), process("cpu", "c.wav")],
        &[("FAKE_BRIDGE_LOG", log.to_str().unwrap())],
    );
    assert_eq!(messages(&output), vec!["done", "done"]);
    assert_eq!(launches(&log), vec!["--model-name basic --device cpu"]);
}

#[test]
fn device_change_launches_new_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("launches.log");
    let output = run_worker(
        &[process("cpu", "a.wav"), process("cuda", "a.wav")],
        &[("FAKE_BRIDGE_LOG", log.to_str().unwrap())],
    );
    assert_eq!(messages(&output), vec!["done", "done"]);
    assert_eq!(
        launches(&log),
        vec![
            "--model-name basic --device cpu",
            "--model-name basic --device cuda"
        ]
    );
}

#[test]
fn positional_bridge_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("launches.log");
    let output = run_worker(
        &[process("cpu", "a.wav")],
        &[
            ("FAKE_BRIDGE_LOG", log.to_str().unwrap()),
            ("FAKE_BRIDGE_POSITIONAL_ONLY", "1"),
        ],
    );
    assert_eq!(messages(&output), vec!["done"]);
    assert_eq!(
        launches(&log),
        vec!["--model-name basic --device cpu", "basic cpu"]
    );
}

#[test]
fn dead_bridge_is_replaced_on_next_request() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("launches.log");
    let output = run_worker(
        &[
            process("cpu", "crash.wav"),
            process("cpu", "a.wav"),
            process("cpu", "a.wav"),
        ],
        &[("FAKE_BRIDGE_LOG", log.to_str().unwrap())],
    );
    let messages = messages(&output);
    assert_eq!(messages.len(), 3);
    assert!(messages[0].contains("bridge exited before replying"));
    assert_eq!(messages[1..], ["done", "done"]);
    assert_eq!(
        launches(&log),
        vec![
            "--model-name basic --device cpu",
            "--model-name basic --device cpu"
        ]
    );
}

#[test]
fn stdout_isolation_can_be_disabled_from_env() {
    let output = run_worker(
        &[json!({"command": "ping"})],
        &[("AUDIOSR_NO_STDOUT_ISOLATION", "1")],
    );
    assert_eq!(messages(&output), vec!["ready"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Stdout isolation disabled"));

    let output = run_worker(
        &[json!({"command": "ping"})],
        &[("AUDIOSR_NO_STDOUT_ISOLATION", "false")],
    );
    assert_eq!(messages(&output), vec!["ready"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("Stdout isolation disabled"));
}

#[test]
fn missing_input_is_an_error() {
    let output = run_worker(
        &[
            json!({"command": "process", "model_name": "basic", "device": "cpu", "output": "b.wav"}),
            json!({"command": "ping"}),
        ],
        &[],
    );
    let responses = responses(&output);
    assert_eq!(responses[0]["status"], "error");
    assert_eq!(responses[0]["message"], "input or output not specified");
    assert_eq!(responses[1]["message"], "ready");
}

#[test]
fn inference_error_carries_traceback() {
    let output = run_worker(
        &[process("cpu", "fail.wav"), json!({"command": "ping"})],
        &[],
    );
    let responses = responses(&output);
    assert_eq!(responses[0]["status"], "error");
    assert!(responses[0]["message"]
        .as_str()
        .unwrap()
        .contains("inference exploded"));
    let traceback = responses[0]["traceback"].as_str().unwrap();
    assert!(traceback.contains("Traceback (most recent call last):"));
    assert_eq!(responses[1]["message"], "ready");
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn raw_samples_are_written_as_wav() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("upsampled.wav");
    let output = run_worker(
        &[json!({
            "command": "process",
            "model_name": "basic",
            "device": "cpu",
            "input": "raw.wav",
            "output": &out,
            "ddim_steps": 50,
            "seed": 1234
        })],
        &[],
    );
    assert_eq!(messages(&output), vec!["done"]);

    let reader = hound::WavReader::open(&out).expect("open written wav");
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.spec().sample_rate, 16_000);
    assert_eq!(reader.duration(), 4);
}

#[test]
fn bridge_noise_stays_on_stderr() {
    let output = run_worker(&[process("cpu", "a.wav")], &[]);
    assert_eq!(messages(&output), vec!["done"]);

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stdout.contains("Downloading checkpoint"));
    assert!(stderr.contains("Downloading checkpoint"));
    assert!(stderr.contains("fake bridge: loading"));
}

#[test]
fn missing_bridge_script_is_reported_per_request() {
    let output = run_worker_with_script(
        &[
            json!({"command": "ping"}),
            process("cpu", "a.wav"),
            json!({"command": "shutdown"}),
        ],
        &[],
        Path::new("/nonexistent/audiosr_bridge.py"),
    );
    let responses = responses(&output);
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["message"], "ready");
    assert_eq!(responses[1]["status"], "error");
    assert!(responses[1]["message"]
        .as_str()
        .unwrap()
        .contains("bridge script not found"));
    assert_eq!(responses[2]["message"], "shutdown");
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn unsupported_command_is_reported() {
    let output = run_worker(&[json!({"command": "reload"})], &[]);
    let responses = responses(&output);
    assert_eq!(responses[0]["status"], "error");
    assert_eq!(responses[0]["message"], "unsupported command: reload");
}
