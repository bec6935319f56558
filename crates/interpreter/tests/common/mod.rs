//! Drives the `run` subcommand of the built binary against a real backend.

use std::process::Command;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

pub const MARKER: &str = "\n...[truncated]";

pub fn execute(backend: &str, request: &Value, envs: &[(&str, &str)]) -> Value {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("request.json");
    std::fs::write(&path, serde_json::to_vec(request).unwrap()).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_code-interpreter"))
        .arg("run")
        .arg(&path)
        .env("EXECUTOR_BACKEND", backend)
        .env("FILE_STORAGE_DIR", dir.path())
        .envs(envs.iter().copied())
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

pub fn file<'a>(response: &'a Value, path: &str) -> Option<&'a Value> {
    response["files"]
        .as_array()
        .unwrap()
        .iter()
        .find(|f| f["path"] == path)
}

/// Two runs at once, each writing and re-reading the same relative path.
pub fn concurrent_runs_keep_their_own_files(backend: &'static str) {
    let runs: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|tag| {
            std::thread::spawn(move || {
                let code = format!(
                    "import time\nopen('out.txt', 'w').write('{tag}')\ntime.sleep(1)\n\
                     print(open('out.txt').read())"
                );
                let request = json!({ "code": code, "last_line_interactive": false });
                (tag, execute(backend, &request, &[]))
            })
        })
        .collect();

    for run in runs {
        let (tag, response) = run.join().unwrap();
        assert_eq!(response["stdout"], format!("{tag}\n"));
        let out = file(&response, "out.txt").unwrap();
        assert_eq!(out["content"], STANDARD.encode(tag));
    }
}
