use std::{fs, path::PathBuf, process::Command};

use serde_json::json;

fn workdir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("attrbench-cli-{}-{name}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn attrbench() -> Command {
    Command::new(env!("CARGO_BIN_EXE_attrbench"))
}

#[test]
fn run_spawns_workers_and_saves_results() {
    let dir = workdir("run");
    let output = dir.join("deletion.safetensors");
    let config = dir.join("config.json");

    let run = json!({
        "address": "127.0.0.1",
        "port": 0,
        "devices": [0, 1],
        "batch_size": 3,
        "model": { "name": "linear", "params": { "input_shape": [1, 2, 2], "num_classes": 3 } },
        "dataset": { "name": "synthetic", "params": { "len": 8, "shape": [1, 2, 2], "num_classes": 3 } },
        "methods": { "occlusion": { "name": "occlusion" } },
        "task": {
            "kind": "deletion",
            "mode": "lerf",
            "start": 0.0,
            "stop": 1.0,
            "num_steps": 2,
            "maskers": { "zero": { "granularity": "pixel" } },
            "activation_fns": ["linear"],
        },
        "output": output,
        "seed": 5,
    });
    fs::write(&config, serde_json::to_vec_pretty(&run).unwrap()).unwrap();

    let out = attrbench().arg("run").arg(&config).output().unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(output.exists());
}

#[test]
fn unknown_mode_prints_usage() {
    let out = attrbench().arg("train").output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("usage"));
}

#[test]
fn missing_config_fails() {
    let dir = workdir("missing");
    let out = attrbench()
        .arg("run")
        .arg(dir.join("nope.json"))
        .output()
        .unwrap();

    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("invalid config"));
}
