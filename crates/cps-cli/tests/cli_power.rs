use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_clusterpower"))
}

fn tmp_path(filename: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("clusterpower_cli_{}_{}_{}", std::process::id(), nanos, filename));
    p
}

fn write_spec(name: &str, spec: serde_json::Value) -> PathBuf {
    let path = tmp_path(name);
    std::fs::write(&path, serde_json::to_string_pretty(&spec).unwrap()).unwrap();
    path
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn counts_spec() -> serde_json::Value {
    serde_json::json!({
        "narms": 3,
        "nclusters": 10,
        "nsubjects": 20,
        "family": "poisson",
        "counts": [30, 35, 70],
        "sigma_b_sq": 1.0,
        "alpha": 0.05
    })
}

fn assert_power_entry(v: &serde_json::Value) {
    let power = v.get("power").and_then(|x| x.as_f64()).expect("power should be a number");
    let lower = v.get("lower").and_then(|x| x.as_f64()).expect("lower should be a number");
    let upper = v.get("upper").and_then(|x| x.as_f64()).expect("upper should be a number");
    assert!(0.0 <= lower && lower <= power && power <= upper && upper <= 1.0, "bad interval: {v}");
}

#[test]
fn version_smoke() {
    let out = run(&["version"]);
    assert!(out.status.success(), "version should succeed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("clusterpower "), "unexpected stdout: {}", stdout);
}

#[test]
fn power_writes_report_json() {
    let input = write_spec("counts.json", counts_spec());
    let output = tmp_path("report.json");

    let out = run(&[
        "power",
        "--input",
        input.to_string_lossy().as_ref(),
        "--output",
        output.to_string_lossy().as_ref(),
        "--nsim",
        "30",
        "--seed",
        "17",
    ]);
    assert!(
        out.status.success(),
        "power should succeed, stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).expect("valid JSON");
    assert_eq!(v["status"], "complete");
    assert_eq!(v["nsim_completed"], 30);
    assert_eq!(v["seed"], 17);
    assert_eq!(v["method"], "glmm");
    assert_eq!(v["adjust"], "holm");

    let arms = v["arm_power"].as_array().expect("arm_power should be an array");
    assert_eq!(arms.len(), 2);
    arms.iter().for_each(assert_power_entry);
    assert_power_entry(&v["omnibus_power"]);
    assert!(v["convergence"].as_str().is_some());
    assert!(v["raw"].is_null());

    let _ = std::fs::remove_file(&input);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn power_is_deterministic_across_worker_counts() {
    let input = write_spec("det.json", counts_spec());
    let base = ["power", "--nsim", "12", "--seed", "4", "--method", "gee"];

    let mut reports = Vec::new();
    for workers in [None, Some("3")] {
        let mut args: Vec<String> = base.iter().map(|s| s.to_string()).collect();
        args.extend(["--input".to_string(), input.to_string_lossy().into_owned()]);
        if let Some(w) = workers {
            args.extend(["--workers".to_string(), w.to_string()]);
        }
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = run(&refs);
        assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
        let mut v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("valid JSON");
        v.as_object_mut().unwrap().remove("wall_s");
        reports.push(v);
    }
    assert_eq!(reports[0], reports[1]);
    assert_eq!(reports[0]["adjust"], "none", "GEE contrasts are not adjusted");

    let _ = std::fs::remove_file(&input);
}

#[test]
fn power_abort_writes_partial_report_and_fails() {
    let spec = serde_json::json!({
        "narms": 2,
        "nclusters": 8,
        "nsubjects": 10,
        "family": "normal",
        "mu": [0.0, 0.0],
        "sigma_b_sq": 0.0,
        "sigma_sq": 1.0
    });
    let input = write_spec("null.json", spec);
    let output = tmp_path("aborted.json");

    let out = run(&[
        "power",
        "--input",
        input.to_string_lossy().as_ref(),
        "--output",
        output.to_string_lossy().as_ref(),
        "--nsim",
        "200",
        "--seed",
        "1",
        "--poor-fit-override",
        "--time-limit-override",
    ]);
    assert!(!out.status.success(), "low-power run should exit non-zero");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("low power abort"), "stderr={stderr}");

    let v: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).expect("valid JSON");
    assert_eq!(v["status"], "halted_low_power");
    assert_eq!(v["abort"]["kind"], "low_power");
    assert_eq!(v["nsim_completed"], 60);

    let _ = std::fs::remove_file(&input);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn power_rejects_malformed_design() {
    let mut spec = counts_spec();
    spec["nsubjects"] = serde_json::json!([20, [20, 0, 20, 20, 20, 20, 20, 20, 20, 20], 20]);
    let input = write_spec("bad.json", spec);

    let out = run(&["power", "--input", input.to_string_lossy().as_ref(), "--nsim", "5"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("zero subjects"), "stderr={stderr}");

    let _ = std::fs::remove_file(&input);
}

#[test]
fn generate_writes_dataset() {
    let input = write_spec("gen.json", counts_spec());
    let out = run(&["generate", "--input", input.to_string_lossy().as_ref(), "--seed", "8"]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("valid JSON");
    assert_eq!(v["n_arms"], 3);
    assert_eq!(v["n_clusters"], 30);
    let obs = v["observations"].as_array().expect("observations should be an array");
    assert_eq!(obs.len(), 600);
    for arm in 0..3 {
        assert_eq!(obs.iter().filter(|o| o["arm"] == arm).count(), 200);
    }

    let _ = std::fs::remove_file(&input);
}
