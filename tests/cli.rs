use std::fs;
use std::process::Command;

use tempfile::tempdir;

fn write_workdir(dir: &std::path::Path) {
    let mut parameters = String::from("trial,contacts,isolation_delay\n");
    let mut outcomes = String::from("trial,attack_rate,peak_day\n");
    for i in 0..12 {
        let contacts = (i % 5) as f64 + 0.5 * i as f64;
        let delay = ((i * 7) % 4) as f64;
        parameters.push_str(&format!("s{i},{contacts},{delay}\n"));
        outcomes.push_str(&format!(
            "s{i},{},{}\n",
            0.1 * contacts,
            30.0 - 2.0 * delay
        ));
    }
    fs::write(dir.join("input_parameter_samples.csv"), parameters).expect("write parameters");
    fs::write(dir.join("output_loss_samples.csv"), outcomes).expect("write outcomes");
}

#[test]
fn analyse_then_predict_from_the_command_line() {
    let tmp = tempdir().expect("temporary directory");
    write_workdir(tmp.path());
    let exe = env!("CARGO_BIN_EXE_episens");

    let output = Command::new(exe)
        .args([
            "analyse",
            tmp.path().to_str().expect("path str"),
            "--seed",
            "7",
            "--n-jobs",
            "2",
            "--trees",
            "10",
            "--attribution",
            "exact",
        ])
        .output()
        .expect("run episens analyse");
    assert!(output.status.success(), "analyse exited with status {:?}", output.status);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("attack_rate: most influential parameter is"));
    assert!(stdout.contains("peak_day: most influential parameter is"));

    for file in [
        "relative_importance.csv",
        "analysis_config.toml",
        "attack_rate.model",
        "peak_day.model",
        "attack_rate.attributions.csv",
        "peak_day.summary.csv",
    ] {
        assert!(tmp.path().join(file).exists(), "{file} missing");
    }

    let config = fs::read_to_string(tmp.path().join("analysis_config.toml")).expect("config");
    assert!(config.contains("seed = 7"));
    assert!(config.contains("attribution = \"exact\""));

    let out_dir = tmp.path().join("predicted");
    let status = Command::new(exe)
        .args([
            "predict",
            tmp.path().join("peak_day.model").to_str().expect("path str"),
            tmp.path()
                .join("input_parameter_samples.csv")
                .to_str()
                .expect("path str"),
            "--explain",
            "--out-dir",
            out_dir.to_str().expect("path str"),
        ])
        .status()
        .expect("run episens predict");
    assert!(status.success(), "predict exited with status {status:?}");

    let predictions = fs::read_to_string(out_dir.join("predictions.csv")).expect("predictions");
    assert!(predictions.starts_with("id,predicted\n"));
    assert_eq!(predictions.lines().count(), 13);
    let attributions = fs::read_to_string(out_dir.join("attributions.csv")).expect("attributions");
    assert!(attributions.starts_with("id,baseline,contacts,isolation_delay\n"));
}

#[test]
fn missing_work_dir_fails_with_status_one() {
    let tmp = tempdir().expect("temporary directory");
    let output = Command::new(env!("CARGO_BIN_EXE_episens"))
        .args(["analyse", tmp.path().join("absent").to_str().expect("path str")])
        .output()
        .expect("run episens analyse");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}

#[test]
fn seeds_beyond_the_toml_range_are_refused() {
    let tmp = tempdir().expect("temporary directory");
    write_workdir(tmp.path());
    let too_large = (i64::MAX as u64 + 1).to_string();
    let output = Command::new(env!("CARGO_BIN_EXE_episens"))
        .args([
            "analyse",
            tmp.path().to_str().expect("path str"),
            "--seed",
            too_large.as_str(),
        ])
        .output()
        .expect("run episens analyse");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--seed"));
    assert!(!tmp.path().join("analysis_config.toml").exists());
}
