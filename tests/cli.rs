use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const NOTE: &str = "---\nbookTitle: Dune\nbookAuthors: [Frank Herbert]\ntags: [sf]\nsummary: A desert planet, a prophecy and a fight over spice.\ncontributor: Ada\n---\nBody text.\n";
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

fn press_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_press"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("site")).unwrap();

    let config_content = format!(
        r#"[site]
url = "https://summaries.example"

[upload]
temp_dir = "{root}/uploads"

[validation]
check_image_reachability = false
blocked_image_domains = ["tracker.example"]

[storage]
targets = ["local"]

[storage.local]
root = "{root}/site"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("press.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_press(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = press_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("NETLIFY_BUILD_HOOK")
        .env_remove("NETLIFY_SITE_ID")
        .env_remove("NETLIFY_API_TOKEN")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run press binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_help_lists_commands() {
    let (stdout, _, success) = run_press(Path::new("missing.toml"), &["--help"]);
    assert!(success);
    for cmd in ["serve", "validate", "submit", "build", "completions"] {
        assert!(stdout.contains(cmd), "help is missing {}: {}", cmd, stdout);
    }
}

#[test]
fn test_completions_without_config() {
    let (stdout, _, success) = run_press(Path::new("missing.toml"), &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("press"));
}

#[test]
fn test_validate_good_note() {
    let (tmp, config) = setup_test_env();
    let note = tmp.path().join("dune.md");
    let cover = tmp.path().join("dune.png");
    fs::write(&note, NOTE).unwrap();
    fs::write(&cover, PNG).unwrap();

    let (stdout, stderr, success) = run_press(
        &config,
        &["validate", note.to_str().unwrap(), "--cover", cover.to_str().unwrap()],
    );
    assert!(success, "stderr: {}", stderr);
    assert!(stdout.contains("dune.md is valid (Dune)"));
}

#[test]
fn test_validate_reports_missing_field() {
    let (tmp, config) = setup_test_env();
    let note = tmp.path().join("dune.md");
    let body = NOTE.replace("tags: [sf]\n", "") + "\n![](https://tracker.example/pixel.gif)\n";
    fs::write(&note, body).unwrap();

    let (_, stderr, success) = run_press(&config, &["validate", note.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("tags:"), "stderr: {}", stderr);
}

#[test]
fn test_validate_images_flags_blocked_domain() {
    let (tmp, config) = setup_test_env();
    let note = tmp.path().join("dune.md");
    let body = format!("{}\n![Pixel](https://tracker.example/pixel.gif)\n", NOTE);
    fs::write(&note, body).unwrap();

    let (_, stderr, success) = run_press(
        &config,
        &["validate", note.to_str().unwrap(), "--check-images"],
    );
    assert!(!success);
    assert!(stderr.contains("tracker.example"), "stderr: {}", stderr);
}

#[test]
fn test_validate_rejects_wrong_extension() {
    let (tmp, config) = setup_test_env();
    let note = tmp.path().join("dune.txt");
    fs::write(&note, NOTE).unwrap();

    let (_, stderr, success) = run_press(&config, &["validate", note.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("fileName"), "stderr: {}", stderr);
}

#[test]
fn test_build_check_without_hook_fails() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_press(&config, &["build", "check"]);
    assert!(!success);
    assert!(stdout.contains("NETLIFY_BUILD_HOOK is not set"), "stdout: {}", stdout);
}

#[test]
fn test_broken_config_is_reported() {
    let (tmp, config) = setup_test_env();
    fs::write(&config, "[storage\ntargets = ").unwrap();
    let note = tmp.path().join("dune.md");
    fs::write(&note, NOTE).unwrap();

    let (_, stderr, success) = run_press(&config, &["validate", note.to_str().unwrap()]);
    assert!(success, "stderr: {}", stderr);
    assert!(stderr.contains("warning: Failed to parse config file"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_falls_back_quietly() {
    let tmp = TempDir::new().unwrap();
    let note = tmp.path().join("dune.md");
    fs::write(&note, NOTE).unwrap();

    let (_, stderr, success) = run_press(
        &tmp.path().join("absent.toml"),
        &["validate", note.to_str().unwrap()],
    );
    assert!(success, "stderr: {}", stderr);
    assert!(!stderr.contains("warning:"), "stderr: {}", stderr);
}
