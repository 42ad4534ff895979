use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=RELAY_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-changed=build.rs");

    if let Some(path) = git_head_path() {
        println!("cargo:rerun-if-changed={}", path);
    }

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_label = git_describe().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("RELAY_BUILD_ID_OVERRIDE")
        .ok()
        .unwrap_or_else(|| format!("{} | {}", build_time, git_label));

    println!("cargo:rustc-env=RELAY_GIT_SHA={}", git_label);
    println!("cargo:rustc-env=RELAY_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=RELAY_BUILD_ID={}", build_id);
}

/// Workspace `.git` sits two levels above this crate.
fn git_head_path() -> Option<String> {
    let head_path = Path::new("../../.git/HEAD");
    if !head_path.exists() {
        return None;
    }
    if let Ok(head_ref) = fs::read_to_string(head_path) {
        if let Some(reference) = head_ref.strip_prefix("ref: ") {
            let ref_path = format!("../../.git/{}", reference.trim());
            if Path::new(&ref_path).exists() {
                return Some(ref_path);
            }
        }
    }
    Some(head_path.display().to_string())
}

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}
