#![cfg(target_os = "linux")]

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use relay_common::process_registry::{ProcessRegistry, TrackedProcess};
use relay_common::process_utils::process_exists;
use relay_supervisor::sweep_orphans;
use tempfile::TempDir;

const STOP: Duration = Duration::from_secs(2);
const NESTED_TAG: &str = "RELAY_SWEEP_NESTED_TAG";
const NESTED_DIR: &str = "RELAY_SWEEP_NESTED_DIR";

fn registry_in(temp: &TempDir) -> ProcessRegistry {
    ProcessRegistry::new(temp.path().join("run/proxy.json"))
}

/// `sh` whose command line carries `tag` as `$0`; `; :` keeps the shell from exec'ing sleep.
fn tagged_process(tag: &str) -> Child {
    Command::new("sh")
        .args(["-c", "sleep 30; :", tag])
        .process_group(0)
        .spawn()
        .unwrap()
}

fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

fn unique(name: &str) -> String {
    format!("relay-{}-{}", name, std::process::id())
}

#[tokio::test]
async fn sweeping_twice_with_nothing_started_is_clean() {
    let temp = TempDir::new().unwrap();
    let registry = registry_in(&temp);
    let signature = unique("nothing-started");

    for _ in 0..2 {
        let report = sweep_orphans(&registry, &signature, STOP).await;
        assert!(report.is_clean(), "{report:?}");
        assert!(report.terminated.is_empty());
    }
    assert!(!registry.path().exists());
}

#[tokio::test]
async fn orphan_of_dead_launcher_is_terminated() {
    let temp = TempDir::new().unwrap();
    let registry = registry_in(&temp);
    let tag = unique("orphan");
    let mut orphan = tagged_process(&tag);
    std::thread::sleep(Duration::from_millis(100));

    let mut record = TrackedProcess::new(orphan.id(), tag.clone(), 8082);
    record.owner_pid = Some(dead_pid());
    registry.write(&record).unwrap();

    let report = sweep_orphans(&registry, &tag, STOP).await;

    assert_eq!(report.terminated, vec![orphan.id()]);
    assert!(!process_exists(orphan.id()));
    assert!(!registry.path().exists());
    orphan.wait().unwrap();
}

#[tokio::test]
async fn proxy_with_running_launcher_is_left_alone() {
    let temp = TempDir::new().unwrap();
    let registry = registry_in(&temp);
    let tag = unique("owned");
    let mut owned = tagged_process(&tag);
    std::thread::sleep(Duration::from_millis(100));

    let record = TrackedProcess::new(owned.id(), tag.clone(), 8082);
    registry.write(&record).unwrap();

    let report = sweep_orphans(&registry, &tag, STOP).await;

    assert_eq!(report.protected, Some(owned.id()));
    assert!(report.terminated.is_empty());
    assert!(process_exists(owned.id()));
    assert_eq!(registry.read(), Some(record));

    owned.kill().unwrap();
    owned.wait().unwrap();
}

#[tokio::test]
async fn reused_pid_is_purged_without_signalling() {
    let temp = TempDir::new().unwrap();
    let registry = registry_in(&temp);
    let mut unrelated = Command::new("sleep").arg("30").spawn().unwrap();

    let mut record = TrackedProcess::new(unrelated.id(), unique("not-this-proxy"), 8082);
    record.owner_pid = Some(dead_pid());
    registry.write(&record).unwrap();

    let report = sweep_orphans(&registry, &unique("not-this-proxy"), STOP).await;

    assert_eq!(report.stale_cleared, Some(unrelated.id()));
    assert!(report.terminated.is_empty());
    assert!(!registry.path().exists());
    assert!(process_exists(unrelated.id()));

    unrelated.kill().unwrap();
    unrelated.wait().unwrap();
}

#[tokio::test]
async fn untracked_process_matching_signature_is_terminated() {
    let temp = TempDir::new().unwrap();
    let registry = registry_in(&temp);
    let tag = unique("stray");
    let mut stray = tagged_process(&tag);
    std::thread::sleep(Duration::from_millis(100));

    let report = sweep_orphans(&registry, &tag, STOP).await;

    assert!(report.terminated.contains(&stray.id()), "{report:?}");
    assert!(!process_exists(stray.id()));
    stray.wait().unwrap();
}

#[tokio::test]
async fn busy_lock_skips_process_table_scan() {
    let temp = TempDir::new().unwrap();
    let registry = registry_in(&temp);
    let tag = unique("while-starting");
    let mut stray = tagged_process(&tag);
    std::thread::sleep(Duration::from_millis(100));

    let held = registry.try_lock().unwrap().expect("lock free");
    let report = sweep_orphans(&registry, &tag, STOP).await;
    drop(held);

    assert!(report.table_scan_skipped);
    assert!(process_exists(stray.id()));

    stray.kill().unwrap();
    stray.wait().unwrap();
}

/// Runs only when re-executed by `wrapper_carrying_signature_survives_sweep`.
#[tokio::test]
async fn nested_sweep_entrypoint() {
    let (Ok(tag), Ok(dir)) = (std::env::var(NESTED_TAG), std::env::var(NESTED_DIR)) else {
        return;
    };
    let dir = PathBuf::from(dir);
    let registry = ProcessRegistry::new(dir.join("run/proxy.json"));
    let report = sweep_orphans(&registry, &tag, STOP).await;
    std::fs::write(dir.join("terminated"), format!("{:?}", report.terminated)).unwrap();
}

#[tokio::test]
async fn wrapper_carrying_signature_survives_sweep() {
    let temp = TempDir::new().unwrap();
    let tag = unique("wrapper");
    let marker = temp.path().join("wrapper-finished");
    // tagged sh -> untagged sh -> this test binary running the sweep
    let script = concat!(
        r#"sh -c '"$RELAY_SWEEP_EXE" --exact nested_sweep_entrypoint --quiet >/dev/null 2>&1; :'; "#,
        r#"echo done > "$RELAY_SWEEP_MARKER""#
    );

    let status = tokio::process::Command::new("sh")
        .args(["-c", script, tag.as_str()])
        .env("RELAY_SWEEP_EXE", std::env::current_exe().unwrap())
        .env("RELAY_SWEEP_MARKER", &marker)
        .env(NESTED_TAG, &tag)
        .env(NESTED_DIR, temp.path())
        .status()
        .await
        .unwrap();

    assert!(status.success(), "wrapper was killed: {status:?}");
    assert!(marker.exists());
    let terminated = std::fs::read_to_string(temp.path().join("terminated")).unwrap();
    assert_eq!(terminated, "[]");
}
