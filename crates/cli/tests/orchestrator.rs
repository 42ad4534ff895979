use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

use relay_cli::{
    Choice, CleanupGuard, LaunchConfig, LaunchError, LaunchOrchestrator, LaunchOutcome,
    LaunchRequest, LaunchStage, ScriptedSelector, ShutdownSignal,
};
use relay_common::process_utils::process_exists;
use relay_common::RelayPaths;
use relay_supervisor::SupervisorState;

fn catalog(key_var: &str) -> Value {
    json!({
        "groq": {
            "id": "groq",
            "name": "Groq",
            "npm": "@ai-sdk/openai-compatible",
            "api": "https://api.groq.com/openai/v1",
            "env": [key_var],
            "models": {
                "llama-3.3-70b-versatile": {
                    "id": "llama-3.3-70b-versatile",
                    "name": "Llama 3.3 70B",
                    "tool_call": true,
                    "reasoning": false,
                    "cost": { "input": 0.59, "output": 0.79 }
                },
                "qwen/qwen3-32b": {
                    "id": "qwen/qwen3-32b",
                    "name": "Qwen3 32B",
                    "tool_call": true,
                    "reasoning": true,
                    "cost": { "input": 0.29, "output": 0.59 }
                }
            }
        },
        "anthropic": {
            "id": "anthropic",
            "name": "Anthropic",
            "npm": "@ai-sdk/anthropic",
            "env": [key_var],
            "models": {
                "claude-sonnet-4": {
                    "id": "claude-sonnet-4",
                    "name": "Claude Sonnet 4",
                    "tool_call": true,
                    "reasoning": true,
                    "cost": { "input": 3, "output": 15 }
                }
            }
        }
    })
}

struct Fixture {
    _temp: TempDir,
    _server: MockServer,
    paths: RelayPaths,
    config: LaunchConfig,
}

fn fixture(key_var: &str) -> Fixture {
    let temp = tempdir().expect("tempdir");
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api.json");
        then.status(200).json_body(catalog(key_var));
    });

    let paths = RelayPaths::under(temp.path());
    let mut config = LaunchConfig::default();
    config.catalog.url = server.url("/api.json");
    config.assistant.program = "sh".to_string();
    config.proxy.fragment = Some(format!("relay-test-proxy-{}", std::process::id()));

    Fixture {
        _temp: temp,
        _server: server,
        paths,
        config,
    }
}

fn orchestrator(
    fixture: &Fixture,
    selector: ScriptedSelector,
) -> LaunchOrchestrator<ScriptedSelector> {
    guarded_orchestrator(fixture, selector, Arc::new(CleanupGuard::new()))
}

fn guarded_orchestrator(
    fixture: &Fixture,
    selector: ScriptedSelector,
    cleanup: Arc<CleanupGuard>,
) -> LaunchOrchestrator<ScriptedSelector> {
    LaunchOrchestrator::new(fixture.config.clone(), fixture.paths.clone(), selector, cleanup)
}

/// Proxy ports away from the default 8082 range.
fn isolated_ports(fixture: &mut Fixture, start: u16) {
    fixture.config.proxy.preferred_port = start;
    fixture.config.proxy.port_range_start = start;
    fixture.config.proxy.port_range_end = start + 99;
}

#[tokio::test]
async fn dry_run_stops_before_spawning_anything() {
    let fixture = fixture("RELAY_TEST_DRY_RUN_UNSET_KEY");
    let selector = ScriptedSelector::new()
        .provider(Choice::Picked("groq".into()))
        .model(Choice::Picked("llama-3.3-70b-versatile".into()));
    let mut launch = orchestrator(&fixture, selector);

    let outcome = launch
        .run(LaunchRequest {
            dry_run: true,
            ..Default::default()
        })
        .await
        .expect("dry run succeeds");

    assert_eq!(
        launch.history(),
        [
            LaunchStage::Init,
            LaunchStage::Sweep,
            LaunchStage::CatalogLoaded,
            LaunchStage::Selecting,
            LaunchStage::ProxyStarting,
        ]
    );
    let LaunchOutcome::DryRun(plan) = outcome else {
        panic!("expected a dry-run plan");
    };
    let summary = plan.summary();
    assert!(summary.contains("Groq (groq)"), "{summary}");
    assert!(summary.contains("https://api.groq.com/openai\n"), "{summary}");
    assert!(summary.contains("llama-3.3-70b-versatile"), "{summary}");
    assert!(summary.contains("$RELAY_TEST_DRY_RUN_UNSET_KEY (not set)"), "{summary}");

    let proxy = plan.proxy.as_ref().expect("proxy planned");
    assert_eq!(proxy.env["BIG_MODEL"], "llama-3.3-70b-versatile");
    assert_eq!(proxy.env["OPENAI_BASE_URL"], "https://api.groq.com/openai");
    assert_eq!(plan.assistant.env["ANTHROPIC_BASE_URL"], proxy.endpoint());

    assert!(!fixture.paths.registry.exists());
    let selector = launch.selector().expect("selector returned");
    assert_eq!((selector.provider_prompts, selector.model_prompts), (1, 1));
}

#[tokio::test]
async fn native_provider_dry_run_ends_at_selection() {
    let fixture = fixture("RELAY_TEST_NATIVE_UNSET_KEY");
    let mut launch = orchestrator(&fixture, ScriptedSelector::new());

    let outcome = launch
        .run(LaunchRequest {
            provider: Some("Anthropic".into()),
            model: Some("claude-sonnet-4".into()),
            dry_run: true,
            ..Default::default()
        })
        .await
        .expect("dry run succeeds");

    assert_eq!(launch.stage(), LaunchStage::Selecting);
    let LaunchOutcome::DryRun(plan) = outcome else {
        panic!("expected a dry-run plan");
    };
    assert!(plan.proxy.is_none());
    assert_eq!(plan.assistant.env["ANTHROPIC_BASE_URL"], "https://api.anthropic.com");
    assert_eq!(plan.assistant.args, ["--model", "claude-sonnet-4"]);
}

#[tokio::test]
async fn preferred_model_skips_the_model_prompt() {
    let mut fixture = fixture("RELAY_TEST_PREFERRED_UNSET_KEY");
    fixture.config.selection.provider = Some("groq".into());
    fixture.config.selection.preferred_models = vec!["claude-3".into(), "qwen3".into()];
    let mut launch = orchestrator(&fixture, ScriptedSelector::new());

    let outcome = launch
        .run(LaunchRequest {
            dry_run: true,
            ..Default::default()
        })
        .await
        .expect("dry run succeeds");

    let LaunchOutcome::DryRun(plan) = outcome else {
        panic!("expected a dry-run plan");
    };
    assert_eq!(plan.model_id, "qwen/qwen3-32b");
    let selector = launch.selector().expect("selector returned");
    assert_eq!((selector.provider_prompts, selector.model_prompts), (0, 0));
}

#[tokio::test]
async fn cancelled_selection_aborts() {
    let fixture = fixture("RELAY_TEST_CANCEL_UNSET_KEY");
    let mut launch = orchestrator(&fixture, ScriptedSelector::new().provider(Choice::Cancelled));

    let err = launch
        .run(LaunchRequest {
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, LaunchError::UserCancelled));
    assert_eq!(err.exit_code().as_i32(), 6);
    assert_eq!(launch.history().last(), Some(&LaunchStage::Aborted));
}

#[tokio::test]
async fn unknown_provider_or_model_is_configuration_error() {
    let fixture = fixture("RELAY_TEST_UNKNOWN_UNSET_KEY");

    let mut launch = orchestrator(&fixture, ScriptedSelector::new());
    let err = launch
        .run(LaunchRequest {
            provider: Some("does-not-exist".into()),
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::Configuration(_)), "{err}");
    assert_eq!(launch.stage(), LaunchStage::Failed);

    let mut launch = orchestrator(&fixture, ScriptedSelector::new());
    let err = launch
        .run(LaunchRequest {
            provider: Some("groq".into()),
            model: Some("gpt-9".into()),
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("gpt-9"), "{err}");
    assert_eq!(err.exit_code().as_i32(), 3);
}

#[tokio::test]
async fn missing_api_key_fails_outside_dry_run() {
    let fixture = fixture("RELAY_TEST_REAL_RUN_UNSET_KEY");
    let mut launch = orchestrator(&fixture, ScriptedSelector::new());

    let err = launch
        .run(LaunchRequest {
            provider: Some("anthropic".into()),
            model: Some("claude-sonnet-4".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, LaunchError::Configuration(_)), "{err}");
    assert!(err.to_string().contains("RELAY_TEST_REAL_RUN_UNSET_KEY"));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn native_provider_hands_off_and_passes_exit_code_through() {
    let key_var = format!("RELAY_TEST_HANDOFF_KEY_{}", std::process::id());
    std::env::set_var(&key_var, "sk-test-handoff");

    let mut fixture = fixture(&key_var);
    fixture.config.assistant.model_flag = String::new();
    fixture.config.assistant.args = vec!["-c".into()];
    let script = concat!(
        r#"test "$ANTHROPIC_BASE_URL" = https://api.anthropic.com "#,
        r#"&& test "$ANTHROPIC_API_KEY" = sk-test-handoff "#,
        r#"&& exit 7; exit 1"#
    );
    let mut launch = orchestrator(&fixture, ScriptedSelector::new());

    let outcome = launch
        .run(LaunchRequest {
            provider: Some("anthropic".into()),
            model: Some("claude-sonnet-4".into()),
            assistant_args: vec![script.to_string()],
            ..Default::default()
        })
        .await
        .expect("assistant ran");

    std::env::remove_var(&key_var);
    assert!(matches!(outcome, LaunchOutcome::Exited { code: 7 }), "{outcome:?}");
    assert_eq!(launch.stage(), LaunchStage::Launched);
    assert!(!launch.history().contains(&LaunchStage::ProxyStarting));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn proxied_provider_runs_behind_a_ready_proxy_and_cleans_up() {
    if which::which("python3").is_err() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let key_var = format!("RELAY_TEST_PROXY_KEY_{}", std::process::id());
    std::env::set_var(&key_var, "gsk-test-proxied");

    let mut fixture = fixture(&key_var);
    isolated_ports(&mut fixture, 28100);
    fixture.config.proxy.program = "python3".into();
    fixture.config.proxy.args = ["-m", "http.server", "{port}", "--bind", "{host}"]
        .map(String::from)
        .to_vec();
    fixture.config.proxy.startup_timeout_secs = 10;
    fixture.config.proxy.stop_timeout_secs = 5;
    fixture.config.assistant.model_flag = String::new();
    fixture.config.assistant.args = vec!["-c".into()];
    // the assistant must reach the proxy through ANTHROPIC_BASE_URL
    let script = concat!(
        r#"python3 -c 'import os, urllib.request; urllib.request.urlopen(os.environ["ANTHROPIC_BASE_URL"] + "/", timeout=5)' "#,
        r#"&& test "$ANTHROPIC_API_KEY" = gsk-test-proxied "#,
        r#"&& exit 42; exit 1"#
    );

    let cleanup = Arc::new(CleanupGuard::new());
    let mut launch = guarded_orchestrator(&fixture, ScriptedSelector::new(), Arc::clone(&cleanup));
    let outcome = launch
        .run(LaunchRequest {
            provider: Some("groq".into()),
            model: Some("llama-3.3-70b-versatile".into()),
            assistant_args: vec![script.to_string()],
            ..Default::default()
        })
        .await;
    std::env::remove_var(&key_var);

    let supervisor = launch.supervisor();
    let proxy_pid = supervisor.lock().await.pid().expect("proxy spawned");
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            cleanup.run().await;
            panic!("launch failed: {err}");
        }
    };

    assert!(matches!(outcome, LaunchOutcome::Exited { code: 42 }), "{outcome:?}");
    assert_eq!(
        launch.history(),
        [
            LaunchStage::Init,
            LaunchStage::Sweep,
            LaunchStage::CatalogLoaded,
            LaunchStage::Selecting,
            LaunchStage::ProxyStarting,
            LaunchStage::Launched,
        ]
    );
    assert!(process_exists(proxy_pid));
    assert!(fixture.paths.registry.exists());

    cleanup.run().await;

    assert_eq!(supervisor.lock().await.state(), SupervisorState::Stopped);
    assert!(!process_exists(proxy_pid));
    assert!(!fixture.paths.registry.exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn signal_during_proxy_startup_aborts_and_stops_the_proxy() {
    let key_var = format!("RELAY_TEST_STARTUP_CANCEL_KEY_{}", std::process::id());
    std::env::set_var(&key_var, "gsk-test-cancel");

    let mut fixture = fixture(&key_var);
    isolated_ports(&mut fixture, 28200);
    // never listens, so readiness is never reached
    fixture.config.proxy.program = "sh".into();
    fixture.config.proxy.args = vec!["-c".into(), "sleep 30; :".into()];
    fixture.config.proxy.startup_timeout_secs = 30;
    fixture.config.proxy.stop_timeout_secs = 2;

    let cleanup = Arc::new(CleanupGuard::new());
    let mut launch = guarded_orchestrator(&fixture, ScriptedSelector::new(), Arc::clone(&cleanup));

    let signaller = Arc::clone(&cleanup);
    let proxy_log = fixture.paths.proxy_log.clone();
    let signalled = tokio::spawn(async move {
        // the log is opened right before the proxy is spawned
        for _ in 0..100 {
            if proxy_log.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        signaller.on_signal(ShutdownSignal::Terminate);
    });

    let started = std::time::Instant::now();
    let err = launch
        .run(LaunchRequest {
            provider: Some("groq".into()),
            model: Some("llama-3.3-70b-versatile".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    std::env::remove_var(&key_var);
    signalled.await.unwrap();

    assert!(matches!(err, LaunchError::UserCancelled), "{err}");
    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(launch.history().last(), Some(&LaunchStage::Aborted));
    assert!(launch.history().contains(&LaunchStage::ProxyStarting));
    assert!(!launch.history().contains(&LaunchStage::Launched));

    let supervisor = launch.supervisor();
    let proxy_pid = {
        let supervisor = supervisor.lock().await;
        assert_eq!(supervisor.state(), SupervisorState::Starting);
        supervisor.pid().expect("proxy spawned")
    };
    assert!(process_exists(proxy_pid));

    cleanup.run().await;

    assert_eq!(supervisor.lock().await.state(), SupervisorState::Stopped);
    assert!(!process_exists(proxy_pid));
    assert!(!fixture.paths.registry.exists());
}
