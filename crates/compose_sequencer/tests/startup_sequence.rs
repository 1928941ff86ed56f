//! End-to-end startup scenarios against a scripted container runtime

mod common;

use common::{handle, MockRuntime, ServiceScript};
use compose_sequencer::config::{
    ExitCodeRule, Interpolator, Outcome, PatternRule, StateConditions, StreamTarget, TimeoutRule,
    NEVER_EXIT,
};
use compose_sequencer::{
    ComposeProject, DependencyError, Executor, ExecutorError, ReadinessGate, SequencerConfig,
    ServiceStatus,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const POLL: Duration = Duration::from_millis(10);

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn project(yaml: &str) -> ComposeProject {
    ComposeProject::from_yaml(yaml, &Interpolator::default()).unwrap()
}

fn executor(yaml: &str, runtime: &Arc<MockRuntime>) -> Executor {
    Executor::new(project(yaml), runtime.clone(), SequencerConfig::default())
}

fn exit_rule(codes: &[i64]) -> StateConditions {
    StateConditions {
        exit: Some(ExitCodeRule::new(codes.to_vec()).unwrap()),
        ..Default::default()
    }
}

fn stdout_rules(rules: &[(&str, &str)]) -> StateConditions {
    let rules = rules
        .iter()
        .map(|(regex, status)| PatternRule::new(regex, status).unwrap())
        .collect();
    StateConditions {
        patterns: [(StreamTarget::Stdout, rules)].into_iter().collect(),
        ..Default::default()
    }
}

async fn resolve(
    conditions: &StateConditions,
    service: &str,
    runtime: &Arc<MockRuntime>,
) -> compose_sequencer::Verdict {
    let gate = ReadinessGate::new(conditions, &handle(service), runtime.clone(), POLL);
    let (_tx, rx) = watch::channel(());
    gate.resolve(rx).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_failed_timeout_aborts_before_dependents() {
    let runtime = Arc::new(MockRuntime::new());
    let mut executor = executor(
        r#"
services:
  c:
    depends_on: [b]
  b:
    depends_on: [a]
    state_conditions:
      timeout:
        duration: 2
        status: failure
  a: {}
"#,
        &runtime,
    );

    assert_eq!(executor.start_order().unwrap(), vec!["a", "b", "c"]);

    let (_tx, rx) = watch::channel(());
    let started = Instant::now();
    let err = executor.launch(rx).await.unwrap_err();

    assert!(started.elapsed() >= secs(2));
    match &err {
        ExecutorError::NotReady { service, verdict } => {
            assert_eq!(service, "b");
            assert_eq!(verdict.outcome, Outcome::failure());
        }
        other => panic!("expected readiness failure, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 1);
    assert_eq!(runtime.started(), vec!["a", "b"]);

    let status = executor.status();
    assert_eq!(status[0], ("a", &ServiceStatus::Started));
    assert!(matches!(status[1].1, ServiceStatus::Failed(_)));
    assert_eq!(status[2], ("c", &ServiceStatus::Pending));
}

#[tokio::test(start_paused = true)]
async fn test_full_startup_waits_for_each_service() {
    let runtime = Arc::new(
        MockRuntime::new()
            .service(
                "db",
                ServiceScript::running()
                    .stderr(secs(1), "initializing")
                    .stderr(secs(3), "database system is ready to accept connections"),
            )
            .service("migrate", ServiceScript::exits(0, secs(5))),
    );
    let mut executor = executor(
        r#"
services:
  api:
    depends_on: [migrate]
  migrate:
    depends_on:
      db:
        condition: service_started
    state_conditions:
      exit: [0]
      timeout:
        duration: 60
        status: failure
  db:
    state_conditions:
      filemonitor:
        - file: STDERR
          regex: "ready to accept connections"
          status: success
"#,
        &runtime,
    );

    let (_tx, rx) = watch::channel(());
    let started = Instant::now();
    executor.launch(rx).await.unwrap();

    assert!(started.elapsed() >= secs(9));
    assert_eq!(runtime.started(), vec!["db", "migrate", "api"]);
    assert_eq!(runtime.active_streams(), 0);

    let status = executor.status();
    assert!(matches!(status[0].1, ServiceStatus::Ready(_)));
    match status[1].1 {
        ServiceStatus::Ready(verdict) => assert!(verdict.message.contains("code 0")),
        other => panic!("expected migrate to be ready, got {:?}", other),
    }
    assert_eq!(status[2], ("api", &ServiceStatus::Started));
}

#[tokio::test(start_paused = true)]
async fn test_gate_returns_one_verdict_and_stops_all_monitors() {
    let runtime = Arc::new(
        MockRuntime::new().service(
            "api",
            ServiceScript::exits(0, secs(1))
                .stdout(secs(1), "READY")
                .stderr(secs(1), "READY"),
        ),
    );

    let mut conditions = stdout_rules(&[("READY", "success")]);
    conditions.exit = Some(ExitCodeRule::new(vec![0]).unwrap());
    conditions.timeout = Some(TimeoutRule {
        duration: secs(1),
        status: Outcome::Success,
    });
    conditions.patterns.insert(
        StreamTarget::Stderr,
        vec![PatternRule::new("READY", "success").unwrap()],
    );

    let gate = ReadinessGate::new(&conditions, &handle("api"), runtime.clone(), POLL);
    assert_eq!(gate.monitor_count(), 4);

    let (_tx, rx) = watch::channel(());
    let verdict = gate.resolve(rx).await.unwrap();

    assert!(verdict.is_success());
    assert_eq!(runtime.active_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_losing_monitors_are_cancelled() {
    // Logs never match and the container never exits; the timeout wins
    let runtime = Arc::new(
        MockRuntime::new().service("api", ServiceScript::running().stdout(secs(1), "booting")),
    );

    let mut conditions = stdout_rules(&[("READY", "success")]);
    conditions.exit = Some(ExitCodeRule::new(vec![0]).unwrap());
    conditions.timeout = Some(TimeoutRule {
        duration: secs(5),
        status: Outcome::parse("timed_out"),
    });

    let verdict = resolve(&conditions, "api", &runtime).await;
    assert_eq!(verdict.outcome, Outcome::parse("timed_out"));
    assert_eq!(runtime.active_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pattern_monitor_first_match_wins() {
    let runtime = Arc::new(
        MockRuntime::new().service(
            "api",
            ServiceScript::running()
                .stdout(secs(1), "booting")
                .stdout(secs(1), "READY at port 8080")
                .stdout(secs(1), "ERROR afterwards"),
        ),
    );

    let conditions = stdout_rules(&[("ERROR", "failure"), ("READY", "success")]);
    let verdict = resolve(&conditions, "api", &runtime).await;

    assert!(verdict.is_success());
    assert!(verdict.message.contains("READY at port 8080"));
    assert!(verdict.message.contains("READY"));
}

#[tokio::test(start_paused = true)]
async fn test_exit_code_classification() {
    let cases: [(&[i64], i64, bool); 4] = [
        (&[0], 0, true),
        (&[NEVER_EXIT], 0, false),
        (&[0, 2], 3, false),
        (&[0, 2], 2, true),
    ];

    for (codes, exit_code, success) in cases {
        let runtime = Arc::new(
            MockRuntime::new().service("job", ServiceScript::exits(exit_code, secs(1))),
        );
        let verdict = resolve(&exit_rule(codes), "job", &runtime).await;

        assert_eq!(verdict.is_success(), success, "codes {:?}, exit {}", codes, exit_code);
        assert!(verdict.message.contains(&exit_code.to_string()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_exit_code_ignores_other_containers() {
    let runtime = Arc::new(MockRuntime::new().service(
        "job",
        ServiceScript::exits(0, secs(5)).foreign_die(secs(1)),
    ));

    let started = Instant::now();
    let verdict = resolve(&exit_rule(&[0]), "job", &runtime).await;

    assert!(verdict.is_success());
    assert_eq!(started.elapsed().as_secs(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_service_ready_after_timeout() {
    // `exit: [-1]` with a success timeout: still running after 5s means ready
    let runtime = Arc::new(MockRuntime::new().service("worker", ServiceScript::running()));
    let mut conditions = exit_rule(&[NEVER_EXIT]);
    conditions.timeout = Some(TimeoutRule {
        duration: secs(5),
        status: Outcome::Success,
    });

    let verdict = resolve(&conditions, "worker", &runtime).await;
    assert!(verdict.is_success());
    assert!(verdict.message.contains("after 5 seconds"));
}

#[tokio::test(start_paused = true)]
async fn test_default_timeout_bounds_unmatched_pattern() {
    let runtime = Arc::new(
        MockRuntime::new().service("api", ServiceScript::running().stdout(secs(1), "booting")),
    );
    let config = SequencerConfig {
        default_timeout: Some(secs(30)),
        ..Default::default()
    };
    let mut executor = Executor::new(
        project(
            r#"
services:
  api:
    state_conditions:
      filemonitor:
        - file: STDOUT
          regex: "READY"
          status: success
"#,
        ),
        runtime.clone(),
        config,
    );

    let (_tx, rx) = watch::channel(());
    let started = Instant::now();
    let err = executor.launch(rx).await.unwrap_err();

    assert!(started.elapsed() >= secs(30));
    assert!(matches!(err, ExecutorError::NotReady { ref service, .. } if service == "api"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_indefinite_wait() {
    let runtime = Arc::new(
        MockRuntime::new().service("api", ServiceScript::running().closing_logs()),
    );
    let mut executor = executor(
        r#"
services:
  web:
    depends_on: [api]
  api:
    state_conditions:
      filemonitor:
        - file: STDOUT
          regex: "READY"
          status: success
"#,
        &runtime,
    );

    let (tx, rx) = watch::channel(());
    let launch = tokio::spawn(async move {
        let result = executor.launch(rx).await;
        (result, executor)
    });

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(!launch.is_finished());
    tx.send(()).unwrap();

    let (result, executor) = launch.await.unwrap();
    let err = result.unwrap_err();
    assert!(matches!(err, ExecutorError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(executor.status()[1], ("web", &ServiceStatus::Pending));
    assert_eq!(runtime.started(), vec!["api"]);
}

#[tokio::test]
async fn test_start_failure_aborts_run() {
    let runtime = Arc::new(MockRuntime::new().service("db", ServiceScript::failing_start()));
    let mut executor = executor(
        "services:\n  api:\n    depends_on: [db]\n  db: {}\n",
        &runtime,
    );

    let (_tx, rx) = watch::channel(());
    let err = executor.launch(rx).await.unwrap_err();

    assert!(matches!(err, ExecutorError::Start { ref service, .. } if service == "db"));
    assert_eq!(err.exit_code(), 3);
    assert!(runtime.started().is_empty());
}

#[tokio::test]
async fn test_monitor_error_is_fatal() {
    let runtime = Arc::new(
        MockRuntime::new().service("api", ServiceScript::running().failing_logs()),
    );
    let mut executor = executor(
        r#"
services:
  api:
    state_conditions:
      timeout:
        duration: 600
        status: success
      filemonitor:
        - file: STDOUT
          regex: "READY"
          status: success
"#,
        &runtime,
    );

    let (_tx, rx) = watch::channel(());
    let err = executor.launch(rx).await.unwrap_err();

    assert!(matches!(err, ExecutorError::Monitor { ref service, .. } if service == "api"));
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn test_unknown_dependency_starts_nothing() {
    let runtime = Arc::new(MockRuntime::new());
    let mut executor = executor("services:\n  api:\n    depends_on: [db]\n", &runtime);

    let (_tx, rx) = watch::channel(());
    let err = executor.launch(rx).await.unwrap_err();

    assert!(matches!(
        err,
        ExecutorError::Dependency(DependencyError::UnknownDependency { .. })
    ));
    assert_eq!(err.exit_code(), 2);
    assert!(runtime.started().is_empty());
}

#[tokio::test]
async fn test_file_monitor_follows_appended_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("boot.log");

    let runtime = Arc::new(MockRuntime::new().service("api", ServiceScript::running()));
    let conditions = StateConditions {
        patterns: [(
            StreamTarget::File(path.clone()),
            vec![
                PatternRule::new("FATAL", "failure").unwrap(),
                PatternRule::new("started in \\d+ms", "success").unwrap(),
            ],
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    };

    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "loading configuration").unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        writeln!(file, "server started in 42ms").unwrap();
    });

    let verdict = tokio::time::timeout(Duration::from_secs(5), resolve(&conditions, "api", &runtime))
        .await
        .unwrap();
    writer.await.unwrap();

    assert!(verdict.is_success());
    assert!(verdict.message.contains("server started in 42ms"));
}
