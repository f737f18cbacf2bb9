//! Start, stop, restart and external death.

use std::time::Duration;

use tunnel_supervisor::process::probe;
use tunnel_supervisor::config::ConfigLoader;
use tunnel_supervisor::{ProcessState, ProcessSupervisor};

use crate::support::{self, eventually, FakeDaemons};

#[tokio::test]
async fn start_reports_running() {
    let fakes = FakeDaemons::new();
    let binary = fakes.ready("ngrok", "127.0.0.1:4040", 0, 0);
    let mut supervisor = ProcessSupervisor::new(support::config(&binary));

    assert!(!supervisor.is_running());
    supervisor.start().await.unwrap();

    assert!(supervisor.is_running());
    assert_eq!(supervisor.state(), ProcessState::Running);
    assert_eq!(supervisor.api_url(), Some("http://127.0.0.1:4040"));
    assert!(supervisor.pid().is_some());
    assert!(supervisor.log_monitor().is_monitoring());

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn supervisor_from_settings_file() {
    let fakes = FakeDaemons::new();
    fakes.ready("ngrok", "127.0.0.1:4040", 0, 0);
    let settings = fakes.path().join("settings.toml");
    std::fs::write(&settings, "binary_path = \"ngrok\"\nstartup_timeout_secs = 10\n").unwrap();

    let mut supervisor = ProcessSupervisor::from_loader(&ConfigLoader::with_path(&settings)).unwrap();
    assert_eq!(supervisor.config().binary_path(), fakes.path().join("ngrok"));

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn start_twice_is_noop() {
    let fakes = FakeDaemons::new();
    let binary = fakes.ready("ngrok", "127.0.0.1:4040", 0, 0);
    let mut supervisor = ProcessSupervisor::new(support::config(&binary));

    supervisor.start().await.unwrap();
    let pid = supervisor.pid();
    supervisor.start().await.unwrap();

    assert_eq!(supervisor.pid(), pid);
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn stop_terminates_child_and_monitor() {
    let fakes = FakeDaemons::new();
    let binary = fakes.ready("ngrok", "127.0.0.1:4040", 0, 0);
    let mut supervisor = ProcessSupervisor::new(support::config(&binary));
    supervisor.start().await.unwrap();
    let pid = supervisor.pid().unwrap();

    supervisor.stop().await.unwrap();

    assert!(!supervisor.is_running());
    assert_eq!(supervisor.state(), ProcessState::Stopped);
    assert!(supervisor.pid().is_none());
    assert!(!supervisor.log_monitor().is_monitoring());
    assert!(!probe::is_pid_alive(pid));
    // The API address stays readable after stop.
    assert_eq!(supervisor.api_url(), Some("http://127.0.0.1:4040"));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let fakes = FakeDaemons::new();
    let binary = fakes.ready("ngrok", "127.0.0.1:4040", 0, 0);
    let mut supervisor = ProcessSupervisor::new(support::config(&binary));

    supervisor.stop().await.unwrap();
    supervisor.start().await.unwrap();
    supervisor.stop().await.unwrap();
    supervisor.stop().await.unwrap();

    assert!(!supervisor.is_running());
}

#[test]
fn stop_before_any_start_is_noop() {
    let fakes = FakeDaemons::new();
    let binary = fakes.ready("ngrok", "127.0.0.1:4040", 0, 0);
    let mut supervisor = ProcessSupervisor::new(support::config(&binary));

    tokio_test::block_on(supervisor.stop()).unwrap();
    assert_eq!(supervisor.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn restart_cycles_spawn_fresh_children() {
    let fakes = FakeDaemons::new();
    let binary = fakes.ready("ngrok", "127.0.0.1:4040", 0, 0);
    let mut supervisor = ProcessSupervisor::new(support::config(&binary));

    let mut pids = Vec::new();
    for _ in 0..3 {
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        pids.push(supervisor.pid().unwrap());
        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());
    }

    pids.dedup();
    assert_eq!(pids.len(), 3);
}

#[tokio::test]
async fn stop_escalates_when_sigterm_is_ignored() {
    let fakes = FakeDaemons::new();
    let binary = fakes.script(
        "stubborn",
        &format!(
            r#"trap '' TERM
echo "{} lvl=info msg=\"starting web service\" obj=web addr=127.0.0.1:4040"
while true; do sleep 1; done"#,
            support::TS
        ),
    );
    let mut supervisor = ProcessSupervisor::new(support::config(&binary))
        .with_terminate_timeout(Duration::from_millis(200));
    supervisor.start().await.unwrap();
    let pid = supervisor.pid().unwrap();

    supervisor.stop().await.unwrap();

    assert!(!supervisor.is_running());
    assert!(!probe::is_pid_alive(pid));
}

#[tokio::test]
async fn dropped_start_does_not_wedge_supervisor() {
    let fakes = FakeDaemons::new();
    let binary = fakes.script(
        "slow",
        &format!(
            r#"sleep 1
echo "{} lvl=info msg=\"starting web service\" obj=web addr=127.0.0.1:4040"
exec sleep 60"#,
            support::TS
        ),
    );
    let mut supervisor = ProcessSupervisor::new(support::config(&binary));

    let first = tokio::time::timeout(Duration::from_millis(200), supervisor.start()).await;
    assert!(first.is_err());
    assert_eq!(supervisor.state(), ProcessState::Starting);
    let abandoned = supervisor.pid().unwrap();

    supervisor.start().await.unwrap();

    assert!(supervisor.is_running());
    assert_ne!(supervisor.pid(), Some(abandoned));
    assert!(!probe::is_pid_alive(abandoned));
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn dropped_stop_does_not_wedge_supervisor() {
    let fakes = FakeDaemons::new();
    let binary = fakes.script(
        "stubborn",
        &format!(
            r#"trap '' TERM
echo "{} lvl=info msg=\"starting web service\" obj=web addr=127.0.0.1:4040"
while true; do sleep 1; done"#,
            support::TS
        ),
    );
    let mut supervisor = ProcessSupervisor::new(support::config(&binary))
        .with_terminate_timeout(Duration::from_secs(2));
    supervisor.start().await.unwrap();
    let pid = supervisor.pid().unwrap();

    let first = tokio::time::timeout(Duration::from_millis(200), supervisor.stop()).await;
    assert!(first.is_err());
    assert_eq!(supervisor.state(), ProcessState::Stopping);

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), ProcessState::Stopped);
    assert!(eventually(Duration::from_secs(5), || !probe::is_pid_alive(pid)).await);

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn external_kill_is_detected_and_restart_works() {
    let fakes = FakeDaemons::new();
    let binary = fakes.ready("ngrok", "127.0.0.1:4040", 0, 0);
    let mut supervisor = ProcessSupervisor::new(support::config(&binary));
    supervisor.start().await.unwrap();
    let pid = supervisor.pid().unwrap();

    probe::kill_pid(pid).unwrap();

    assert!(eventually(Duration::from_secs(10), || !supervisor.is_running()).await);
    assert_eq!(supervisor.state(), ProcessState::Stopped);

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());
    assert_ne!(supervisor.pid(), Some(pid));
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn external_kill_without_monitoring_is_detected() {
    let fakes = FakeDaemons::new();
    let binary = fakes.ready("ngrok", "127.0.0.1:4040", 0, 0);
    let config = support::config(&binary).to_builder().without_monitoring().build().unwrap();
    let mut supervisor = ProcessSupervisor::new(config);
    supervisor.start().await.unwrap();

    probe::kill_pid(supervisor.pid().unwrap()).unwrap();

    assert!(eventually(Duration::from_secs(10), || !supervisor.is_running()).await);
    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn supervisors_are_independent() {
    let fakes = FakeDaemons::new();
    let first = fakes.ready("ngrok-a", "localhost:4040", 0, 0);
    let second = fakes.ready("ngrok-b", "localhost:4041", 0, 0);
    let mut a = ProcessSupervisor::new(support::config(&first));
    let mut b = ProcessSupervisor::new(support::config(&second));

    a.start().await.unwrap();
    b.start().await.unwrap();

    assert!(a.is_running());
    assert!(b.is_running());
    assert_eq!(a.api_url(), Some("http://localhost:4040"));
    assert_eq!(b.api_url(), Some("http://localhost:4041"));

    a.stop().await.unwrap();
    assert!(!a.is_running());
    assert!(b.is_running());
    b.stop().await.unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn probe_finds_supervised_daemon() {
    let fakes = FakeDaemons::new();
    let binary = fakes.ready("ngrok", "127.0.0.1:4040", 0, 0);
    let mut supervisor = ProcessSupervisor::new(support::config(&binary));
    supervisor.start().await.unwrap();
    let pid = supervisor.pid().unwrap();

    // The fake execs into sleep shortly after announcing readiness.
    let found = eventually(Duration::from_secs(5), || {
        std::fs::read_link(format!("/proc/{pid}/exe"))
            .is_ok_and(|exe| probe::find_pids_by_executable(&exe).contains(&pid))
    })
    .await;
    assert!(found);

    supervisor.stop().await.unwrap();
}
