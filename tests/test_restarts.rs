mod common;

use std::{collections::BTreeSet, time::Duration};

use app_supervisor::{ExitReason, Phase, SupervisorBuilder, LAUNCH_FAILURE_EXIT_CODE};
use common::{quiet_spec, Plan, ScriptedLauncher};
use tokio::time::pause;

#[tokio::test]
async fn test_restart_counter_is_bounded_by_max_restarts() {
    pause();

    let mut spec = quiet_spec("crasher");
    spec.max_restarts = 3;
    let launcher = ScriptedLauncher::always(Plan::crash_after(10));

    let handle = SupervisorBuilder::new(spec)
        .with_launcher(launcher.clone())
        .build()
        .run();

    assert_eq!(handle.wait().await.unwrap(), ExitReason::MaxRestartsExceeded);
    assert_eq!(launcher.launch_count(), 4);

    let status = handle.status();
    assert_eq!(status.restart_counter, 3);
    assert_eq!(status.phase, Phase::Exited(ExitReason::MaxRestartsExceeded));
    assert_eq!(status.pid, None);
    assert_eq!(status.last_exit.and_then(|exit| exit.code), Some(1));
}

#[tokio::test]
async fn test_zero_max_restarts_never_restarts() {
    pause();

    let mut spec = quiet_spec("once");
    spec.max_restarts = 0;
    let launcher = ScriptedLauncher::always(Plan::crash_after(10));

    let handle = SupervisorBuilder::new(spec)
        .with_launcher(launcher.clone())
        .build()
        .run();

    assert_eq!(handle.wait().await.unwrap(), ExitReason::MaxRestartsExceeded);
    assert_eq!(launcher.launch_count(), 1);
    assert_eq!(handle.status().restart_counter, 0);
}

#[tokio::test]
async fn test_stop_exit_code_is_a_clean_exit() {
    pause();

    let mut spec = quiet_spec("job");
    spec.stop_exit_codes = BTreeSet::from([0]);
    let launcher = ScriptedLauncher::always(Plan::Exit {
        after: Duration::from_millis(50),
        code: 0,
    });

    let handle = SupervisorBuilder::new(spec)
        .with_launcher(launcher.clone())
        .build()
        .run();

    let reason = handle.wait().await.unwrap();
    assert_eq!(reason, ExitReason::CleanExit);
    assert_eq!(reason.exit_code(), 0);
    assert_eq!(launcher.launch_count(), 1);
    assert_eq!(handle.status().restart_counter, 0);
}

#[tokio::test]
async fn test_zero_exit_without_stop_codes_is_restarted() {
    pause();

    let mut spec = quiet_spec("job");
    spec.max_restarts = 1;
    let launcher = ScriptedLauncher::always(Plan::Exit {
        after: Duration::from_millis(50),
        code: 0,
    });

    let handle = SupervisorBuilder::new(spec)
        .with_launcher(launcher.clone())
        .build()
        .run();

    assert_eq!(handle.wait().await.unwrap(), ExitReason::MaxRestartsExceeded);
    assert_eq!(launcher.launch_count(), 2);
}

#[tokio::test]
async fn test_autorestart_disabled_stops_after_first_exit() {
    pause();

    let mut spec = quiet_spec("oneshot");
    spec.autorestart = false;
    spec.stop_exit_codes = BTreeSet::from([0]);
    let launcher = ScriptedLauncher::always(Plan::crash_after(10));

    let handle = SupervisorBuilder::new(spec)
        .with_launcher(launcher.clone())
        .build()
        .run();

    let reason = handle.wait().await.unwrap();
    assert_eq!(reason, ExitReason::AutorestartDisabled);
    assert_eq!(reason.exit_code(), 1);
    assert_eq!(launcher.launch_count(), 1);
}

#[tokio::test]
async fn test_restart_delay_is_honored() {
    pause();

    let mut spec = quiet_spec("slow");
    spec.max_restarts = 2;
    spec.restart_delay = Duration::from_millis(3000);
    let launcher = ScriptedLauncher::always(Plan::crash_after(10));

    let handle = SupervisorBuilder::new(spec)
        .with_launcher(launcher.clone())
        .build()
        .run();

    assert_eq!(handle.wait().await.unwrap(), ExitReason::MaxRestartsExceeded);

    let launches = launcher.launches();
    assert_eq!(launches.len(), 3);
    for pair in launches.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(3000));
    }
}

#[tokio::test]
async fn test_stable_run_resets_restart_counter() {
    pause();

    let mut spec = quiet_spec("flaky");
    spec.max_restarts = 2;
    spec.min_uptime = Duration::from_secs(1);
    let stable = Plan::Exit {
        after: Duration::from_secs(5),
        code: 1,
    };
    let launcher = ScriptedLauncher::new(
        [Plan::crash_after(10), Plan::crash_after(10), stable],
        Plan::crash_after(10),
    );

    let handle = SupervisorBuilder::new(spec)
        .with_launcher(launcher.clone())
        .build()
        .run();

    assert_eq!(handle.wait().await.unwrap(), ExitReason::MaxRestartsExceeded);
    // Without the reset the third exit would already have exhausted the budget.
    assert_eq!(launcher.launch_count(), 5);
    assert_eq!(handle.status().restart_counter, 2);
}

#[tokio::test]
async fn test_launch_failure_consumes_restart_budget() {
    pause();

    let mut spec = quiet_spec("missing");
    spec.max_restarts = 2;
    spec.stop_exit_codes = BTreeSet::from([LAUNCH_FAILURE_EXIT_CODE]);
    let launcher = ScriptedLauncher::always(Plan::FailLaunch);

    let handle = SupervisorBuilder::new(spec)
        .with_launcher(launcher.clone())
        .build()
        .run();

    assert_eq!(handle.wait().await.unwrap(), ExitReason::MaxRestartsExceeded);
    assert_eq!(launcher.launch_count(), 3);

    let last_exit = handle.status().last_exit.unwrap();
    assert!(last_exit.launch_failed);
    assert_eq!(last_exit.code, Some(LAUNCH_FAILURE_EXIT_CODE));
}

#[tokio::test]
async fn test_recovers_after_failed_launch() {
    pause();

    let mut spec = quiet_spec("late");
    spec.stop_exit_codes = BTreeSet::from([0]);
    let launcher = ScriptedLauncher::new(
        [Plan::FailLaunch],
        Plan::Exit {
            after: Duration::from_millis(10),
            code: 0,
        },
    );

    let handle = SupervisorBuilder::new(spec)
        .with_launcher(launcher.clone())
        .build()
        .run();

    assert_eq!(handle.wait().await.unwrap(), ExitReason::CleanExit);
    assert_eq!(launcher.launch_count(), 2);
    assert_eq!(handle.status().restart_counter, 1);
}

#[tokio::test]
async fn test_status_reports_running_child() {
    pause();

    let launcher = ScriptedLauncher::always(Plan::run_forever());
    let handle = SupervisorBuilder::new(quiet_spec("server"))
        .with_launcher(launcher)
        .build()
        .run();

    let status = handle
        .wait_until(|status| status.phase == Phase::Running)
        .await
        .unwrap();
    assert_eq!(status.name, "server");
    assert_eq!(status.pid, Some(1001));
    assert_eq!(status.restart_counter, 0);
    assert!(status.started_at.is_some());
    assert!(status.last_exit.is_none());

    handle.shutdown().unwrap();
    assert_eq!(handle.wait().await.unwrap(), ExitReason::Shutdown);
}

#[tokio::test]
async fn test_wait_is_repeatable_across_clones() {
    pause();

    let mut spec = quiet_spec("job");
    spec.max_restarts = 1;
    let handle = SupervisorBuilder::new(spec)
        .with_launcher(ScriptedLauncher::always(Plan::crash_after(10)))
        .build()
        .run();
    let other = handle.clone();

    let (first, second) = tokio::join!(handle.wait(), other.wait());
    assert_eq!(first.unwrap(), ExitReason::MaxRestartsExceeded);
    assert_eq!(second.unwrap(), ExitReason::MaxRestartsExceeded);
    assert_eq!(handle.wait().await.unwrap(), ExitReason::MaxRestartsExceeded);
}
