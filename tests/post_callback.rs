// tests/post_callback.rs

use std::error::Error;
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;

use acm_test_utils::fixtures::{fast_config, gmos_sender, succeed_after};
use acm_test_utils::recording_listener::Recorder;
use acm_test_utils::{init_tracing, with_timeout};
use epics_acm::channel::ApplyResponse;
use epics_acm::{CommandFailure, CommandMonitor, CommandState, ListenerDispatcher};

type TestResult = Result<(), Box<dyn Error>>;

fn exploding_listener(_monitor: &CommandMonitor) {
    panic!("listener exploded");
}

#[tokio::test]
async fn listener_runs_once_on_the_dispatch_thread() -> TestResult {
    init_tracing();
    let fx = gmos_sender(succeed_after(50), fast_config()).await;
    let mut recorder = Recorder::new();

    let monitor = fx.sender.post_callback(recorder.listener()).await?;
    assert_eq!(monitor.state(), CommandState::Pending);

    let invocation = with_timeout(recorder.next()).await;
    assert_eq!(invocation.execution, monitor.id());
    assert_eq!(invocation.state, CommandState::Success);
    assert_ne!(invocation.thread, thread::current().id());
    assert_eq!(invocation.thread_name.as_deref(), Some("acm-dispatch"));

    // Nothing else arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.invocations().len(), 1);
    Ok(())
}

#[tokio::test]
async fn closure_listener_sees_the_failure() -> TestResult {
    init_tracing();
    let fx = gmos_sender(
        ApplyResponse::Fail {
            after: Duration::from_millis(30),
            message: "detector not ready".to_string(),
        },
        fast_config(),
    )
    .await;

    let (tx, rx) = oneshot::channel();
    fx.sender
        .post_callback(move |monitor: &CommandMonitor| {
            let _ = tx.send((monitor.state(), monitor.error()));
        })
        .await?;

    let (state, error) = with_timeout(rx).await?;
    assert_eq!(state, CommandState::Failure);
    assert_eq!(
        error,
        Some(CommandFailure::Remote {
            message: "detector not ready".to_string()
        })
    );
    Ok(())
}

#[tokio::test]
async fn listener_is_called_on_timeout() -> TestResult {
    init_tracing();
    let mut config = fast_config();
    config.command_timeout = Duration::from_millis(100);
    let fx = gmos_sender(ApplyResponse::Silent, config).await;
    let mut recorder = Recorder::new();

    fx.sender.post_callback(recorder.listener()).await?;

    let invocation = with_timeout(recorder.next()).await;
    assert_eq!(invocation.state, CommandState::Failure);
    Ok(())
}

#[tokio::test]
async fn panicking_listener_does_not_stop_later_deliveries() -> TestResult {
    init_tracing();
    let fx = gmos_sender(succeed_after(20), fast_config()).await;
    let mut recorder = Recorder::new();

    let first = fx.sender.post_callback(exploding_listener).await?;
    with_timeout(first.wait()).await?;

    let second = fx.sender.post_callback(recorder.listener()).await?;
    let invocation = with_timeout(recorder.next()).await;

    assert_eq!(invocation.execution, second.id());
    assert_eq!(invocation.state, CommandState::Success);
    Ok(())
}

#[tokio::test]
async fn listener_registered_after_completion_still_runs() -> TestResult {
    init_tracing();
    let fx = gmos_sender(succeed_after(20), fast_config()).await;
    let mut recorder = Recorder::new();

    let monitor = with_timeout(fx.sender.post_wait()).await?;
    assert!(monitor.is_done());

    let dispatcher = ListenerDispatcher::spawn("late-listeners")?;
    dispatcher.register(monitor.clone(), Box::new(recorder.listener()));

    let invocation = with_timeout(recorder.next()).await;
    assert_eq!(invocation.execution, monitor.id());
    assert_eq!(invocation.thread_name.as_deref(), Some("late-listeners"));
    Ok(())
}

#[tokio::test]
async fn waiters_and_listener_observe_the_same_outcome() -> TestResult {
    init_tracing();
    let fx = gmos_sender(succeed_after(50), fast_config()).await;
    let mut recorder = Recorder::new();

    let monitor = fx.sender.post_callback(recorder.listener()).await?;
    let waiter = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.wait().await })
    };

    let waited = with_timeout(waiter).await??;
    let invocation = with_timeout(recorder.next()).await;

    assert_eq!(waited, CommandState::Success);
    assert_eq!(invocation.state, waited);
    assert_eq!(monitor.state(), waited);
    Ok(())
}
