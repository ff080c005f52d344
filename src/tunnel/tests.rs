//! Unit tests for the tunnel monitor loop.

use std::net::TcpListener;

use super::session::allocate_port;
use super::*;
use crate::remote::{RemoteTarget, SpawnMode};
use crate::test_support::{FakeBridge, ScriptedRunner};
use rstest::{fixture, rstest};

const WAIT: Duration = Duration::from_secs(5);

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

#[fixture]
fn bridge() -> FakeBridge {
    FakeBridge::new()
}

fn fast_timings() -> MonitorTimings {
    MonitorTimings {
        warmup: Duration::from_millis(10),
        reboot_grace: Duration::from_millis(10),
        prestep_retry_delay: Duration::from_millis(1),
        prestep_attempts: 2,
        close_wait: Duration::from_millis(200),
    }
}

fn tunnel_target(
    runner: &ScriptedRunner,
    bridge: &FakeBridge,
    instance_type: InstanceType,
) -> TunnelTarget<ScriptedRunner, FakeBridge> {
    TunnelTarget {
        host: RemoteHost::new(
            runner.clone(),
            "ssh",
            "scp",
            RemoteTarget::new("/tmp/id_rsa", "vsoc-01", "10.0.0.2"),
            Duration::from_secs(5),
        ),
        bridge: bridge.clone(),
        device: DeviceHandle::new(),
        attributes: BuildAttributes::new(),
        instance_type,
        remote_port: 6520,
    }
}

async fn stop(monitor: &mut TunnelMonitor) {
    monitor.shutdown();
    assert!(monitor.join(WAIT).await, "monitor should stop on request");
    assert_eq!(monitor.status().state, MonitorState::Shutdown);
}

#[rstest]
#[tokio::test]
async fn bridges_tunnel_and_publishes_address(runner: ScriptedRunner, bridge: FakeBridge) {
    let target = tunnel_target(&runner, &bridge, InstanceType::Cuttlefish);
    let device = target.device.clone();
    let attributes = target.attributes.clone();
    let mut monitor = TunnelMonitor::start(target, fast_timings());

    monitor
        .wait_bridged(0, WAIT)
        .await
        .expect("tunnel should bridge");

    let address = device.current_address().expect("address published");
    assert!(address.starts_with("127.0.0.1:"));
    assert_eq!(attributes.get(BRIDGE_ADDRESS), Some(address.clone()));
    assert_eq!(bridge.calls(), vec![format!("connect {address}")]);
    assert!(monitor.is_tunnel_alive());

    let spawned = runner.spawned();
    assert_eq!(spawned.len(), 1);
    let (invocation, mode) = &spawned[0];
    assert_eq!(*mode, SpawnMode::Supervised);
    let port = address.rsplit(':').next().expect("port suffix");
    assert!(
        invocation
            .command_string()
            .contains(&format!("-N -L {port}:127.0.0.1:6520 vsoc-01@10.0.0.2"))
    );

    stop(&mut monitor).await;
    assert_eq!(runner.kill_count(), 1);
    assert_eq!(runner.live_children(), 0);
    assert_eq!(bridge.count("disconnect "), 1);
}

#[rstest]
#[tokio::test]
async fn reopens_once_per_tunnel_exit_until_shutdown(runner: ScriptedRunner, bridge: FakeBridge) {
    runner.set_child_lifetime(Some(Duration::from_millis(60)));
    let mut timings = fast_timings();
    timings.warmup = Duration::from_millis(5);
    let mut monitor = TunnelMonitor::start(
        tunnel_target(&runner, &bridge, InstanceType::Cuttlefish),
        timings,
    );

    let mut status = monitor.subscribe();
    timeout(WAIT, status.wait_for(|current| current.generation >= 3))
        .await
        .expect("tunnel should be reopened repeatedly")
        .expect("monitor alive");
    stop(&mut monitor).await;

    let tunnels = runner.spawn_count();
    assert_eq!(
        u64::try_from(tunnels).expect("small count"),
        monitor.status().generation
    );
    assert_eq!(bridge.count("disconnect "), tunnels);
    assert!(runner.kill_count() <= tunnels);
    assert_eq!(runner.live_children(), 0);

    sleep(Duration::from_millis(150)).await;
    assert_eq!(runner.spawn_count(), tunnels, "no tunnel after shutdown");
}

#[rstest]
#[tokio::test]
async fn reconnect_request_replaces_the_tunnel(runner: ScriptedRunner, bridge: FakeBridge) {
    let mut monitor = TunnelMonitor::start(
        tunnel_target(&runner, &bridge, InstanceType::Emulator),
        fast_timings(),
    );
    monitor.wait_bridged(0, WAIT).await.expect("first tunnel");

    let replaced = monitor.request_reconnect();
    monitor
        .wait_bridged(replaced, WAIT)
        .await
        .expect("second tunnel");

    assert_eq!(monitor.status().generation, 2);
    assert_eq!(runner.spawn_count(), 2);
    assert_eq!(runner.kill_count(), 1);
    assert_eq!(runner.live_children(), 1);
    assert_eq!(bridge.count("connect "), 2);
    assert_eq!(bridge.count("disconnect "), 1);

    stop(&mut monitor).await;
    assert_eq!(runner.kill_count(), 2);
}

#[rstest]
#[tokio::test]
async fn flagged_reboot_waits_out_grace(runner: ScriptedRunner, bridge: FakeBridge) {
    let mut monitor = TunnelMonitor::start(
        tunnel_target(&runner, &bridge, InstanceType::Cuttlefish),
        fast_timings(),
    );
    monitor.wait_bridged(0, WAIT).await.expect("first tunnel");

    monitor.flag_reboot();
    let replaced = monitor.request_reconnect();
    monitor
        .wait_bridged(replaced, WAIT)
        .await
        .expect("tunnel after reboot");
    stop(&mut monitor).await;

    assert!(
        monitor
            .captured_log()
            .iter()
            .any(|line| line.contains("reboot grace"))
    );
}

#[rstest]
#[tokio::test]
async fn exited_tunnel_is_not_alive_during_reboot_grace(
    runner: ScriptedRunner,
    bridge: FakeBridge,
) {
    runner.set_child_lifetime(Some(Duration::from_millis(80)));
    let mut timings = fast_timings();
    timings.reboot_grace = Duration::from_millis(600);
    let mut monitor = TunnelMonitor::start(
        tunnel_target(&runner, &bridge, InstanceType::Cuttlefish),
        timings,
    );
    monitor.wait_bridged(0, WAIT).await.expect("first tunnel");
    monitor.flag_reboot();

    let mut status = monitor.subscribe();
    timeout(WAIT, status.wait_for(|current| current.state == MonitorState::Init))
        .await
        .expect("tunnel exit should be published")
        .expect("monitor alive");
    assert!(!monitor.is_tunnel_alive());
    assert_eq!(monitor.status().generation, 1);
    let err = monitor
        .wait_bridged(0, Duration::from_millis(50))
        .await
        .expect_err("a closed tunnel must not count as bridged");
    assert!(matches!(err, TunnelError::Timeout { .. }));

    monitor
        .wait_bridged(1, WAIT)
        .await
        .expect("tunnel after grace");
    stop(&mut monitor).await;
    assert!(
        monitor
            .captured_log()
            .iter()
            .any(|line| line.contains("reboot grace"))
    );
}

#[rstest]
#[tokio::test]
async fn cloud_prestep_restarts_bridge_daemon(runner: ScriptedRunner, bridge: FakeBridge) {
    runner.succeed_by_default();
    let mut monitor = TunnelMonitor::start(
        tunnel_target(&runner, &bridge, InstanceType::Gce),
        fast_timings(),
    );
    monitor.wait_bridged(0, WAIT).await.expect("tunnel");
    stop(&mut monitor).await;

    let commands: Vec<String> = runner
        .invocations_of("ssh")
        .iter()
        .map(crate::test_support::CommandInvocation::command_string)
        .collect();
    assert_eq!(commands.len(), 2);
    assert!(commands[0].ends_with("vsoc-01@10.0.0.2 stop adbd"));
    assert!(commands[1].ends_with("vsoc-01@10.0.0.2 start adbd"));
}

#[rstest]
#[tokio::test]
async fn exhausted_prestep_fails_without_tunnel(runner: ScriptedRunner, bridge: FakeBridge) {
    runner.push_for("ssh", Some(255), "", "connection refused");
    runner.push_for("ssh", Some(255), "", "connection refused");
    let mut monitor = TunnelMonitor::start(
        tunnel_target(&runner, &bridge, InstanceType::RemoteAvd),
        fast_timings(),
    );

    let err = monitor
        .wait_bridged(0, WAIT)
        .await
        .expect_err("prestep should exhaust");
    assert!(matches!(
        err,
        TunnelError::Stopped {
            state: MonitorState::Failed,
            ..
        }
    ));
    assert!(monitor.join(WAIT).await);
    assert_eq!(runner.spawn_count(), 0);
    let reason = monitor.last_error().expect("error recorded");
    assert!(reason.contains("stop adbd"), "unexpected reason: {reason}");
    assert!(reason.contains("connection refused"));
}

#[rstest]
#[tokio::test]
async fn tunnel_dead_after_warmup_fails(runner: ScriptedRunner, bridge: FakeBridge) {
    runner.set_child_lifetime(Some(Duration::from_millis(1)));
    let mut timings = fast_timings();
    timings.warmup = Duration::from_millis(30);
    let mut monitor = TunnelMonitor::start(
        tunnel_target(&runner, &bridge, InstanceType::Cuttlefish),
        timings,
    );

    let err = monitor
        .wait_bridged(0, WAIT)
        .await
        .expect_err("tunnel never comes alive");
    assert!(err.to_string().contains("warm-up"));
    assert!(monitor.join(WAIT).await);
    assert_eq!(monitor.status().state, MonitorState::Failed);
    assert_eq!(runner.spawn_count(), 1);
    assert_eq!(bridge.count("connect "), 0);
}

#[rstest]
#[tokio::test]
async fn bridged_wait_times_out(runner: ScriptedRunner, bridge: FakeBridge) {
    let mut timings = fast_timings();
    timings.warmup = Duration::from_secs(30);
    let mut monitor = TunnelMonitor::start(
        tunnel_target(&runner, &bridge, InstanceType::Cuttlefish),
        timings,
    );

    let err = monitor
        .wait_bridged(0, Duration::from_millis(20))
        .await
        .expect_err("warm-up outlasts the wait");
    assert!(matches!(err, TunnelError::Timeout { .. }));

    stop(&mut monitor).await;
    assert_eq!(runner.live_children(), 0);
}

#[rstest]
fn previous_port_is_reused_when_free() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);

    assert_eq!(allocate_port(Some(port)).expect("port"), port);
}

#[rstest]
fn busy_previous_port_switches_to_ephemeral() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();

    let chosen = allocate_port(Some(port)).expect("port");
    assert_ne!(chosen, port);
    drop(listener);
}

#[rstest]
#[case(MonitorState::Shutdown, true)]
#[case(MonitorState::Failed, true)]
#[case(MonitorState::Bridged, false)]
#[case(MonitorState::Prestep, false)]
fn terminal_states(#[case] state: MonitorState, #[case] terminal: bool) {
    assert_eq!(state.is_terminal(), terminal);
}
