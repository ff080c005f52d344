//! Unit tests for the debug-bridge client.

use super::*;
use crate::test_support::ScriptedRunner;
use rstest::{fixture, rstest};

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn bridge(runner: &ScriptedRunner) -> AdbBridge<ScriptedRunner> {
    AdbBridge::new(runner.clone(), "adb", Duration::from_secs(5))
        .with_boot_poll_interval(Duration::from_millis(5))
}

#[rstest]
#[case("device\n", DeviceState::Online)]
#[case("offline", DeviceState::Offline)]
#[case("recovery", DeviceState::Recovery)]
#[case("unauthorized", DeviceState::Unauthorized)]
#[case("bootloader", DeviceState::NotAvailable)]
#[case("", DeviceState::NotAvailable)]
fn maps_adb_states(#[case] raw: &str, #[case] expected: DeviceState) {
    assert_eq!(DeviceState::from_adb_state(raw), expected);
}

#[rstest]
#[tokio::test]
async fn connect_accepts_connected_output(runner: ScriptedRunner) {
    runner.push_output(Some(0), "connected to 127.0.0.1:40000\n", "");
    bridge(&runner)
        .connect("127.0.0.1:40000")
        .await
        .expect("connect should succeed");

    let calls = runner.invocations();
    assert_eq!(calls[0].command_string(), "adb connect 127.0.0.1:40000");
}

#[rstest]
#[case("already connected to 127.0.0.1:40000")]
#[tokio::test]
async fn connect_accepts_existing_connection(runner: ScriptedRunner, #[case] stdout: &str) {
    runner.push_output(Some(0), stdout, "");
    assert!(bridge(&runner).connect("127.0.0.1:40000").await.is_ok());
}

#[rstest]
#[case("failed to connect to 127.0.0.1:40000: Connection refused")]
#[case("cannot connect to 127.0.0.1:40000")]
#[tokio::test]
async fn connect_rejects_refusal_despite_zero_exit(runner: ScriptedRunner, #[case] stdout: &str) {
    runner.push_output(Some(0), stdout, "");
    let err = bridge(&runner)
        .connect("127.0.0.1:40000")
        .await
        .expect_err("refusal should fail");
    assert!(matches!(err, BridgeError::Connect { .. }));
}

#[rstest]
#[tokio::test]
async fn state_reports_not_available_on_error(runner: ScriptedRunner) {
    runner.push_output(Some(1), "", "error: device '127.0.0.1:40000' not found");
    let state = bridge(&runner)
        .state("127.0.0.1:40000")
        .await
        .expect("state query should not error");
    assert_eq!(state, DeviceState::NotAvailable);
    assert_eq!(
        runner.invocations()[0].command_string(),
        "adb -s 127.0.0.1:40000 get-state"
    );
}

#[rstest]
#[tokio::test]
async fn wait_for_available_polls_boot_property(runner: ScriptedRunner) {
    runner.push_output(Some(0), "\n", "");
    runner.push_output(Some(0), "1\n", "");
    bridge(&runner)
        .wait_for_available("127.0.0.1:40000", Duration::from_secs(5))
        .await
        .expect("device should become available");
    assert_eq!(runner.invocations().len(), 2);
}

#[rstest]
#[tokio::test]
async fn wait_for_available_times_out(runner: ScriptedRunner) {
    runner.succeed_by_default();
    let err = bridge(&runner)
        .wait_for_available("127.0.0.1:40000", Duration::from_millis(20))
        .await
        .expect_err("device never finishes booting");
    assert!(matches!(err, BridgeError::Timeout { .. }));
}

#[rstest]
#[case::booted("1\n", true)]
#[case::booting("0\n", false)]
#[tokio::test]
async fn wait_for_available_probes_once_without_budget(
    runner: ScriptedRunner,
    #[case] stdout: &str,
    #[case] available: bool,
) {
    runner.push_output(Some(0), stdout, "");
    let result = bridge(&runner)
        .wait_for_available("127.0.0.1:40000", Duration::ZERO)
        .await;

    assert_eq!(result.is_ok(), available, "{result:?}");
    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
#[case(RebootMode::Full, "adb -s emu reboot")]
#[case(RebootMode::Userspace, "adb -s emu reboot userspace")]
#[tokio::test]
async fn reboot_builds_mode_arguments(
    runner: ScriptedRunner,
    #[case] mode: RebootMode,
    #[case] expected: &str,
) {
    runner.push_success();
    bridge(&runner)
        .reboot("emu", mode)
        .await
        .expect("reboot should succeed");
    assert_eq!(runner.invocations()[0].command_string(), expected);
}

#[rstest]
#[tokio::test]
async fn dump_logcat_surfaces_command_failure(runner: ScriptedRunner) {
    runner.push_output(Some(1), "", "error: closed");
    let err = bridge(&runner)
        .dump_logcat("emu")
        .await
        .expect_err("logcat failure should surface");
    let BridgeError::Command { command, message, .. } = err else {
        panic!("expected command failure, got {err:?}");
    };
    assert_eq!(command, "logcat");
    assert!(message.contains("error: closed"));
}

#[rstest]
fn device_handle_clones_share_address() {
    let handle = DeviceHandle::new();
    let observer = handle.clone();
    assert_eq!(observer.current_address(), None);
    handle.set_address(Some(String::from("127.0.0.1:40000")));
    assert_eq!(observer.current_address().as_deref(), Some("127.0.0.1:40000"));
}
