//! End-to-end scenarios against simulated managers.
//!
//! Every test drives a real `Stack` over the scripted driver: frames are
//! encoded, exchanged, answered by a `SimManager` and decoded again, with
//! time supplied by a manual clock.

use wbms_core::{
    Api, ApiError, CompletionData, Event, ResultCode, Role, SimConfig,
    packet::{CMD_RESET_DEVICE, CMD_SET_MODE},
};
use wbms_integration_tests::fixtures::{PRIMARY, SECONDARY, SimStack};
use wbms_transport::DeviceId;

const HASH: u32 = 0xA5A5_0001;

fn dual(role: Role, session: u8) -> SimConfig {
    SimConfig {
        config_hash: HASH,
        ..SimConfig::dual(role, session)
    }
}

fn connected_single() -> SimStack {
    let mut fixture = SimStack::single(SimConfig::default());
    assert_eq!(fixture.connect().result, ResultCode::Success);
    fixture.run(50);
    fixture.clear_events();
    fixture
}

// ============================================================================
// Connect
// ============================================================================

#[test]
fn test_single_manager_connect() {
    let mut fixture = SimStack::single(SimConfig::default());
    let done = fixture.connect();

    assert_eq!(done.api, Api::Connect);
    assert_eq!(done.result, ResultCode::Success);
    let CompletionData::Connect(info) = done.data else {
        panic!("expected connect data, got {:?}", done.data);
    };
    assert_eq!(info.config_hash, SimConfig::default().config_hash);
    assert_eq!(info.measurement_buffer_len, 16);
    assert_eq!(info.managers.len(), 1);
    assert!(info.managers[0].connected);
    assert_eq!(info.managers[0].role, Role::Primary);

    assert!(fixture.is_connected(PRIMARY));
    assert!(fixture.events().contains(&Event::Connected(PRIMARY)));
    assert!(fixture.manager(PRIMARY, |m| m.is_logged_in()));

    let network = fixture.stack.network(fixture.net).unwrap();
    assert!(network.busy_with().is_none());
    assert!(network.is_maintaining());
    assert_eq!(network.last_connect(), Some(&info));
}

#[test]
fn test_dual_connect_success() {
    let mut fixture = SimStack::dual(dual(Role::Primary, 0x11), dual(Role::Secondary, 0x22));
    let done = fixture.connect();

    assert_eq!(done.result, ResultCode::Success);
    let CompletionData::Connect(info) = done.data else {
        panic!("expected connect data");
    };
    assert_eq!(info.config_hash, HASH);
    assert!(info.managers.iter().all(|m| m.connected));
    assert!(fixture.is_connected(PRIMARY));
    assert!(fixture.is_connected(SECONDARY));

    let events = fixture.events();
    assert!(events.contains(&Event::Connected(PRIMARY)));
    assert!(events.contains(&Event::Connected(SECONDARY)));
}

#[test]
fn test_dual_connect_hash_mismatch() {
    let secondary = SimConfig {
        config_hash: HASH + 1,
        ..dual(Role::Secondary, 0x22)
    };
    let mut fixture = SimStack::dual(dual(Role::Primary, 0x11), secondary);
    let done = fixture.connect();

    assert_eq!(done.result, ResultCode::ConfigurationMismatch);
    let CompletionData::Connect(info) = done.data else {
        panic!("expected connect data");
    };
    assert_eq!(info.config_hash, 0);
}

#[test]
fn test_dual_connect_both_primary() {
    let mut fixture = SimStack::dual(dual(Role::Primary, 0x11), dual(Role::Primary, 0x22));
    assert_eq!(fixture.connect().result, ResultCode::InvalidState);
}

#[test]
fn test_dual_connect_version_mismatch() {
    let secondary = SimConfig {
        protocol_version: 2,
        ..dual(Role::Secondary, 0x22)
    };
    let mut fixture = SimStack::dual(dual(Role::Primary, 0x11), secondary);
    assert_eq!(fixture.connect().result, ResultCode::InvalidState);
}

#[test]
fn test_connect_retries_busy_manager() {
    let mut fixture = SimStack::single(SimConfig {
        busy_rounds: 2,
        ..SimConfig::default()
    });
    let done = fixture.connect();

    assert_eq!(done.result, ResultCode::Success);
    assert_eq!(fixture.manager(PRIMARY, |m| m.connect_requests()), 3);
    let state = fixture.stack.network(fixture.net).unwrap().connect_state();
    assert_eq!(state.retries(), 2);
}

#[test]
fn test_connect_rejected() {
    let mut fixture = SimStack::single(SimConfig {
        connect_rc: ResultCode::Fail,
        ..SimConfig::default()
    });
    assert_eq!(fixture.connect().result, ResultCode::InvalidState);
    assert!(!fixture.is_connected(PRIMARY));
}

#[test]
fn test_connect_timeout_without_answer() {
    let mut fixture = SimStack::single(SimConfig::default());
    fixture.manager(PRIMARY, |m| m.set_mute(true));
    let started = fixture.clock_now();
    let done = fixture.connect();

    assert_eq!(done.result, ResultCode::Timeout);
    // Initial round plus three retries, one second each.
    assert!(fixture.clock_now() - started > 4_000);
    assert_eq!(fixture.manager(PRIMARY, |m| m.connect_requests()), 4);
    assert!(fixture.stack.network(fixture.net).unwrap().busy_with().is_none());
}

#[test]
fn test_connect_rejected_while_running() {
    let mut fixture = SimStack::single(SimConfig::default());
    fixture.stack.connect(fixture.net).unwrap();
    assert_eq!(fixture.stack.connect(fixture.net), Err(ApiError::Busy));
    assert_eq!(fixture.next_completion().result, ResultCode::Success);
}

// ============================================================================
// Disconnect
// ============================================================================

#[test]
fn test_disconnect() {
    let mut fixture = SimStack::dual(dual(Role::Primary, 0x11), dual(Role::Secondary, 0x22));
    assert_eq!(fixture.connect().result, ResultCode::Success);

    fixture.stack.disconnect(fixture.net).unwrap();
    let done = fixture.next_completion();
    assert_eq!(done.api, Api::Disconnect);
    assert_eq!(done.result, ResultCode::Success);

    assert!(!fixture.is_connected(PRIMARY));
    assert!(!fixture.is_connected(SECONDARY));
    let events = fixture.events();
    assert!(events.contains(&Event::Disconnected(PRIMARY)));
    assert!(events.contains(&Event::Disconnected(SECONDARY)));
    assert!(!fixture.manager(PRIMARY, |m| m.is_logged_in()));
    assert!(!fixture.manager(SECONDARY, |m| m.is_logged_in()));
    assert!(!fixture.stack.network(fixture.net).unwrap().is_maintaining());

    assert_eq!(fixture.stack.disconnect(fixture.net), Err(ApiError::NotConnected));
}

#[test]
fn test_disconnect_timeout_still_logs_out() {
    let mut fixture = connected_single();
    fixture.manager(PRIMARY, |m| m.set_mute(true));

    fixture.stack.disconnect(fixture.net).unwrap();
    let done = fixture.next_completion();
    assert_eq!(done.result, ResultCode::Timeout);
    // Initial request plus three retries.
    assert_eq!(fixture.manager(PRIMARY, |m| m.disconnect_requests()), 4);
    assert!(!fixture.is_connected(PRIMARY));
    assert!(fixture.events().contains(&Event::Disconnected(PRIMARY)));
}

// ============================================================================
// Commands
// ============================================================================

#[test]
fn test_command_with_interim_response() {
    let mut fixture = SimStack::single(SimConfig {
        interim_first: true,
        ..SimConfig::default()
    });
    assert_eq!(fixture.connect().result, ResultCode::Success);

    fixture
        .stack
        .submit_command(fixture.net, 0x30, vec![1, 2, 3])
        .unwrap();
    let done = fixture.next_completion();

    assert_eq!(done.api, Api::Command);
    assert_eq!(done.result, ResultCode::Success);
    assert_eq!(
        done.data,
        CompletionData::Command {
            id: 0x30,
            body: vec![1, 2, 3],
        }
    );
    assert!(fixture.completions().is_empty());
    assert_eq!(fixture.manager(PRIMARY, |m| m.commands().len()), 1);
}

#[test]
fn test_set_mode() {
    let mut fixture = connected_single();
    fixture.stack.set_mode(fixture.net, 3).unwrap();
    let done = fixture.next_completion();

    assert_eq!(done.api, Api::SetMode);
    assert_eq!(done.result, ResultCode::Success);
    assert_eq!(
        done.data,
        CompletionData::Command {
            id: CMD_SET_MODE,
            body: vec![3],
        }
    );
    assert_eq!(fixture.manager(PRIMARY, |m| m.mode()), 3);
}

#[test]
fn test_command_failure_code_reported() {
    let mut fixture = connected_single();
    fixture.manager(PRIMARY, |m| m.config_mut().command_rc = ResultCode::InvalidParameter);

    fixture.stack.submit_command(fixture.net, 0x31, vec![]).unwrap();
    assert_eq!(fixture.next_completion().result, ResultCode::InvalidParameter);
}

#[test]
fn test_command_goes_to_primary() {
    // The primary manager sits on the second link.
    let mut fixture = SimStack::dual(dual(Role::Secondary, 0x11), dual(Role::Primary, 0x22));
    assert_eq!(fixture.connect().result, ResultCode::Success);

    fixture.stack.submit_command(fixture.net, 0x40, vec![9]).unwrap();
    assert_eq!(fixture.next_completion().result, ResultCode::Success);
    assert_eq!(fixture.manager(SECONDARY, |m| m.commands().len()), 1);
    assert!(fixture.manager(PRIMARY, |m| m.commands().is_empty()));
}

#[test]
fn test_command_times_out_after_retries() {
    let mut fixture = connected_single();
    fixture.manager(PRIMARY, |m| m.set_mute(true));

    let started = fixture.clock_now();
    fixture.stack.submit_command(fixture.net, 0x30, vec![]).unwrap();
    let done = fixture.next_completion();

    assert_eq!(done.api, Api::Command);
    assert_eq!(done.result, ResultCode::Timeout);
    assert!(fixture.clock_now() - started > 4_000);

    // The lock is free again.
    fixture.manager(PRIMARY, |m| m.set_mute(false));
    fixture.stack.submit_command(fixture.net, 0x30, vec![]).unwrap();
    assert_eq!(fixture.next_completion().result, ResultCode::Success);
}

#[test]
fn test_network_lock_busy() {
    let mut fixture = connected_single();
    fixture.stack.submit_command(fixture.net, 0x30, vec![]).unwrap();

    assert_eq!(fixture.stack.set_mode(fixture.net, 1), Err(ApiError::Busy));
    assert_eq!(
        fixture.stack.network(fixture.net).unwrap().busy_with(),
        Some(Api::Command)
    );

    assert_eq!(fixture.next_completion().result, ResultCode::Success);
    fixture.stack.set_mode(fixture.net, 1).unwrap();
    assert_eq!(fixture.next_completion().api, Api::SetMode);
}

#[test]
fn test_lock_watchdog_releases_lock() {
    let mut fixture = SimStack::new(vec![(PRIMARY, SimConfig::default())], |config| {
        config.lock_watchdog_ms = 500;
    });
    assert_eq!(fixture.connect().result, ResultCode::Success);
    fixture.manager(PRIMARY, |m| m.set_mute(true));

    fixture.stack.submit_command(fixture.net, 0x30, vec![]).unwrap();
    let done = fixture.next_completion();
    assert_eq!(done.result, ResultCode::Timeout);
    assert!(
        fixture
            .events()
            .contains(&Event::LockReleaseFault { api: Api::Command })
    );

    // The abandoned request never completes a second time.
    fixture.run(6_000);
    assert!(fixture.completions().is_empty());
    assert!(fixture.stack.network(fixture.net).unwrap().busy_with().is_none());
}

#[test]
fn test_connect_after_watchdog_keeps_primary_role() {
    let secondary = SimConfig {
        busy_rounds: 200,
        ..dual(Role::Secondary, 0x22)
    };
    let mut fixture = SimStack::new(
        vec![
            (PRIMARY, dual(Role::Primary, 0x11)),
            (SECONDARY, secondary),
        ],
        |config| config.connect.round_timeout_ms = 5_000,
    );

    let first = fixture.connect();
    assert_eq!(first.result, ResultCode::Timeout);
    assert!(
        fixture
            .events()
            .contains(&Event::LockReleaseFault { api: Api::Connect })
    );
    assert!(fixture.is_connected(PRIMARY));
    assert!(!fixture.is_connected(SECONDARY));

    fixture.manager(SECONDARY, |m| m.config_mut().busy_rounds = 0);
    let second = fixture.connect();
    assert_eq!(second.result, ResultCode::Success);
    let CompletionData::Connect(info) = second.data else {
        panic!("expected connect data");
    };
    assert_eq!(info.config_hash, HASH);
    assert_eq!(info.managers[0].role, Role::Primary);
    assert_eq!(info.managers[1].role, Role::Secondary);

    fixture.stack.submit_command(fixture.net, 0x40, vec![]).unwrap();
    assert_eq!(fixture.next_completion().result, ResultCode::Success);
    assert_eq!(fixture.manager(PRIMARY, |m| m.commands().len()), 1);
}

// ============================================================================
// Link supervision and session maintenance
// ============================================================================

#[test]
fn test_link_up_reported() {
    let mut fixture = SimStack::single(SimConfig::default());
    fixture.run(20);
    assert!(fixture.events().contains(&Event::PortUp(PRIMARY)));
    assert!(fixture.stack.is_link_available(fixture.net, PRIMARY));
}

#[test]
fn test_link_loss_and_reconnect() {
    let mut fixture = connected_single();
    fixture.manager(PRIMARY, |m| m.set_silent(true));
    fixture.run(200);

    let events = fixture.events();
    assert!(events.contains(&Event::PortDown(PRIMARY)));
    assert!(events.contains(&Event::Disconnected(PRIMARY)));
    assert!(!fixture.is_connected(PRIMARY));
    let stats = fixture.stack.port_statistics(fixture.net, PRIMARY).unwrap();
    assert_eq!(stats.link_down_count, 1);
    assert!(stats.rx_errors > 50);

    fixture.clear_events();
    fixture.manager(PRIMARY, |m| m.set_silent(false));
    assert!(fixture.run_until(|f| f.is_connected(PRIMARY)));

    let events = fixture.events();
    assert!(events.contains(&Event::PortUp(PRIMARY)));
    assert!(events.contains(&Event::Connected(PRIMARY)));
    // Reconnects are silent on the completion channel.
    fixture.run(10);
    assert!(fixture.completions().is_empty());
}

#[test]
fn test_forgotten_session_reconnects() {
    let mut fixture = connected_single();
    fixture.manager(PRIMARY, |m| m.forget_session());
    fixture.run(200);

    assert!(fixture.events().contains(&Event::Disconnected(PRIMARY)));
    assert!(fixture.run_until(|f| f.is_connected(PRIMARY)));
    assert_eq!(fixture.manager(PRIMARY, |m| m.connect_requests()), 2);
}

#[test]
fn test_reset_manager_does_not_report_disconnect() {
    let mut fixture = connected_single();
    fixture.stack.reset_manager(fixture.net, PRIMARY).unwrap();

    let done = fixture.next_completion();
    assert_eq!(done.api, Api::ResetManager);
    assert_eq!(done.result, ResultCode::Success);
    assert_eq!(
        fixture.manager(PRIMARY, |m| m.commands().last().map(|c| c.0)),
        Some(CMD_RESET_DEVICE)
    );

    fixture.run(100);
    assert!(fixture.run_until(|f| f.is_connected(PRIMARY)));

    let events = fixture.events();
    assert!(events.contains(&Event::PortDown(PRIMARY)));
    assert!(events.contains(&Event::PortUp(PRIMARY)));
    assert!(events.contains(&Event::Connected(PRIMARY)));
    assert!(!events.contains(&Event::Disconnected(PRIMARY)));
}

#[test]
fn test_no_reconnect_without_maintenance() {
    let mut fixture = SimStack::new(vec![(PRIMARY, SimConfig::default())], |config| {
        config.auto_maintain = false;
    });
    assert_eq!(fixture.connect().result, ResultCode::Success);
    fixture.run(50);

    fixture.manager(PRIMARY, |m| m.set_silent(true));
    fixture.run(200);
    fixture.manager(PRIMARY, |m| m.set_silent(false));
    fixture.run(200);

    assert!(fixture.events().contains(&Event::PortUp(PRIMARY)));
    assert!(!fixture.is_connected(PRIMARY));
    assert_eq!(fixture.manager(PRIMARY, |m| m.connect_requests()), 1);
}

// ============================================================================
// Background traffic, statistics, lifecycle
// ============================================================================

#[test]
fn test_status_polling() {
    let mut fixture = SimStack::new(vec![(PRIMARY, SimConfig::default())], |config| {
        config.background_interval_ms = Some(100);
    });
    assert_eq!(fixture.connect().result, ResultCode::Success);
    fixture.run(500);

    let report = fixture
        .stack
        .network(fixture.net)
        .unwrap()
        .status(PRIMARY)
        .expect("status reported");
    assert_eq!(report.node_count, 8);
    assert!(fixture.manager(PRIMARY, |m| m.status_requests()) >= 4);

    let stats = fixture.stack.port_statistics(fixture.net, PRIMARY).unwrap();
    assert!(stats.background_frames_sent >= 4);
}

#[test]
fn test_port_statistics() {
    let mut fixture = connected_single();
    fixture.run(100);

    let stats = fixture.stack.port_statistics(fixture.net, PRIMARY).unwrap();
    assert!(stats.tx_frames >= 100);
    assert!(stats.valid_frames >= 100);
    assert!(stats.user_frames_sent >= 1);
    assert_eq!(stats.link_up_count, 1);
    assert_eq!(stats.rx_errors, 0);

    let json = serde_json::to_value(stats).unwrap();
    assert_eq!(json["link_up_count"], 1);
}

#[test]
fn test_shared_bus_fairness() {
    let mut fixture = SimStack::dual(dual(Role::Primary, 0x11), dual(Role::Secondary, 0x22));
    fixture.script.take_sent();
    fixture.run(100);

    let sent = fixture.script.take_sent();
    let on = |cs: u8| sent.iter().filter(|x| x.chip_select.0 == cs).count();
    assert_eq!(on(0) + on(1), sent.len());
    assert!(on(0).abs_diff(on(1)) <= 1);
    assert!(sent.iter().all(|x| x.device == DeviceId(0)));
}

#[test]
fn test_close_network_closes_bus() {
    let mut fixture = connected_single();
    fixture.stack.close_network(fixture.net).unwrap();

    assert_eq!(fixture.script.close_calls(), vec![DeviceId(0)]);
    assert!(fixture.stack.network(fixture.net).is_none());
    // Ticks after close touch nothing.
    fixture.run(10);
    assert!(fixture.completions().is_empty());
}

#[test]
fn test_connect_info_serializes() {
    let mut fixture = SimStack::single(SimConfig::default());
    let CompletionData::Connect(info) = fixture.connect().data else {
        panic!("expected connect data");
    };
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["config_hash"], SimConfig::default().config_hash);
    assert_eq!(json["managers"][0]["role"], "Primary");
}
