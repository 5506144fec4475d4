//! Session establishment with one or two managers.
//!
//! A connect runs in rounds. Each round carries a fresh token and sends a
//! connect request to every manager still pending; responses with an old
//! token are ignored. Once no manager is pending, the per-manager results
//! are reconciled into a single outcome:
//!
//! ```text
//! Idle ──begin──▶ Connecting ──(no peer pending)──▶ Resolved
//!                   │    ▲
//!                   └────┘ round timeout: new token, re-send
//! ```

use super::config::ConnectConfig;
use super::event::{ConnectInfo, ManagerInfo};
use crate::error::ResultCode;
use crate::frame::SessionId;
use crate::packet::{ConnectResponse, Role};
use crate::port::{PortAddress, PortHandle};
use crate::request::elapsed_ms;

/// Where a manager stands in the current connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerResolution {
    /// Awaiting a usable response
    Pending,
    /// Session issued
    Connected,
    /// Still busy at the retry ceiling, role known; no session
    Accepted,
    /// Never answered with a role before the retry ceiling
    Unresolved,
    /// Refused us, or issued an unusable session id
    Rejected,
}

/// Connect-time view of one manager
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Port the manager is reached on
    pub port: PortHandle,
    /// Manager link
    pub address: PortAddress,
    /// Current resolution
    pub resolution: PeerResolution,
    /// Reported role
    pub role: Role,
    /// Reported protocol version
    pub protocol_version: u16,
    /// Reported configuration hash
    pub config_hash: u32,
    /// Reported DMH flag
    pub dmh_active: bool,
    /// Reported measurement buffer sizing
    pub measurement_buffer_len: usize,
}

impl PeerState {
    fn pending(port: PortHandle, address: PortAddress) -> Self {
        Self {
            port,
            address,
            resolution: PeerResolution::Pending,
            role: Role::Unknown,
            protocol_version: 0,
            config_hash: 0,
            dmh_active: false,
            measurement_buffer_len: 0,
        }
    }
}

/// Manager taking part in a connect
#[derive(Debug, Clone, Copy)]
pub struct ConnectTarget {
    /// Port the manager is reached on
    pub port: PortHandle,
    /// Manager link
    pub address: PortAddress,
    /// The port already holds a session
    pub connected: bool,
}

/// What to do with a connect response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Stale token, unknown port, or peer no longer pending
    Ignored,
    /// Log the port in under this session id
    LogIn(SessionId),
    /// Manager busy; stays pending
    Pending,
    /// Manager refused; terminal
    Rejected,
}

/// Reconciled result of a connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// Result code
    pub result: ResultCode,
    /// Run started by link recovery rather than the user
    pub is_reconnect: bool,
    /// Per-manager detail
    pub info: ConnectInfo,
}

/// Connect state machine
#[derive(Debug)]
pub struct ConnectState {
    config: ConnectConfig,
    token: u16,
    retries: u8,
    round_started: u32,
    in_progress: bool,
    is_reconnect: bool,
    invalid_state: bool,
    dual: bool,
    peers: Vec<PeerState>,
}

impl ConnectState {
    /// Create an idle state machine
    #[must_use]
    pub fn new(config: ConnectConfig) -> Self {
        Self {
            config,
            token: 0,
            retries: 0,
            round_started: 0,
            in_progress: false,
            is_reconnect: false,
            invalid_state: false,
            dual: false,
            peers: Vec::new(),
        }
    }

    /// Start a connect and return the first round's token.
    ///
    /// Managers that already hold a session keep what they reported last
    /// time; the rest become pending.
    pub fn begin(&mut self, now: u32, targets: &[ConnectTarget], reconnect: bool) -> u16 {
        let previous = std::mem::take(&mut self.peers);
        self.peers = targets
            .iter()
            .map(|target| {
                if target.connected {
                    let mut peer = previous
                        .iter()
                        .find(|p| p.port == target.port)
                        .cloned()
                        .unwrap_or_else(|| PeerState::pending(target.port, target.address));
                    peer.resolution = PeerResolution::Connected;
                    peer
                } else {
                    PeerState::pending(target.port, target.address)
                }
            })
            .collect();

        self.token = self.token.wrapping_add(1);
        self.retries = 0;
        self.round_started = now;
        self.in_progress = true;
        self.is_reconnect = reconnect;
        self.invalid_state = false;
        self.dual = targets.len() == 2;
        tracing::debug!(
            "Connect started (token {}, {} managers, reconnect {})",
            self.token,
            targets.len(),
            reconnect
        );
        self.token
    }

    /// Token of the current round
    #[must_use]
    pub fn token(&self) -> u16 {
        self.token
    }

    /// Check whether a connect is running
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Check whether the running connect is a reconnect
    #[must_use]
    pub fn is_reconnect(&self) -> bool {
        self.is_reconnect
    }

    /// Round timeouts so far
    #[must_use]
    pub fn retries(&self) -> u8 {
        self.retries
    }

    /// Ports still awaiting a usable response
    #[must_use]
    pub fn pending_ports(&self) -> Vec<PortHandle> {
        self.peers
            .iter()
            .filter(|p| p.resolution == PeerResolution::Pending)
            .map(|p| p.port)
            .collect()
    }

    /// Per-manager state
    #[must_use]
    pub fn peers(&self) -> &[PeerState] {
        &self.peers
    }

    /// Record a connect response from `port`
    pub fn on_response(&mut self, port: PortHandle, response: &ConnectResponse) -> ResponseAction {
        if !self.in_progress || response.token != self.token {
            tracing::debug!("Ignoring connect response with token {}", response.token);
            return ResponseAction::Ignored;
        }
        let dual = self.dual;
        let Some(peer) = self
            .peers
            .iter_mut()
            .find(|p| p.port == port && p.resolution == PeerResolution::Pending)
        else {
            return ResponseAction::Ignored;
        };

        peer.role = response.role;
        peer.protocol_version = response.protocol_version;
        peer.config_hash = response.config_hash;
        peer.dmh_active = response.dmh_active;
        peer.measurement_buffer_len = response.measurement_buffer_len();

        let mut invalid = false;
        if response.dual_manager != dual {
            tracing::warn!(
                "Manager {} dual-manager flag disagrees with configuration",
                peer.address
            );
            invalid = true;
        }

        let action = match response.rc {
            ResultCode::Success if response.session.is_issuable() => {
                peer.resolution = PeerResolution::Connected;
                ResponseAction::LogIn(response.session)
            }
            ResultCode::Busy => ResponseAction::Pending,
            rc => {
                tracing::warn!(
                    "Manager {} refused connect: {:?}, session {}",
                    peer.address,
                    rc,
                    response.session
                );
                peer.resolution = PeerResolution::Rejected;
                invalid = true;
                ResponseAction::Rejected
            }
        };
        self.invalid_state |= invalid;
        action
    }

    /// Check the round timer.
    ///
    /// Returns the new round's token when requests must be re-sent. At the
    /// retry ceiling every pending manager becomes terminal.
    pub fn poll(&mut self, now: u32) -> Option<u16> {
        if !self.in_progress
            || self.pending_ports().is_empty()
            || elapsed_ms(now, self.round_started) <= self.config.round_timeout_ms
        {
            return None;
        }

        // Wrapping: the counter is reset by begin() long before it could roll.
        self.retries = self.retries.wrapping_add(1);
        if self.retries <= self.config.max_retries {
            self.token = self.token.wrapping_add(1);
            self.round_started = now;
            tracing::debug!("Connect round {} (token {})", self.retries, self.token);
            return Some(self.token);
        }

        for peer in &mut self.peers {
            if peer.resolution == PeerResolution::Pending {
                peer.resolution = if peer.role == Role::Unknown {
                    PeerResolution::Unresolved
                } else {
                    PeerResolution::Accepted
                };
                tracing::debug!("Manager {} {:?} at retry ceiling", peer.address, peer.resolution);
            }
        }
        None
    }

    /// Reconcile once no manager is pending
    pub fn resolve(&mut self) -> Option<ConnectOutcome> {
        if !self.in_progress
            || self
                .peers
                .iter()
                .any(|p| p.resolution == PeerResolution::Pending)
        {
            return None;
        }
        self.in_progress = false;

        let result = self.reconcile();
        let info = ConnectInfo {
            config_hash: if result.is_success() {
                self.peers.first().map_or(0, |p| p.config_hash)
            } else {
                0
            },
            dmh_active: self.peers.iter().any(|p| p.dmh_active),
            measurement_buffer_len: self
                .peers
                .iter()
                .map(|p| p.measurement_buffer_len)
                .max()
                .unwrap_or(0),
            managers: self
                .peers
                .iter()
                .map(|p| ManagerInfo {
                    address: p.address,
                    role: p.role,
                    protocol_version: p.protocol_version,
                    connected: p.resolution == PeerResolution::Connected,
                })
                .collect(),
        };
        tracing::info!(
            "Connect resolved: {:?} (hash 0x{:08X})",
            result,
            info.config_hash
        );
        Some(ConnectOutcome {
            result,
            is_reconnect: self.is_reconnect,
            info,
        })
    }

    fn reconcile(&self) -> ResultCode {
        let has = |r: PeerResolution| self.peers.iter().any(|p| p.resolution == r);
        if has(PeerResolution::Unresolved) {
            return ResultCode::Timeout;
        }

        if let [a, b] = self.peers.as_slice() {
            let roles = matches!(
                (a.role, b.role),
                (Role::Primary, Role::Secondary) | (Role::Secondary, Role::Primary)
            );
            if !roles || a.protocol_version != b.protocol_version || a.dmh_active != b.dmh_active
            {
                return ResultCode::InvalidState;
            }
            if a.config_hash != b.config_hash {
                return ResultCode::ConfigurationMismatch;
            }
        }

        if self.invalid_state {
            ResultCode::InvalidState
        } else if has(PeerResolution::Accepted) {
            ResultCode::Timeout
        } else {
            ResultCode::Success
        }
    }

    /// Stop the running connect.
    ///
    /// What each manager reported is kept, so a manager that stays logged in
    /// still contributes its role to the next connect.
    pub fn abort(&mut self) {
        self.in_progress = false;
        self.is_reconnect = false;
        self.invalid_state = false;
    }

    /// Drop all connect state
    pub fn reset(&mut self) {
        self.abort();
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(index: usize, connected: bool) -> ConnectTarget {
        ConnectTarget {
            port: PortHandle {
                index,
                generation: 0,
            },
            address: PortAddress::new(index as u8, 0),
            connected,
        }
    }

    fn response(token: u16, role: Role, hash: u32, session: u8, dual: bool) -> ConnectResponse {
        ConnectResponse {
            token,
            rc: ResultCode::Success,
            role,
            protocol_version: 3,
            config_hash: hash,
            session: SessionId::new(session),
            dmh_active: false,
            dual_manager: dual,
            node_count: 12,
            packets_per_interval: 2,
        }
    }

    fn dual(a: (Role, u32), b: (Role, u32)) -> ConnectOutcome {
        let mut state = ConnectState::new(ConnectConfig::default());
        let targets = [target(0, false), target(1, false)];
        let token = state.begin(0, &targets, false);
        state.on_response(targets[0].port, &response(token, a.0, a.1, 1, true));
        state.on_response(targets[1].port, &response(token, b.0, b.1, 2, true));
        state.resolve().unwrap()
    }

    #[test]
    fn test_dual_success_reports_hash() {
        let outcome = dual((Role::Primary, 0xAB), (Role::Secondary, 0xAB));
        assert_eq!(outcome.result, ResultCode::Success);
        assert_eq!(outcome.info.config_hash, 0xAB);
        assert_eq!(outcome.info.measurement_buffer_len, 24);
        assert!(outcome.info.managers.iter().all(|m| m.connected));
    }

    #[test]
    fn test_dual_hash_mismatch() {
        let outcome = dual((Role::Primary, 0xAB), (Role::Secondary, 0xCD));
        assert_eq!(outcome.result, ResultCode::ConfigurationMismatch);
        assert_eq!(outcome.info.config_hash, 0);
    }

    #[test]
    fn test_dual_both_primary() {
        let outcome = dual((Role::Primary, 0xAB), (Role::Primary, 0xAB));
        assert_eq!(outcome.result, ResultCode::InvalidState);
        assert_eq!(outcome.info.config_hash, 0);
    }

    #[test]
    fn test_abort_keeps_connected_peer() {
        let mut state = ConnectState::new(ConnectConfig::default());
        let targets = [target(0, false), target(1, false)];
        let token = state.begin(0, &targets, false);
        state.on_response(targets[0].port, &response(token, Role::Primary, 0xAB, 1, true));
        state.abort();
        assert!(!state.is_in_progress());
        assert!(state.resolve().is_none());

        // The primary is still logged in; only the secondary is asked again.
        let again = [target(0, true), target(1, false)];
        let token = state.begin(100, &again, false);
        assert_eq!(state.pending_ports(), vec![again[1].port]);
        state.on_response(again[1].port, &response(token, Role::Secondary, 0xAB, 2, true));

        let outcome = state.resolve().unwrap();
        assert_eq!(outcome.result, ResultCode::Success);
        assert_eq!(outcome.info.config_hash, 0xAB);
        assert_eq!(outcome.info.managers[0].role, Role::Primary);
    }

    #[test]
    fn test_single_success_and_stale_token() {
        let mut state = ConnectState::new(ConnectConfig::default());
        let t = target(0, false);
        let token = state.begin(5, &[t], false);

        let stale = response(token.wrapping_sub(1), Role::Primary, 1, 9, false);
        assert_eq!(state.on_response(t.port, &stale), ResponseAction::Ignored);
        assert!(state.resolve().is_none());

        let ok = response(token, Role::Primary, 7, 9, false);
        assert_eq!(
            state.on_response(t.port, &ok),
            ResponseAction::LogIn(SessionId::new(9))
        );
        assert_eq!(state.on_response(t.port, &ok), ResponseAction::Ignored);

        let outcome = state.resolve().unwrap();
        assert_eq!(outcome.result, ResultCode::Success);
        assert_eq!(outcome.info.config_hash, 7);
        assert!(!state.is_in_progress());
    }

    #[test]
    fn test_unusable_session_id_is_invalid_state() {
        let mut state = ConnectState::new(ConnectConfig::default());
        let t = target(0, false);
        let token = state.begin(0, &[t], false);
        let bad = response(token, Role::Primary, 7, 0xFF, false);
        assert_eq!(state.on_response(t.port, &bad), ResponseAction::Rejected);
        assert_eq!(state.resolve().unwrap().result, ResultCode::InvalidState);
    }

    #[test]
    fn test_dual_flag_disagreement() {
        let mut state = ConnectState::new(ConnectConfig::default());
        let t = target(0, false);
        let token = state.begin(0, &[t], false);
        let r = response(token, Role::Primary, 7, 3, true);
        assert_eq!(
            state.on_response(t.port, &r),
            ResponseAction::LogIn(SessionId::new(3))
        );
        assert_eq!(state.resolve().unwrap().result, ResultCode::InvalidState);
    }

    #[test]
    fn test_rounds_then_ceiling() {
        let mut state = ConnectState::new(ConnectConfig::default());
        let targets = [target(0, false), target(1, false)];
        let first = state.begin(0, &targets, false);

        let mut busy = response(first, Role::Secondary, 1, 0, true);
        busy.rc = ResultCode::Busy;
        assert_eq!(
            state.on_response(targets[1].port, &busy),
            ResponseAction::Pending
        );

        assert_eq!(state.poll(1000), None);
        let mut now = 0;
        let mut tokens = vec![first];
        for _ in 0..3 {
            now += 1001;
            tokens.push(state.poll(now).unwrap());
        }
        assert_eq!(tokens, vec![first, first + 1, first + 2, first + 3]);

        now += 1001;
        assert_eq!(state.poll(now), None);
        let peers = state.peers();
        assert_eq!(peers[0].resolution, PeerResolution::Unresolved);
        assert_eq!(peers[1].resolution, PeerResolution::Accepted);

        let outcome = state.resolve().unwrap();
        assert_eq!(outcome.result, ResultCode::Timeout);
        assert_eq!(outcome.info.managers[1].role, Role::Secondary);
        assert!(!outcome.info.managers[1].connected);
    }

    #[test]
    fn test_accepted_without_session_times_out() {
        let mut state = ConnectState::new(ConnectConfig {
            round_timeout_ms: 10,
            max_retries: 0,
        });
        let t = target(0, false);
        let token = state.begin(0, &[t], false);
        let mut busy = response(token, Role::Primary, 1, 0, false);
        busy.rc = ResultCode::Busy;
        state.on_response(t.port, &busy);

        assert_eq!(state.poll(11), None);
        assert_eq!(state.resolve().unwrap().result, ResultCode::Timeout);
    }

    #[test]
    fn test_reconnect_keeps_connected_peer() {
        let mut state = ConnectState::new(ConnectConfig::default());
        let targets = [target(0, false), target(1, false)];
        let token = state.begin(0, &targets, false);
        state.on_response(targets[0].port, &response(token, Role::Primary, 5, 1, true));
        state.on_response(targets[1].port, &response(token, Role::Secondary, 5, 2, true));
        assert_eq!(state.resolve().unwrap().result, ResultCode::Success);

        let again = [target(0, true), target(1, false)];
        let token = state.begin(50, &again, true);
        assert_eq!(state.pending_ports(), vec![again[1].port]);
        state.on_response(again[1].port, &response(token, Role::Secondary, 5, 4, true));

        let outcome = state.resolve().unwrap();
        assert!(outcome.is_reconnect);
        assert_eq!(outcome.result, ResultCode::Success);
        assert_eq!(outcome.info.managers[0].role, Role::Primary);
    }
}
