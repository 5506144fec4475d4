//! Simulated managers for host-side testing.
//!
//! A [`SimManager`] answers the host the way a manager does on a
//! master-polled link: it sees every frame the host clocks out and its
//! answer is clocked in on the following exchange. [`SimNetwork`] hosts
//! several managers behind one [`ScriptedDriver`](wbms_transport::ScriptedDriver)
//! by installing itself as the script's responder.

use crate::FRAME_SIZE;
use crate::error::ResultCode;
use crate::frame::{FrameBuilder, FrameKind, SessionId, parse_frame};
use crate::packet::{
    CMD_RESET_DEVICE, CMD_SET_MODE, CommandResponse, ConnectResponse, Message, Role, StatusReport,
    split,
};
use crate::port::PortAddress;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use wbms_transport::ScriptHandle;

/// Behaviour of one simulated manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Role reported at connect
    pub role: Role,
    /// Configuration hash reported at connect
    pub config_hash: u32,
    /// Protocol version reported at connect
    pub protocol_version: u16,
    /// Session issued to the host
    pub session: SessionId,
    /// Configured for a dual-manager network
    pub dual_manager: bool,
    /// Alternate topology active
    pub dmh_active: bool,
    /// Nodes in the network
    pub node_count: u8,
    /// Measurement packets per node per interval
    pub packets_per_interval: u8,
    /// Connect requests to ignore before answering
    pub busy_rounds: u8,
    /// Result code of connect responses
    pub connect_rc: ResultCode,
    /// Result code of command responses
    pub command_rc: ResultCode,
    /// Send an interim response before each final command response
    pub interim_first: bool,
    /// Exchanges without an answer after a reset
    pub reset_silence: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            role: Role::Primary,
            config_hash: 0x1234_5678,
            protocol_version: 1,
            session: SessionId::new(0x11),
            dual_manager: false,
            dmh_active: false,
            node_count: 8,
            packets_per_interval: 2,
            busy_rounds: 0,
            connect_rc: ResultCode::Success,
            command_rc: ResultCode::Success,
            interim_first: false,
            reset_silence: 60,
        }
    }
}

impl SimConfig {
    /// Manager in a dual network with the given role and session
    #[must_use]
    pub fn dual(role: Role, session: u8) -> Self {
        Self {
            role,
            session: SessionId::new(session),
            dual_manager: true,
            ..Self::default()
        }
    }
}

/// One simulated manager
#[derive(Debug)]
pub struct SimManager {
    config: SimConfig,
    logged_in: bool,
    silent: bool,
    mute: bool,
    mode: u8,
    outbox: VecDeque<Vec<u8>>,
    rebooting: u32,
    ignored_connects: u8,
    connect_requests: u32,
    disconnect_requests: u32,
    status_requests: u32,
    commands: Vec<(u8, Vec<u8>)>,
}

impl SimManager {
    /// Create a logged-out manager
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            logged_in: false,
            silent: false,
            mute: false,
            mode: 0,
            outbox: VecDeque::new(),
            rebooting: 0,
            ignored_connects: 0,
            connect_requests: 0,
            disconnect_requests: 0,
            status_requests: 0,
            commands: Vec::new(),
        }
    }

    /// Behaviour settings
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Change behaviour settings
    pub fn config_mut(&mut self) -> &mut SimConfig {
        &mut self.config
    }

    /// Check whether the host holds a session
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Current system mode
    #[must_use]
    pub fn mode(&self) -> u8 {
        self.mode
    }

    /// Connect requests seen
    #[must_use]
    pub fn connect_requests(&self) -> u32 {
        self.connect_requests
    }

    /// Disconnect requests seen
    #[must_use]
    pub fn disconnect_requests(&self) -> u32 {
        self.disconnect_requests
    }

    /// Status requests seen
    #[must_use]
    pub fn status_requests(&self) -> u32 {
        self.status_requests
    }

    /// Commands received in a session, in order
    #[must_use]
    pub fn commands(&self) -> &[(u8, Vec<u8>)] {
        &self.commands
    }

    /// Clock in all-zero frames (bus not driven)
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Keep sending idle frames but ignore every request
    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    /// Drop the host's session without telling it
    pub fn forget_session(&mut self) {
        self.logged_in = false;
    }

    fn current_session(&self) -> SessionId {
        if self.logged_in {
            self.config.session
        } else {
            SessionId::LOGGED_OUT
        }
    }

    /// Idle frame carrying the current session
    #[must_use]
    pub fn idle_frame(&self) -> Vec<u8> {
        frame(self.current_session(), None)
    }

    /// Take one exchange: look at what the host sent and return the frame to
    /// clock in on the next exchange.
    pub fn exchange(&mut self, tx: &[u8]) -> Vec<u8> {
        if self.silent {
            return vec![0; FRAME_SIZE];
        }
        if let Ok(FrameKind::Data { session, payload }) = parse_frame(tx) {
            let messages: Vec<Message> = split(payload)
                .filter_map(Result::ok)
                .filter_map(|packet| Message::decode(packet).ok())
                .collect();
            for message in messages {
                self.handle(session, message);
            }
        }

        if let Some(reply) = self.outbox.pop_front() {
            return reply;
        }
        if self.rebooting > 0 {
            self.rebooting -= 1;
            return vec![0; FRAME_SIZE];
        }
        self.idle_frame()
    }

    fn in_session(&self, session: SessionId) -> bool {
        self.logged_in && session == self.config.session
    }

    fn reply(&mut self, session: SessionId, message: &Message) {
        self.outbox.push_back(frame(session, Some(message)));
    }

    fn handle(&mut self, session: SessionId, message: Message) {
        match message {
            Message::ConnectRequest(_) => self.connect_requests += 1,
            Message::DisconnectRequest { .. } => self.disconnect_requests += 1,
            Message::StatusRequest { .. } => self.status_requests += 1,
            _ => {}
        }
        if self.mute || self.rebooting > 0 {
            return;
        }
        match message {
            Message::ConnectRequest(request) => {
                if self.ignored_connects < self.config.busy_rounds {
                    self.ignored_connects += 1;
                    return;
                }
                let response = ConnectResponse {
                    token: request.token,
                    rc: self.config.connect_rc,
                    role: self.config.role,
                    protocol_version: self.config.protocol_version,
                    config_hash: self.config.config_hash,
                    session: self.config.session,
                    dmh_active: self.config.dmh_active,
                    dual_manager: self.config.dual_manager,
                    node_count: self.config.node_count,
                    packets_per_interval: self.config.packets_per_interval,
                };
                self.logged_in = response.rc.is_success();
                self.reply(SessionId::LOGGED_OUT, &Message::ConnectResponse(response));
            }
            Message::DisconnectRequest { token } => {
                if !self.in_session(session) {
                    return;
                }
                let response = Message::DisconnectResponse {
                    token,
                    rc: ResultCode::Success,
                };
                self.reply(self.config.session, &response);
                self.logged_in = false;
            }
            Message::StatusRequest { token } => {
                if !self.in_session(session) {
                    return;
                }
                let report = Message::StatusReport(StatusReport {
                    token,
                    mode: self.mode,
                    node_count: self.config.node_count,
                });
                self.reply(self.config.session, &report);
            }
            Message::Command { id, token, body } => {
                if !self.in_session(session) {
                    return;
                }
                self.on_command(id, token, body);
            }
            other => tracing::debug!("Simulated manager ignoring 0x{:02X}", other.id()),
        }
    }

    fn on_command(&mut self, id: u8, token: u16, body: Vec<u8>) {
        self.commands.push((id, body.clone()));
        let rc = self.config.command_rc;
        if self.config.interim_first {
            let interim = Message::CommandResponse(CommandResponse {
                id,
                token,
                rc: ResultCode::Interim,
                body: Vec::new(),
            });
            self.reply(self.config.session, &interim);
        }

        let data = match id {
            CMD_SET_MODE => {
                if rc.is_success() {
                    if let Some(&mode) = body.first() {
                        self.mode = mode;
                    }
                }
                vec![self.mode]
            }
            CMD_RESET_DEVICE => Vec::new(),
            _ => body,
        };
        let response = Message::CommandResponse(CommandResponse {
            id,
            token,
            rc,
            body: data,
        });
        self.reply(self.config.session, &response);

        if id == CMD_RESET_DEVICE && rc.is_success() {
            self.logged_in = false;
            self.rebooting = self.config.reset_silence;
        }
    }
}

fn frame(session: SessionId, message: Option<&Message>) -> Vec<u8> {
    let mut builder = FrameBuilder::new().session(session);
    if let Some(message) = message {
        builder = builder.packet(message.id(), &message.encode_body());
    }
    // Single messages always fit; fall back to an empty payload otherwise.
    builder.build().unwrap_or_else(|_| {
        FrameBuilder::new()
            .session(session)
            .build()
            .unwrap_or_else(|_| vec![0; FRAME_SIZE])
    })
}

type Managers = Mutex<BTreeMap<PortAddress, SimManager>>;

fn lock(managers: &Managers) -> MutexGuard<'_, BTreeMap<PortAddress, SimManager>> {
    managers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated managers sharing one scripted driver
#[derive(Debug, Clone, Default)]
pub struct SimNetwork {
    managers: Arc<Managers>,
}

impl SimNetwork {
    /// Create an empty simulation
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a manager on a link, replacing any already there
    pub fn add(&self, address: PortAddress, config: SimConfig) {
        lock(&self.managers).insert(address, SimManager::new(config));
    }

    /// Answer every exchange the script sees from the matching manager
    pub fn install(&self, script: &ScriptHandle) {
        for (address, manager) in lock(&self.managers).iter() {
            script.set_fallback(address.device, address.chip_select, manager.idle_frame());
        }
        let managers = Arc::clone(&self.managers);
        script.set_responder(Box::new(move |device, chip_select, tx| {
            let address = PortAddress {
                device,
                chip_select,
            };
            lock(&managers)
                .get_mut(&address)
                .map(|manager| vec![manager.exchange(tx)])
                .unwrap_or_default()
        }));
    }

    /// Inspect or change one manager
    pub fn with<T>(
        &self,
        address: PortAddress,
        f: impl FnOnce(&mut SimManager) -> T,
    ) -> Option<T> {
        lock(&self.managers).get_mut(&address).map(f)
    }
}
