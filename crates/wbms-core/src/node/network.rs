//! One network: up to two managers sharing a session lifecycle.
//!
//! A `Network` owns everything above the ports for its managers: the connect
//! state machine, the generic request slot, the command lock, and the queues
//! of events and completions awaiting delivery. It never owns the ports
//! themselves; those live in the stack's [`TransportManager`] and every
//! operation that touches them borrows it.

use super::config::NetworkConfig;
use super::connect::{ConnectState, ConnectTarget, PeerState, ResponseAction};
use super::event::{Api, Callbacks, Completion, CompletionData, ConnectInfo, Event, NetworkId};
use super::lock::{Lock, NetworkLock};
use crate::error::{ApiError, ResultCode};
use crate::mux::{LinkReport, TransportManager};
use crate::link::LinkTransition;
use crate::packet::{
    CMD_RESET_DEVICE, COMMAND_FIRST, COMMAND_LAST, CommandResponse, ConnectRequest,
    ConnectResponse, Message, Role, StatusReport,
};
use crate::port::{PortAddress, PortHandle};
use crate::request::{RequestEngine, TimeoutOutcome, elapsed_ms};
use std::collections::VecDeque;

/// Re-issues a timed-out request
pub(crate) type RetryFn = Box<dyn FnOnce(&mut Network, &mut TransportManager, u32) + Send>;

#[derive(Debug)]
enum Active {
    Connect,
    Disconnect { waiting: Vec<PortHandle> },
    Command { api: Api, port: PortHandle, id: u8 },
}

struct Finished {
    completion: Completion,
    notify: bool,
    release_lock: bool,
}

/// An open network
pub struct Network {
    id: NetworkId,
    config: NetworkConfig,
    ports: Vec<PortHandle>,
    lock: NetworkLock,
    connect: ConnectState,
    requests: RequestEngine<RetryFn>,
    active: Option<Active>,
    maintain: bool,
    reconnect_pending: bool,
    events: VecDeque<Event>,
    finished: VecDeque<Finished>,
    callbacks: Callbacks,
    status: Vec<Option<StatusReport>>,
    status_token: u16,
    last_status_poll: Option<u32>,
    last_connect: Option<ConnectInfo>,
}

impl Network {
    pub(crate) fn new(
        id: NetworkId,
        config: NetworkConfig,
        ports: Vec<PortHandle>,
        callbacks: Callbacks,
        lock: Box<dyn Lock>,
    ) -> Self {
        let status = vec![None; ports.len()];
        Self {
            id,
            lock: NetworkLock::new(lock, config.lock_watchdog_ms),
            connect: ConnectState::new(config.connect),
            requests: RequestEngine::new(config.request.max_retries),
            config,
            ports,
            active: None,
            maintain: false,
            reconnect_pending: false,
            events: VecDeque::new(),
            finished: VecDeque::new(),
            callbacks,
            status,
            status_token: 0,
            last_status_poll: None,
            last_connect: None,
        }
    }

    /// Network identifier
    #[must_use]
    pub fn id(&self) -> NetworkId {
        self.id
    }

    /// Configuration the network was opened with
    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Manager links in configuration order
    #[must_use]
    pub fn managers(&self) -> &[PortAddress] {
        &self.config.managers
    }

    /// API currently holding the network lock
    #[must_use]
    pub fn busy_with(&self) -> Option<Api> {
        self.lock.holder()
    }

    /// Check whether a reconnect waits for the next `process_task`
    #[must_use]
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Check whether lost sessions are re-established automatically
    #[must_use]
    pub fn is_maintaining(&self) -> bool {
        self.maintain && self.config.auto_maintain
    }

    /// Result of the last completed connect or reconnect
    #[must_use]
    pub fn last_connect(&self) -> Option<&ConnectInfo> {
        self.last_connect.as_ref()
    }

    /// Last status reported by a manager
    #[must_use]
    pub fn status(&self, address: PortAddress) -> Option<StatusReport> {
        let index = self.config.managers.iter().position(|a| *a == address)?;
        self.status[index]
    }

    /// Connect state machine
    #[must_use]
    pub fn connect_state(&self) -> &ConnectState {
        &self.connect
    }

    pub(crate) fn ports(&self) -> &[PortHandle] {
        &self.ports
    }

    pub(crate) fn port_for(&self, address: PortAddress) -> Option<PortHandle> {
        let index = self.config.managers.iter().position(|a| *a == address)?;
        self.ports.get(index).copied()
    }

    fn address_of(&self, port: PortHandle) -> Option<PortAddress> {
        let index = self.ports.iter().position(|p| *p == port)?;
        self.config.managers.get(index).copied()
    }

    fn finish(&mut self, api: Api, result: ResultCode, data: CompletionData, notify: bool) {
        self.active = None;
        self.finished.push_back(Finished {
            completion: Completion { api, result, data },
            notify,
            release_lock: true,
        });
    }

    fn emit(&mut self, event: Event) {
        tracing::debug!("{} event {:?}", self.id, event);
        self.events.push_back(event);
    }

    // ----- connect -----

    pub(crate) fn connect(
        &mut self,
        mux: &mut TransportManager,
        now: u32,
    ) -> Result<(), ApiError> {
        if self.connect.is_in_progress() {
            return Err(ApiError::Busy);
        }
        self.lock.acquire(Api::Connect, now)?;
        self.start_connect(mux, now, false);
        Ok(())
    }

    fn start_connect(&mut self, mux: &mut TransportManager, now: u32, reconnect: bool) {
        let targets: Vec<ConnectTarget> = self
            .ports
            .iter()
            .zip(&self.config.managers)
            .map(|(&port, &address)| ConnectTarget {
                port,
                address,
                connected: mux.is_connected(port),
            })
            .collect();

        let token = self.connect.begin(now, &targets, reconnect);
        self.active = Some(Active::Connect);
        self.send_connect_requests(mux, token);
        self.evaluate_connect();
    }

    fn send_connect_requests(&mut self, mux: &mut TransportManager, token: u16) {
        let request = Message::ConnectRequest(ConnectRequest {
            token,
            reconnect: self.connect.is_reconnect(),
            dual_manager: self.config.is_dual(),
        });
        for port in self.connect.pending_ports() {
            if let Err(e) = mux.queue_user(port, &request) {
                tracing::warn!("Could not queue connect request on {}: {}", port, e);
            }
        }
    }

    fn evaluate_connect(&mut self) {
        let Some(outcome) = self.connect.resolve() else {
            return;
        };
        if outcome.result.is_success() && !outcome.is_reconnect {
            self.maintain = true;
        }
        self.last_connect = Some(outcome.info.clone());
        self.finish(
            Api::Connect,
            outcome.result,
            CompletionData::Connect(outcome.info),
            !outcome.is_reconnect,
        );
    }

    fn on_connect_response(
        &mut self,
        mux: &mut TransportManager,
        port: PortHandle,
        response: &ConnectResponse,
    ) {
        if let ResponseAction::LogIn(session) = self.connect.on_response(port, response) {
            mux.log_in(port, session);
            if let Some(address) = self.address_of(port) {
                tracing::info!("Logged in to {} with session {}", address, session);
                self.emit(Event::Connected(address));
            }
        }
        self.evaluate_connect();
    }

    // ----- disconnect -----

    pub(crate) fn disconnect(
        &mut self,
        mux: &mut TransportManager,
        now: u32,
    ) -> Result<(), ApiError> {
        let waiting: Vec<PortHandle> = self
            .ports
            .iter()
            .copied()
            .filter(|&p| mux.is_connected(p))
            .collect();
        if waiting.is_empty() {
            return Err(ApiError::NotConnected);
        }
        self.lock.acquire(Api::Disconnect, now)?;

        self.requests.start();
        self.active = Some(Active::Disconnect { waiting });
        if let Err(e) = self.send_disconnect(mux, now) {
            self.active = None;
            self.lock.release();
            return Err(e);
        }
        Ok(())
    }

    fn send_disconnect(&mut self, mux: &mut TransportManager, now: u32) -> Result<(), ApiError> {
        let Some(Active::Disconnect { waiting }) = &self.active else {
            return Err(ApiError::NotConnected);
        };
        let waiting = waiting.clone();

        let retry: RetryFn = Box::new(|net: &mut Network, mux: &mut TransportManager, now| {
            if let Err(e) = net.send_disconnect(mux, now) {
                tracing::warn!("Disconnect retry failed: {}", e);
                net.complete_disconnect(mux, ResultCode::Fail);
            }
        });
        let token = self
            .requests
            .arm(now, self.config.request.timeout_ms, retry)?;

        let request = Message::DisconnectRequest { token };
        for port in waiting {
            if let Err(e) = mux.queue_user(port, &request) {
                self.requests.cancel();
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn on_disconnect_response(
        &mut self,
        mux: &mut TransportManager,
        port: PortHandle,
        token: u16,
        rc: ResultCode,
    ) {
        let Some(Active::Disconnect { waiting }) = &mut self.active else {
            tracing::debug!("Unsolicited disconnect response on {}", port);
            return;
        };
        if !waiting.contains(&port) {
            return;
        }
        let last = waiting.len() == 1;
        if self.requests.match_and_consume(token, last).is_err() {
            tracing::debug!("Ignoring disconnect response with token {}", token);
            return;
        }
        waiting.retain(|p| *p != port);
        if !rc.is_success() {
            tracing::warn!("Manager on {} answered disconnect with {:?}", port, rc);
        }
        if last {
            self.complete_disconnect(mux, ResultCode::Success);
        }
    }

    fn complete_disconnect(&mut self, mux: &mut TransportManager, result: ResultCode) {
        for index in 0..self.ports.len() {
            let port = self.ports[index];
            if mux.is_connected(port) {
                mux.log_out(port);
                let address = self.config.managers[index];
                self.emit(Event::Disconnected(address));
            }
        }
        self.requests.cancel();
        self.connect.reset();
        self.maintain = false;
        self.reconnect_pending = false;
        tracing::info!("{} disconnected: {:?}", self.id, result);
        self.finish(Api::Disconnect, result, CompletionData::None, true);
    }

    // ----- generic commands -----

    fn command_target(&self, mux: &TransportManager) -> Option<PortHandle> {
        let connected: Vec<&PeerState> = self
            .connect
            .peers()
            .iter()
            .filter(|p| mux.is_connected(p.port))
            .collect();
        connected
            .iter()
            .find(|p| p.role == Role::Primary)
            .or_else(|| connected.first())
            .map(|p| p.port)
    }

    pub(crate) fn submit_command(
        &mut self,
        mux: &mut TransportManager,
        now: u32,
        api: Api,
        id: u8,
        body: Vec<u8>,
    ) -> Result<(), ApiError> {
        if !(COMMAND_FIRST..=COMMAND_LAST).contains(&id) {
            return Err(ApiError::InvalidParameter(
                format!("command id 0x{id:02X} out of range").into(),
            ));
        }
        let port = self.command_target(mux).ok_or(ApiError::NotConnected)?;
        self.issue_command(mux, now, api, port, id, body)
    }

    pub(crate) fn reset_manager(
        &mut self,
        mux: &mut TransportManager,
        now: u32,
        address: PortAddress,
    ) -> Result<(), ApiError> {
        let port = self.port_for(address).ok_or_else(|| {
            ApiError::InvalidParameter(format!("{address} is not a manager of this network").into())
        })?;
        self.issue_command(mux, now, Api::ResetManager, port, CMD_RESET_DEVICE, Vec::new())?;
        mux.set_reset_in_progress(port, true);
        Ok(())
    }

    fn issue_command(
        &mut self,
        mux: &mut TransportManager,
        now: u32,
        api: Api,
        port: PortHandle,
        id: u8,
        body: Vec<u8>,
    ) -> Result<(), ApiError> {
        if !mux.is_connected(port) {
            return Err(ApiError::NotConnected);
        }
        self.lock.acquire(api, now)?;
        self.requests.start();
        self.active = Some(Active::Command { api, port, id });
        if let Err(e) = self.send_command(mux, now, port, id, body) {
            self.active = None;
            self.lock.release();
            return Err(e);
        }
        Ok(())
    }

    fn send_command(
        &mut self,
        mux: &mut TransportManager,
        now: u32,
        port: PortHandle,
        id: u8,
        body: Vec<u8>,
    ) -> Result<(), ApiError> {
        if !mux.is_connected(port) {
            return Err(ApiError::NotConnected);
        }
        let resend = body.clone();
        let retry: RetryFn = Box::new(move |net: &mut Network, mux: &mut TransportManager, now| {
            if let Err(e) = net.send_command(mux, now, port, id, resend) {
                tracing::warn!("Command 0x{:02X} retry failed: {}", id, e);
                net.abort_command(mux, ResultCode::Fail);
            }
        });
        let token = self
            .requests
            .arm(now, self.config.request.timeout_ms, retry)?;

        let command = Message::Command { id, token, body };
        if let Err(e) = mux.queue_user(port, &command) {
            self.requests.cancel();
            return Err(e.into());
        }
        tracing::debug!("Command 0x{:02X} queued on {} (token {})", id, port, token);
        Ok(())
    }

    fn on_command_response(
        &mut self,
        mux: &mut TransportManager,
        port: PortHandle,
        response: CommandResponse,
    ) {
        let Some(Active::Command { api, port: target, id }) = self.active else {
            tracing::debug!("Unsolicited response 0x{:02X} on {}", response.id, port);
            return;
        };
        if port != target || response.id != id {
            return;
        }

        let interim = response.rc == ResultCode::Interim;
        if self
            .requests
            .match_and_consume(response.token, !interim)
            .is_err()
        {
            tracing::debug!("Ignoring response with token {}", response.token);
            return;
        }
        if interim {
            tracing::debug!("Interim response to 0x{:02X}", id);
            return;
        }

        if api == Api::ResetManager && !response.rc.is_success() {
            mux.set_reset_in_progress(port, false);
        }
        self.finish(
            api,
            response.rc,
            CompletionData::Command {
                id,
                body: response.body,
            },
            true,
        );
    }

    fn abort_command(&mut self, mux: &mut TransportManager, result: ResultCode) {
        let Some(Active::Command { api, port, .. }) = self.active else {
            return;
        };
        self.requests.cancel();
        if api == Api::ResetManager {
            mux.set_reset_in_progress(port, false);
        }
        self.finish(api, result, CompletionData::None, true);
    }

    // ----- inbound traffic -----

    pub(crate) fn on_logged_out(
        &mut self,
        mux: &mut TransportManager,
        port: PortHandle,
        message: Message,
    ) {
        match message {
            Message::ConnectResponse(response) => self.on_connect_response(mux, port, &response),
            other => tracing::debug!("Ignoring logged-out message 0x{:02X}", other.id()),
        }
    }

    pub(crate) fn on_logged_in(
        &mut self,
        mux: &mut TransportManager,
        port: PortHandle,
        message: Message,
    ) {
        match message {
            Message::ConnectResponse(response) => self.on_connect_response(mux, port, &response),
            Message::DisconnectResponse { token, rc } => {
                self.on_disconnect_response(mux, port, token, rc);
            }
            Message::CommandResponse(response) => self.on_command_response(mux, port, response),
            Message::StatusReport(report) => {
                if let Some(index) = self.ports.iter().position(|p| *p == port) {
                    self.status[index] = Some(report);
                }
            }
            other => tracing::debug!("Ignoring message 0x{:02X} from manager", other.id()),
        }
    }

    pub(crate) fn on_link(&mut self, mux: &TransportManager, port: PortHandle, report: LinkReport) {
        let Some(address) = self.address_of(port) else {
            return;
        };
        match report.transition {
            LinkTransition::Lost => {
                self.emit(Event::PortDown(address));
                if report.was_connected && !report.reset_in_progress {
                    self.emit(Event::Disconnected(address));
                }
            }
            LinkTransition::Established => {
                self.emit(Event::PortUp(address));
                if self.is_maintaining() && !mux.is_connected(port) {
                    tracing::debug!("Reconnect scheduled for {}", address);
                    self.reconnect_pending = true;
                }
            }
        }
    }

    // ----- foreground -----

    /// Timers, retries, deferred reconnect and background polling
    pub(crate) fn poll(&mut self, mux: &mut TransportManager, now: u32) {
        if self.connect.is_in_progress() {
            if let Some(token) = self.connect.poll(now) {
                self.send_connect_requests(mux, token);
            }
            self.evaluate_connect();
        }

        match self.requests.poll_timeout(now) {
            TimeoutOutcome::Retry(retry) => retry(self, mux, now),
            TimeoutOutcome::Expired => self.on_request_expired(mux),
            TimeoutOutcome::Waiting => {}
        }

        if let Some(api) = self.lock.check_watchdog(now) {
            self.abandon(mux, api);
            self.emit(Event::LockReleaseFault { api });
        }

        if self.reconnect_pending
            && self.active.is_none()
            && self.lock.acquire(Api::Connect, now).is_ok()
        {
            self.reconnect_pending = false;
            tracing::info!("{} reconnecting", self.id);
            self.start_connect(mux, now, true);
        }

        self.poll_status(mux, now);
    }

    fn on_request_expired(&mut self, mux: &mut TransportManager) {
        match self.active {
            Some(Active::Disconnect { .. }) => self.complete_disconnect(mux, ResultCode::Timeout),
            Some(Active::Command { .. }) => self.abort_command(mux, ResultCode::Timeout),
            Some(Active::Connect) | None => {}
        }
    }

    fn abandon(&mut self, mux: &mut TransportManager, api: Api) {
        let notify = match self.active.take() {
            Some(Active::Connect) => {
                let notify = !self.connect.is_reconnect();
                self.connect.abort();
                notify
            }
            Some(Active::Command { port, .. }) => {
                mux.set_reset_in_progress(port, false);
                true
            }
            Some(Active::Disconnect { .. }) => true,
            None => false,
        };
        self.requests.cancel();
        if notify {
            self.finished.push_back(Finished {
                completion: Completion {
                    api,
                    result: ResultCode::Timeout,
                    data: CompletionData::None,
                },
                notify: true,
                release_lock: false,
            });
        }
    }

    fn poll_status(&mut self, mux: &mut TransportManager, now: u32) {
        let Some(interval) = self.config.background_interval_ms else {
            return;
        };
        if self
            .last_status_poll
            .is_some_and(|last| elapsed_ms(now, last) < interval)
        {
            return;
        }
        self.last_status_poll = Some(now);

        for &port in &self.ports {
            if !mux.is_connected(port) {
                continue;
            }
            self.status_token = self.status_token.wrapping_add(1);
            let request = Message::StatusRequest {
                token: self.status_token,
            };
            if let Err(e) = mux.queue_background(port, &request) {
                tracing::debug!("Status poll skipped on {}: {}", port, e);
            }
        }
    }

    /// Hand queued events and completions to the callbacks
    pub(crate) fn deliver(&mut self) {
        while let Some(event) = self.events.pop_front() {
            if let Some(on_event) = self.callbacks.on_event.as_mut() {
                on_event(self.id, &event);
            }
        }
        while let Some(done) = self.finished.pop_front() {
            if done.release_lock {
                self.lock.release();
            }
            if done.notify {
                if let Some(on_completion) = self.callbacks.on_completion.as_mut() {
                    on_completion(self.id, &done.completion);
                }
            }
        }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("id", &self.id)
            .field("managers", &self.config.managers)
            .field("active", &self.active)
            .field("maintain", &self.maintain)
            .field("reconnect_pending", &self.reconnect_pending)
            .finish_non_exhaustive()
    }
}
