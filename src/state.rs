// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session state machine.
//!
//! A session has a primary state tracking which ports are streaming, and a set of orthogonal
//! sub-states tracking the drain and dynamic resolution change (DRC) handshakes with the
//! firmware. Transitions that require the firmware to act are returned as a list of
//! [`Command`]s for the caller to post, in order.

use bitflags::bitflags;
use log::debug;
use log::error;
use thiserror::Error;

use crate::protocol::HfiPort;
use crate::Domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    Input,
    Output,
}

impl Port {
    pub fn index(self) -> usize {
        match self {
            Port::Input => 0,
            Port::Output => 1,
        }
    }

    /// Maps a wire port to the session port it designates. A decoder consumes the bitstream,
    /// an encoder produces it.
    pub fn from_hfi(domain: Domain, port: HfiPort) -> Option<Port> {
        match (domain, port) {
            (Domain::Decoder, HfiPort::BITSTREAM) | (Domain::Encoder, HfiPort::RAW) => {
                Some(Port::Input)
            }
            (Domain::Decoder, HfiPort::RAW) | (Domain::Encoder, HfiPort::BITSTREAM) => {
                Some(Port::Output)
            }
            (_, HfiPort::NONE) => None,
        }
    }

    pub fn hfi_port(self, domain: Domain) -> HfiPort {
        match (domain, self) {
            (Domain::Decoder, Port::Input) | (Domain::Encoder, Port::Output) => HfiPort::BITSTREAM,
            (Domain::Decoder, Port::Output) | (Domain::Encoder, Port::Input) => HfiPort::RAW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    InputStreaming,
    OutputStreaming,
    Streaming,
    Close,
    Error,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SubState: u32 {
        const DRAIN = 1 << 0;
        const DRC = 1 << 1;
        const DRAIN_LAST_BUFFER = 1 << 2;
        const DRC_LAST_BUFFER = 1 << 3;
        const INPUT_PAUSE = 1 << 4;
        const OUTPUT_PAUSE = 1 << 5;
        const FIRST_IPSC = 1 << 6;
    }
}

/// Verdict of an allow check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allow {
    Allow,
    Defer,
    Disallow,
    Ignore,
}

/// Which handshake a resume completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    SettingsChange,
    Drain,
}

/// Firmware commands a transition requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start(Port),
    Pause(Port),
    Resume(Port, ResumeKind),
    /// Reallocate and queue the input internal buffers, then set stage and pipe.
    QueueInputInternal,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("{action} not allowed in state {state:?}, sub state {sub_state:?}")]
    NotAllowed {
        action: &'static str,
        state: SessionState,
        sub_state: SubState,
    },
    #[error("{0:?} port is not streaming")]
    NotStreaming(Port),
    #[error("invalid sub states to clear {clear:?} or set {set:?}")]
    InvalidSubState { clear: SubState, set: SubState },
}

pub struct SessionStateMachine {
    domain: Domain,
    state: SessionState,
    sub_state: SubState,
    /// Whether streaming was requested on each port, independently of the primary state which
    /// is lost once in `Error`.
    streaming: [bool; 2],
}

impl SessionStateMachine {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            state: SessionState::Open,
            sub_state: SubState::empty(),
            streaming: [false; 2],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sub_state(&self) -> SubState {
        self.sub_state
    }

    pub fn is_sub_state(&self, sub_state: SubState) -> bool {
        self.sub_state.contains(sub_state)
    }

    pub fn is_error(&self) -> bool {
        self.state == SessionState::Error
    }

    pub fn is_streaming(&self, port: Port) -> bool {
        self.streaming[port.index()]
    }

    fn not_allowed(&self, action: &'static str) -> StateError {
        error!(
            "{} not allowed in state {:?}, sub state {:?}",
            action, self.state, self.sub_state
        );
        StateError::NotAllowed {
            action,
            state: self.state,
            sub_state: self.sub_state,
        }
    }

    /// Moves to `new_state`. Once in `Error` the session stays there.
    pub fn change_state(&mut self, new_state: SessionState) {
        if self.is_error() {
            debug!("session in error, cannot move to {:?}", new_state);
            return;
        }
        if new_state == SessionState::Error {
            error!("state change {:?} -> {:?}", self.state, new_state);
        } else {
            debug!("state change {:?} -> {:?}", self.state, new_state);
        }
        self.state = new_state;
    }

    pub fn change_sub_state(&mut self, clear: SubState, set: SubState) -> Result<(), StateError> {
        if self.is_error() || (clear.is_empty() && set.is_empty()) {
            return Ok(());
        }
        if clear.intersects(set) {
            error!("invalid sub states to clear {:?} or set {:?}", clear, set);
            return Err(StateError::InvalidSubState { clear, set });
        }
        let prev = self.sub_state;
        self.sub_state.insert(set);
        self.sub_state.remove(clear);
        debug!("sub state change {:?} -> {:?}", prev, self.sub_state);
        Ok(())
    }

    pub fn allow_streamon(&self, port: Port) -> bool {
        match port {
            Port::Input => matches!(
                self.state,
                SessionState::Open | SessionState::OutputStreaming
            ),
            Port::Output => matches!(
                self.state,
                SessionState::Open | SessionState::InputStreaming
            ),
        }
    }

    /// Starts streaming on `port` and returns the firmware commands to post.
    pub fn streamon(&mut self, port: Port) -> Result<Vec<Command>, StateError> {
        if !self.allow_streamon(port) {
            return Err(self.not_allowed(match port {
                Port::Input => "input streamon",
                Port::Output => "output streamon",
            }));
        }
        let commands = match port {
            Port::Input => self.streamon_input()?,
            Port::Output => self.streamon_output()?,
        };
        self.streaming[port.index()] = true;
        Ok(commands)
    }

    fn streamon_input(&mut self) -> Result<Vec<Command>, StateError> {
        let mut commands = vec![Command::Start(Port::Input)];
        self.change_sub_state(SubState::INPUT_PAUSE, SubState::empty())?;

        // Keep the firmware input paused while a DRC or drain handshake is pending, so it does
        // not raise another settings change before the client reacts.
        let mut set = SubState::empty();
        if self
            .sub_state
            .intersects(SubState::DRC | SubState::DRAIN | SubState::FIRST_IPSC)
            && !self.is_sub_state(SubState::INPUT_PAUSE)
        {
            commands.push(Command::Pause(Port::Input));
            set = SubState::INPUT_PAUSE;
        }

        self.change_state(match self.state {
            SessionState::Open => SessionState::InputStreaming,
            _ => SessionState::Streaming,
        });
        self.change_sub_state(SubState::empty(), set)?;
        Ok(commands)
    }

    fn streamon_output(&mut self) -> Result<Vec<Command>, StateError> {
        let mut commands = Vec::new();
        let mut clear = SubState::empty();

        if self.is_sub_state(SubState::DRC | SubState::DRC_LAST_BUFFER) {
            clear |= SubState::DRC | SubState::DRC_LAST_BUFFER;
        }
        // The client is completing a port reconfiguration.
        if self.domain == Domain::Decoder && self.is_sub_state(SubState::INPUT_PAUSE) {
            commands.push(Command::QueueInputInternal);
        }

        let drain_pending = self.is_sub_state(SubState::DRAIN | SubState::DRAIN_LAST_BUFFER);
        if !drain_pending
            && self.state == SessionState::InputStreaming
            && self.is_sub_state(SubState::INPUT_PAUSE)
        {
            commands.push(Command::Resume(Port::Input, ResumeKind::SettingsChange));
            clear |= SubState::INPUT_PAUSE;
        }

        if self.is_sub_state(SubState::FIRST_IPSC) {
            clear |= SubState::DRC | SubState::FIRST_IPSC;
        }

        commands.push(Command::Start(Port::Output));
        self.change_sub_state(SubState::OUTPUT_PAUSE, SubState::empty())?;

        self.change_state(match self.state {
            SessionState::Open => SessionState::OutputStreaming,
            _ => SessionState::Streaming,
        });
        self.change_sub_state(clear, SubState::empty())?;
        Ok(commands)
    }

    /// Stops streaming on `port`. Stopping a port that is not streaming is rejected without any
    /// change.
    pub fn streamoff(&mut self, port: Port) -> Result<(), StateError> {
        if !self.is_streaming(port) {
            return Err(StateError::NotStreaming(port));
        }
        self.streaming[port.index()] = false;
        let new_state = match (port, self.state) {
            (Port::Input, SessionState::InputStreaming) => SessionState::Open,
            (Port::Input, SessionState::Streaming) => SessionState::OutputStreaming,
            (Port::Output, SessionState::OutputStreaming) => SessionState::Open,
            (Port::Output, SessionState::Streaming) => SessionState::InputStreaming,
            _ => SessionState::Error,
        };
        self.change_state(new_state);
        Ok(())
    }

    /// Checks whether a drain can start, and marks it pending if so.
    pub fn request_drain(&mut self) -> Result<Allow, StateError> {
        match self.state {
            SessionState::InputStreaming | SessionState::Streaming
                if !self.is_sub_state(SubState::DRAIN) =>
            {
                self.change_sub_state(SubState::empty(), SubState::DRAIN)?;
                Ok(Allow::Allow)
            }
            SessionState::Open => {
                debug!("drain ignored in state {:?}", self.state);
                Ok(Allow::Ignore)
            }
            _ => Err(self.not_allowed("drain")),
        }
    }

    /// Completes a DRC or drain handshake. DRC is resolved first; a drain that is also pending
    /// is completed by the next resume.
    pub fn resume(&mut self) -> Result<Vec<Command>, StateError> {
        let streaming = matches!(
            self.state,
            SessionState::InputStreaming | SessionState::OutputStreaming | SessionState::Streaming
        );
        let drc = self.is_sub_state(SubState::DRC | SubState::DRC_LAST_BUFFER);
        let drain = self.is_sub_state(SubState::DRAIN | SubState::DRAIN_LAST_BUFFER);
        if !streaming || !(drc || drain) {
            return Err(self.not_allowed("resume"));
        }

        let mut commands = Vec::new();
        let (mut clear, kind, resume_ports) = if drc {
            (
                SubState::DRC | SubState::DRC_LAST_BUFFER,
                ResumeKind::SettingsChange,
                !drain,
            )
        } else {
            (
                SubState::DRAIN | SubState::DRAIN_LAST_BUFFER,
                ResumeKind::Drain,
                true,
            )
        };
        if resume_ports {
            if self.is_sub_state(SubState::INPUT_PAUSE) {
                commands.push(Command::Resume(Port::Input, kind));
                clear |= SubState::INPUT_PAUSE;
            }
            if self.is_sub_state(SubState::OUTPUT_PAUSE) {
                commands.push(Command::Resume(Port::Output, kind));
                clear |= SubState::OUTPUT_PAUSE;
            }
        }
        self.change_sub_state(clear, SubState::empty())?;
        Ok(commands)
    }

    /// Decides what to do with a buffer queued by the client on `port`.
    pub fn allow_qbuf(&self, port: Port, meta: bool) -> Allow {
        if self.is_error() {
            error!("qbuf not allowed in error state");
            return Allow::Disallow;
        }
        if !self.is_streaming(port) {
            return Allow::Defer;
        }
        // Metadata buffers go out together with their data buffer.
        if meta {
            return Allow::Defer;
        }
        let deferred = match port {
            Port::Input => matches!(
                self.state,
                SessionState::Open | SessionState::OutputStreaming
            ),
            Port::Output => matches!(
                self.state,
                SessionState::Open | SessionState::InputStreaming
            ),
        };
        if deferred {
            Allow::Defer
        } else {
            Allow::Allow
        }
    }

    /// Records an input port settings change. Rejected while a previous DRC is pending.
    pub fn input_psc(&mut self) -> Result<(), StateError> {
        if self.is_sub_state(SubState::DRC) {
            return Err(self.not_allowed("input port settings change"));
        }
        let mut set = SubState::DRC | SubState::INPUT_PAUSE;
        // The output port has never streamed: the client configures it for the first time.
        if matches!(
            self.state,
            SessionState::Open | SessionState::InputStreaming
        ) {
            set |= SubState::FIRST_IPSC;
        }
        self.change_sub_state(SubState::empty(), set)
    }

    /// Records the last buffer of a drain.
    pub fn drain_last_flag(&mut self) -> Result<(), StateError> {
        if !self.is_sub_state(SubState::DRAIN | SubState::INPUT_PAUSE)
            || self.is_sub_state(SubState::DRAIN_LAST_BUFFER)
        {
            return Err(self.not_allowed("drain last flag"));
        }
        self.change_sub_state(
            SubState::empty(),
            SubState::DRAIN_LAST_BUFFER | SubState::OUTPUT_PAUSE,
        )
    }

    /// Records the last buffer before a port settings change.
    pub fn psc_last_flag(&mut self) -> Result<(), StateError> {
        if !self.is_sub_state(SubState::DRC | SubState::INPUT_PAUSE)
            || self.is_sub_state(SubState::DRC_LAST_BUFFER)
        {
            return Err(self.not_allowed("psc last flag"));
        }
        self.change_sub_state(
            SubState::empty(),
            SubState::DRC_LAST_BUFFER | SubState::OUTPUT_PAUSE,
        )
    }

    /// Handles the firmware acknowledging a stop on `port`.
    pub fn stop_done(&mut self, port: Port) -> Result<(), StateError> {
        let set = match port {
            Port::Input => {
                // The firmware must have returned the last buffer of a pending handshake before
                // stopping its input.
                if self.is_sub_state(SubState::DRC)
                    && !self.is_sub_state(SubState::FIRST_IPSC)
                    && !self.is_sub_state(SubState::DRC_LAST_BUFFER)
                {
                    error!("drc last flag pkt not received");
                    self.change_state(SessionState::Error);
                }
                if self.domain == Domain::Decoder
                    && self.is_sub_state(SubState::DRAIN)
                    && !self.is_sub_state(SubState::DRAIN_LAST_BUFFER)
                {
                    error!("drain last flag pkt not received");
                    self.change_state(SessionState::Error);
                }
                SubState::INPUT_PAUSE
            }
            Port::Output => SubState::OUTPUT_PAUSE,
        };
        self.change_sub_state(SubState::empty(), set)
    }

    pub fn drain_done(&mut self) -> Result<(), StateError> {
        if self.is_sub_state(SubState::DRAIN) {
            self.change_sub_state(SubState::empty(), SubState::INPUT_PAUSE)
        } else {
            error!("unexpected drain done");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_decoder() -> SessionStateMachine {
        let mut sm = SessionStateMachine::new(Domain::Decoder);
        sm.streamon(Port::Input).unwrap();
        sm.streamon(Port::Output).unwrap();
        assert_eq!(sm.state(), SessionState::Streaming);
        sm
    }

    #[test]
    fn port_mapping() {
        assert_eq!(
            Port::from_hfi(Domain::Decoder, HfiPort::BITSTREAM),
            Some(Port::Input)
        );
        assert_eq!(
            Port::from_hfi(Domain::Encoder, HfiPort::BITSTREAM),
            Some(Port::Output)
        );
        assert_eq!(Port::from_hfi(Domain::Encoder, HfiPort::NONE), None);
        for domain in [Domain::Decoder, Domain::Encoder] {
            for port in [Port::Input, Port::Output] {
                assert_eq!(Port::from_hfi(domain, port.hfi_port(domain)), Some(port));
            }
        }
    }

    #[test]
    fn streamon_streamoff() {
        let mut sm = SessionStateMachine::new(Domain::Decoder);
        assert_eq!(sm.streamon(Port::Input).unwrap(), vec![Command::Start(Port::Input)]);
        assert_eq!(sm.state(), SessionState::InputStreaming);
        assert!(matches!(
            sm.streamon(Port::Input),
            Err(StateError::NotAllowed { .. })
        ));
        sm.streamon(Port::Output).unwrap();
        assert_eq!(sm.state(), SessionState::Streaming);

        sm.streamoff(Port::Input).unwrap();
        assert_eq!(sm.state(), SessionState::OutputStreaming);
        assert_eq!(
            sm.streamoff(Port::Input),
            Err(StateError::NotStreaming(Port::Input))
        );
        assert_eq!(sm.state(), SessionState::OutputStreaming);
        sm.streamoff(Port::Output).unwrap();
        assert_eq!(sm.state(), SessionState::Open);
    }

    #[test]
    fn error_is_terminal() {
        let mut sm = streaming_decoder();
        sm.change_state(SessionState::Error);
        sm.change_state(SessionState::Open);
        assert_eq!(sm.state(), SessionState::Error);
        sm.change_sub_state(SubState::empty(), SubState::DRAIN).unwrap();
        assert!(sm.sub_state().is_empty());
        assert_eq!(sm.allow_qbuf(Port::Output, false), Allow::Disallow);

        // Teardown is still possible.
        sm.streamoff(Port::Output).unwrap();
        assert_eq!(sm.state(), SessionState::Error);
    }

    #[test]
    fn overlapping_sub_state_change() {
        let mut sm = SessionStateMachine::new(Domain::Encoder);
        assert!(matches!(
            sm.change_sub_state(SubState::DRAIN, SubState::DRAIN | SubState::DRC),
            Err(StateError::InvalidSubState { .. })
        ));
        assert!(sm.sub_state().is_empty());
    }

    #[test]
    fn qbuf_decisions() {
        let mut sm = SessionStateMachine::new(Domain::Decoder);
        assert_eq!(sm.allow_qbuf(Port::Input, false), Allow::Defer);
        sm.streamon(Port::Input).unwrap();
        assert_eq!(sm.allow_qbuf(Port::Input, false), Allow::Allow);
        assert_eq!(sm.allow_qbuf(Port::Input, true), Allow::Defer);
        assert_eq!(sm.allow_qbuf(Port::Output, false), Allow::Defer);
        sm.streamon(Port::Output).unwrap();
        assert_eq!(sm.allow_qbuf(Port::Output, false), Allow::Allow);
    }

    #[test]
    fn drain_sequence() {
        let mut sm = SessionStateMachine::new(Domain::Decoder);
        assert_eq!(sm.request_drain(), Ok(Allow::Ignore));

        let mut sm = streaming_decoder();
        assert_eq!(sm.request_drain(), Ok(Allow::Allow));
        assert!(matches!(
            sm.request_drain(),
            Err(StateError::NotAllowed { .. })
        ));
        assert!(sm.drain_last_flag().is_err());
        sm.drain_done().unwrap();
        sm.drain_last_flag().unwrap();
        assert!(sm.drain_last_flag().is_err());
        assert!(sm.is_sub_state(
            SubState::DRAIN
                | SubState::DRAIN_LAST_BUFFER
                | SubState::INPUT_PAUSE
                | SubState::OUTPUT_PAUSE
        ));

        assert_eq!(
            sm.resume().unwrap(),
            vec![
                Command::Resume(Port::Input, ResumeKind::Drain),
                Command::Resume(Port::Output, ResumeKind::Drain),
            ]
        );
        assert!(sm.sub_state().is_empty());
        assert!(sm.resume().is_err());
    }

    #[test]
    fn second_ipsc_is_rejected() {
        let mut sm = streaming_decoder();
        sm.input_psc().unwrap();
        assert!(sm.is_sub_state(SubState::DRC | SubState::INPUT_PAUSE));
        assert!(!sm.is_sub_state(SubState::FIRST_IPSC));
        let before = sm.sub_state();
        assert!(sm.input_psc().is_err());
        assert_eq!(sm.sub_state(), before);
    }

    #[test]
    fn first_ipsc() {
        let mut sm = SessionStateMachine::new(Domain::Decoder);
        sm.streamon(Port::Input).unwrap();
        sm.input_psc().unwrap();
        assert!(sm.is_sub_state(SubState::DRC | SubState::INPUT_PAUSE | SubState::FIRST_IPSC));

        // The firmware stops input without a last flag: fine for a first settings change.
        sm.stop_done(Port::Input).unwrap();
        assert_ne!(sm.state(), SessionState::Error);

        assert_eq!(
            sm.streamon(Port::Output).unwrap(),
            vec![
                Command::QueueInputInternal,
                Command::Resume(Port::Input, ResumeKind::SettingsChange),
                Command::Start(Port::Output),
            ]
        );
        assert_eq!(sm.state(), SessionState::Streaming);
        assert!(sm.sub_state().is_empty());
    }

    #[test]
    fn drc_before_drain() {
        let mut sm = streaming_decoder();
        sm.input_psc().unwrap();
        sm.psc_last_flag().unwrap();
        sm.change_sub_state(
            SubState::empty(),
            SubState::DRAIN | SubState::DRAIN_LAST_BUFFER,
        )
        .unwrap();

        // DRC is resolved first, without resuming ports since a drain is pending.
        assert_eq!(sm.resume().unwrap(), vec![]);
        assert!(!sm.is_sub_state(SubState::DRC));
        assert!(sm.is_sub_state(SubState::DRAIN));

        assert_eq!(
            sm.resume().unwrap(),
            vec![
                Command::Resume(Port::Input, ResumeKind::Drain),
                Command::Resume(Port::Output, ResumeKind::Drain),
            ]
        );
        assert!(sm.sub_state().is_empty());
    }

    #[test]
    fn missing_last_flag_on_stop() {
        let mut sm = streaming_decoder();
        sm.request_drain().unwrap();
        sm.stop_done(Port::Input).unwrap();
        assert_eq!(sm.state(), SessionState::Error);
    }

    #[test]
    fn streamon_input_while_drc_pending_pauses() {
        let mut sm = streaming_decoder();
        sm.input_psc().unwrap();
        sm.psc_last_flag().unwrap();
        sm.streamoff(Port::Input).unwrap();
        sm.change_sub_state(SubState::INPUT_PAUSE, SubState::empty()).unwrap();
        assert_eq!(
            sm.streamon(Port::Input).unwrap(),
            vec![Command::Start(Port::Input), Command::Pause(Port::Input)]
        );
        assert!(sm.is_sub_state(SubState::INPUT_PAUSE));
    }
}
