// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The core: owner of the connection with the firmware and of the list of open sessions.
//!
//! Client requests enter through [`Core`] methods taking the [`Session`] they target. Firmware
//! responses enter through [`Core::handle_response`], called by the platform's response worker.
//!
//! Locks are always taken in the same order: a session's client lock, then its inner lock, then
//! the collaborators, then the core lock. The core lock only guards the session list and the core
//! state, and no other lock is acquired while it is held.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context as _;
use log::debug;
use log::error;
use log::warn;
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::capability::CapId;
use crate::error::Result;
use crate::error::VidcError;
use crate::protocol::*;
use crate::response;
use crate::response::SystemEvent;
use crate::session::Context;
use crate::session::Session;
use crate::session::SessionInner;
use crate::session::Signal;
use crate::state::Port;
use crate::Codec;
use crate::Domain;
use crate::HfiTransport;
use crate::VidcEventQueue;
use crate::VidcMemoryAllocator;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How long to wait for the firmware to acknowledge a blocking command.
    pub hw_response_timeout: Duration,
    /// Maximum number of sessions open at the same time.
    pub max_sessions: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            hw_response_timeout: Duration::from_millis(1000),
            max_sessions: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Deinit,
    /// Init posted, waiting for the firmware to complete it.
    InitWait,
    Init,
}

struct CoreInner {
    state: CoreState,
    sessions: HashMap<u32, Weak<Session>>,
    next_session_id: u32,
    image_version: Option<String>,
}

struct Collaborators<T, M, Q> {
    transport: T,
    allocator: M,
    events: Q,
    /// Header ids of system commands.
    header_id: u32,
}

impl<T: HfiTransport, M: VidcMemoryAllocator, Q: VidcEventQueue> Collaborators<T, M, Q> {
    fn context(&mut self) -> Context<'_> {
        Context {
            transport: &mut self.transport,
            allocator: &mut self.allocator,
            events: &mut self.events,
        }
    }

    fn post_init(&mut self) -> Result<()> {
        let mut sender = CommandSender::new(0, &mut self.header_id, &mut self.transport);
        sender.command(HFI_CMD_INIT, HfiPort::NONE, None)?;
        Ok(())
    }
}

pub struct Core<T, M, Q> {
    config: CoreConfig,
    inner: Mutex<CoreInner>,
    collaborators: Mutex<Collaborators<T, M, Q>>,
}

impl<T, M, Q> Core<T, M, Q>
where
    T: HfiTransport,
    M: VidcMemoryAllocator,
    Q: VidcEventQueue,
{
    pub fn new(config: CoreConfig, transport: T, allocator: M, events: Q) -> Self {
        Self {
            config,
            inner: Mutex::new(CoreInner {
                state: CoreState::Deinit,
                sessions: HashMap::new(),
                next_session_id: 1,
                image_version: None,
            }),
            collaborators: Mutex::new(Collaborators {
                transport,
                allocator,
                events,
                header_id: 0,
            }),
        }
    }

    /// Starts the firmware. Sessions can be opened right away, the firmware processes commands
    /// in order.
    pub fn init(&self) -> Result<()> {
        self.inner.lock().state = CoreState::InitWait;
        self.collaborators.lock().post_init()
    }

    pub fn state(&self) -> CoreState {
        self.inner.lock().state
    }

    /// Version string reported by the firmware, once known.
    pub fn image_version(&self) -> Option<String> {
        self.inner.lock().image_version.clone()
    }

    pub fn open_session(&self, domain: Domain, codec: Codec) -> Result<Arc<Session>> {
        let session = {
            let mut core = self.inner.lock();
            if core.state == CoreState::Deinit {
                return Err(VidcError::LocalValidation("core is not initialized".into()));
            }
            core.sessions.retain(|_, s| s.strong_count() > 0);
            if core.sessions.len() >= self.config.max_sessions {
                return Err(VidcError::LocalValidation(format!(
                    "too many sessions ({})",
                    core.sessions.len()
                )));
            }
            let id = core.next_session_id;
            core.next_session_id = core.next_session_id.wrapping_add(1).max(1);
            let session = Arc::new(Session::new(id, domain, codec));
            core.sessions.insert(id, Arc::downgrade(&session));
            session
        };

        let res = self.with_session(&session, |inner, ctx| inner.open(ctx));
        if let Err(e) = res {
            error!("failed to open session {}: {:#}", session.id(), e);
            self.inner.lock().sessions.remove(&session.id());
            return Err(e);
        }
        debug!(
            "session {} opened: {:?} {:?}",
            session.id(),
            domain,
            codec
        );
        Ok(session)
    }

    /// Looks up an open session. Fails once the session has been closed or dropped.
    pub fn session(&self, id: u32) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(&id).and_then(Weak::upgrade)
    }

    fn with_session<R>(
        &self,
        session: &Session,
        f: impl FnOnce(&mut SessionInner, &mut Context) -> Result<R>,
    ) -> Result<R> {
        let mut inner = session.lock();
        let mut collaborators = self.collaborators.lock();
        f(&mut inner, &mut collaborators.context())
    }

    pub fn streamon(&self, session: &Session, port: Port) -> Result<()> {
        let _client = session.client_lock.lock();
        self.with_session(session, |inner, ctx| inner.streamon(port, ctx))
    }

    /// Stops `port` and returns all its pending buffers. The buffers are returned even if the
    /// firmware does not acknowledge the stop.
    pub fn streamoff(&self, session: &Session, port: Port) -> Result<()> {
        let _client = session.client_lock.lock();
        let pending = self.with_session(session, |inner, ctx| inner.begin_stop(port, ctx))?;
        let res = match pending {
            Some((signal, rx)) => self.wait(session, signal, rx),
            None => Ok(()),
        };
        self.with_session(session, |inner, ctx| inner.finish_stop(port, ctx))?;
        res
    }

    pub fn qbuf(&self, session: &Session, buffer: Buffer) -> Result<()> {
        let _client = session.client_lock.lock();
        self.with_session(session, |inner, ctx| inner.qbuf(buffer, ctx))
    }

    pub fn drain(&self, session: &Session) -> Result<()> {
        let _client = session.client_lock.lock();
        self.with_session(session, |inner, ctx| inner.drain(ctx))
    }

    pub fn resume(&self, session: &Session) -> Result<()> {
        let _client = session.client_lock.lock();
        self.with_session(session, |inner, ctx| inner.resume(ctx))
    }

    pub fn set_control(&self, session: &Session, id: CapId, value: i32) -> Result<()> {
        let _client = session.client_lock.lock();
        self.with_session(session, |inner, ctx| inner.set_control(id, value, ctx))
    }

    /// Closes `session`. Its resources are freed even if the firmware does not acknowledge the
    /// close.
    pub fn close(&self, session: &Session) -> Result<()> {
        let _client = session.client_lock.lock();
        let res = match self.with_session(session, |inner, ctx| inner.begin_close(ctx)) {
            Ok(Some((signal, rx))) => self.wait(session, signal, rx),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        {
            let mut inner = session.lock();
            let mut collaborators = self.collaborators.lock();
            inner.finish_close(&mut collaborators.context());
        }
        self.inner.lock().sessions.remove(&session.id());
        res
    }

    /// Waits for the firmware to acknowledge `signal`. No lock may be held.
    fn wait(&self, session: &Session, signal: Signal, rx: Receiver<()>) -> Result<()> {
        match rx.recv_timeout(self.config.hw_response_timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                {
                    let mut inner = session.lock();
                    inner.cancel(signal);
                    inner.force_error(&format!("timed out waiting for {}", signal.name()));
                }
                self.deinit_and_reinit(Some(session.id()));
                Err(VidcError::Timeout(signal.name()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(
                    "session {}: {} abandoned after an error",
                    session.id(),
                    signal.name()
                );
                Err(VidcError::Session(HFI_ERROR_FATAL))
            }
        }
    }

    /// Gives up on the firmware: every session is moved to `Error` and its waiters woken up,
    /// then the connection is reset and the firmware initialized again.
    fn deinit_and_reinit(&self, timed_out: Option<u32>) {
        let sessions: Vec<Arc<Session>> = {
            let mut core = self.inner.lock();
            if let Some(id) = timed_out {
                if !core.sessions.contains_key(&id) {
                    warn!("session {} is no longer open", id);
                }
            }
            core.state = CoreState::Deinit;
            core.sessions.values().filter_map(Weak::upgrade).collect()
        };

        for session in sessions {
            let mut inner = session.lock();
            inner.force_error("firmware is being reset");
            inner.cancel_all();
            self.collaborators
                .lock()
                .events
                .send_error(session.id(), libc::EIO);
        }

        let mut collaborators = self.collaborators.lock();
        if let Err(e) = collaborators.transport.reset() {
            error!("failed to reset the firmware connection: errno {}", e);
        }
        self.inner.lock().state = CoreState::InitWait;
        if let Err(e) = collaborators.post_init() {
            error!("failed to reinitialize the firmware: {:#}", e);
            self.inner.lock().state = CoreState::Deinit;
        }
    }

    /// Processes a response received from the firmware.
    pub fn handle_response(&self, bytes: &[u8]) {
        if let Err(e) = self.process_response(bytes) {
            error!("failed to process firmware response: {:#}", e);
            self.deinit_and_reinit(None);
        }
    }

    fn process_response(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let (header, packets) =
            parse_response(bytes).context("while validating a firmware response")?;

        if header.session_id == 0 {
            return self
                .handle_system_response(&packets)
                .context("while processing a system response");
        }

        let Some(session) = self.session(header.session_id) else {
            warn!("dropping response for unknown session {}", header.session_id);
            return Ok(());
        };
        let mut inner = session.lock();
        let mut collaborators = self.collaborators.lock();
        response::dispatch(&mut inner, &packets, &mut collaborators.context());
        Ok(())
    }

    fn handle_system_response(&self, packets: &[ResponsePacket]) -> anyhow::Result<()> {
        for event in response::system_events(packets) {
            match event {
                SystemEvent::InitDone => {
                    debug!("firmware initialized");
                    self.inner.lock().state = CoreState::Init;
                }
                SystemEvent::ImageVersion(version) => {
                    debug!("firmware image version: {}", version);
                    self.inner.lock().image_version = Some(version);
                }
                SystemEvent::Error(pkt_type) => {
                    return Err(anyhow!("system error {:#x}", pkt_type));
                }
                SystemEvent::Unhandled(pkt_type) => {
                    warn!("unhandled system packet {:#x}", pkt_type)
                }
            }
        }
        Ok(())
    }
}
