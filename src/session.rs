// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A session is one conversation with the firmware, for one stream being encoded or decoded.
//!
//! Its mutable state lives in [`SessionInner`], behind the inner lock. Every operation on it
//! borrows the platform collaborators through a [`Context`] for its duration. Operations that
//! need to wait for the firmware are split in two: the first half posts the command and returns a
//! completion receiver, the caller releases the lock and waits, then calls the second half.

use std::collections::HashMap;
use std::sync::mpsc::sync_channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;

use log::debug;
use log::error;
use log::warn;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::buffer::sizes;
use crate::buffer::Buffer;
use crate::buffer::BufferDone;
use crate::buffer::BufferManager;
use crate::buffer::BufferType;
use crate::capability::CapId;
use crate::capability::CapabilityTable;
use crate::error::Result;
use crate::error::VidcError;
use crate::protocol::*;
use crate::state::Allow;
use crate::state::Command;
use crate::state::Port;
use crate::state::SessionState;
use crate::state::SessionStateMachine;
use crate::state::StateError;
use crate::state::SubState;
use crate::Codec;
use crate::Domain;
use crate::HfiTransport;
use crate::VidcEvent;
use crate::VidcEventQueue;
use crate::VidcMemoryAllocator;

/// Platform collaborators borrowed by a session operation.
pub struct Context<'a> {
    pub transport: &'a mut dyn HfiTransport,
    pub allocator: &'a mut dyn VidcMemoryAllocator,
    pub events: &'a mut dyn VidcEventQueue,
}

/// Firmware acknowledgements a client can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    StopInput,
    StopOutput,
    Close,
}

impl Signal {
    pub fn stop(port: Port) -> Self {
        match port {
            Port::Input => Signal::StopInput,
            Port::Output => Signal::StopOutput,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::StopInput => "input stop",
            Signal::StopOutput => "output stop",
            Signal::Close => "close",
        }
    }
}

/// Stream parameters the firmware reports for a port, cached until the next settings change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionParams {
    /// Width in the upper 16 bits, height in the lower ones.
    pub bitstream_resolution: u32,
    pub crop_offsets: [u32; 2],
    pub bit_depth: u32,
    pub coded_frames: u32,
    pub fw_min_count: u32,
    pub pic_order_cnt: u32,
    pub color_info: u32,
    pub profile: u32,
    pub level: u32,
    pub tier: u32,
    pub av1_film_grain_present: u32,
    pub av1_super_block_enabled: u32,
}

impl SubscriptionParams {
    /// Parameters matching the current configuration of `caps`.
    pub fn from_caps(caps: &CapabilityTable) -> Self {
        let value = |id| caps.value(id).max(0) as u32;
        Self {
            bitstream_resolution: (value(CapId::FRAME_WIDTH) << 16)
                | (value(CapId::FRAME_HEIGHT) & 0xffff),
            fw_min_count: value(CapId::MIN_BUFFERS_OUTPUT),
            pic_order_cnt: value(CapId::POC),
            profile: value(CapId::PROFILE),
            level: value(CapId::LEVEL),
            ..Default::default()
        }
    }

    pub fn width(&self) -> u32 {
        self.bitstream_resolution >> 16
    }

    pub fn height(&self) -> u32 {
        self.bitstream_resolution & 0xffff
    }
}

/// What the firmware reported about the frame of the current response batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub picture_type: u32,
    pub no_output: bool,
    pub subframe_input: u32,
    pub compression_ratio: u32,
    pub complexity_factor: u32,
    pub data_corrupt: bool,
    pub overflow: bool,
    pub fence_ids: Vec<u64>,
}

pub struct SessionInner {
    id: u32,
    pub sm: SessionStateMachine,
    pub caps: CapabilityTable,
    pub buffers: BufferManager,
    /// Indexed by [`Port::index`].
    pub subscription: [SubscriptionParams; 2],
    pub frame_info: FrameInfo,
    pub has_bframe: bool,
    /// Last fence signalled or destroyed.
    pub prev_fence_id: u64,
    /// Fences received and not yet accounted to an output buffer.
    pub fences_received: u32,
    /// Reference buffers last reported by the firmware.
    pub dpb_list: Vec<u64>,
    header_id: u32,
    completions: HashMap<Signal, SyncSender<()>>,
}

fn data_type(port: Port) -> BufferType {
    match port {
        Port::Input => BufferType::Input,
        Port::Output => BufferType::Output,
    }
}

impl SessionInner {
    pub fn new(id: u32, domain: Domain, codec: Codec) -> Self {
        Self {
            id,
            sm: SessionStateMachine::new(domain),
            caps: CapabilityTable::new(domain, codec),
            buffers: BufferManager::new(domain),
            subscription: Default::default(),
            frame_info: Default::default(),
            has_bframe: false,
            prev_fence_id: 0,
            fences_received: 0,
            dpb_list: Vec::new(),
            header_id: 0,
            completions: HashMap::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn domain(&self) -> Domain {
        self.caps.domain()
    }

    /// Port whose stream the capabilities describe: the bitstream side of the session.
    pub fn control_port(&self) -> Port {
        match self.domain() {
            Domain::Decoder => Port::Input,
            Domain::Encoder => Port::Output,
        }
    }

    pub fn meta_enabled(&self, port: Port) -> bool {
        let id = match port {
            Port::Input => CapId::INPUT_META_ENABLE,
            Port::Output => CapId::OUTPUT_META_ENABLE,
        };
        self.caps.value(id) != 0
    }

    /// Number of fences the firmware returns with every output buffer.
    pub fn fences_per_output(&self) -> u32 {
        if self.caps.value(CapId::EARLY_NOTIFY_ENABLE) != 0 {
            self.caps.value(CapId::EARLY_NOTIFY_FENCE_COUNT).max(0) as u32
        } else if self.caps.value(CapId::META_OUTBUF_FENCE) != 0 {
            1
        } else {
            0
        }
    }

    fn meta_flags(&self) -> [bool; 2] {
        [
            self.meta_enabled(Port::Input),
            self.meta_enabled(Port::Output),
        ]
    }

    fn secure(&self) -> bool {
        self.caps.value(CapId::SECURE_MODE) != 0
    }

    /// Moves the session to `Error` for good.
    pub fn force_error(&mut self, reason: &str) {
        if !self.sm.is_error() {
            error!("session {}: {}", self.id, reason);
        }
        self.sm.change_state(SessionState::Error);
    }

    /// Registers interest in `signal` and returns the receiver to wait on.
    pub fn expect(&mut self, signal: Signal) -> Receiver<()> {
        let (tx, rx) = sync_channel(1);
        self.completions.insert(signal, tx);
        rx
    }

    /// Wakes up whoever waits for `signal`.
    pub fn signal(&mut self, signal: Signal) {
        match self.completions.remove(&signal) {
            Some(tx) => {
                let _ = tx.try_send(());
            }
            None => warn!("session {}: unexpected {} completion", self.id, signal.name()),
        }
    }

    pub fn cancel(&mut self, signal: Signal) {
        self.completions.remove(&signal);
    }

    /// Wakes every waiter with an error.
    pub fn cancel_all(&mut self) {
        self.completions.clear();
    }

    pub fn send_buffer_done(&self, done: Vec<BufferDone>, ctx: &mut Context) {
        for buffer in done {
            ctx.events.send_event(VidcEvent::BufferDone {
                session_id: self.id,
                buffer,
            });
        }
    }

    /// Opens the session on the firmware side. Fails if the capability graph is invalid.
    pub fn open(&mut self, ctx: &mut Context) -> Result<()> {
        self.caps.build_dependency_order()?;
        self.caps.adjust_all()?;
        let mut sender = CommandSender::new(self.id, &mut self.header_id, &mut *ctx.transport);
        sender.command(
            HFI_CMD_OPEN,
            HfiPort::NONE,
            Some((HfiPayloadType::U32, self.id)),
        )?;
        debug!("session {}: opened", self.id);
        Ok(())
    }

    /// Sends every capability changed since the last call.
    fn post_properties(&mut self, ctx: &mut Context) -> Result<()> {
        let packets = self.caps.set_all_dirty()?;
        let mut sender = CommandSender::new(self.id, &mut self.header_id, &mut *ctx.transport);
        let mut writer = sender.writer();
        for p in &packets {
            writer.add_u32(p.hfi_id, p.port, p.payload_type, p.value)?;
        }
        sender.send(writer)?;
        Ok(())
    }

    /// Sizes the buffers of `port` and (re)allocates and queues the internal ones that no longer
    /// fit.
    fn setup_buffers(&mut self, port: Port, ctx: &mut Context) -> Result<()> {
        let domain = self.domain();
        let secure = self.secure();
        let data = data_type(port);
        for buffer_type in [Some(data), data.meta()].into_iter().flatten() {
            let req = sizes::requirement(&self.caps, buffer_type);
            self.buffers.compute_requirements(buffer_type, req);
        }

        let mut sender = CommandSender::new(self.id, &mut self.header_id, &mut *ctx.transport);
        for buffer_type in BufferType::INTERNAL {
            if buffer_type.port(domain) != port {
                continue;
            }
            let req = sizes::requirement(&self.caps, buffer_type);
            if self.buffers.compute_requirements(buffer_type, req) {
                continue;
            }
            self.buffers.release(buffer_type, &mut sender)?;
            self.buffers
                .allocate(buffer_type, &mut *ctx.allocator, secure)?;
            self.buffers.queue_internal(buffer_type, &mut sender)?;
        }
        Ok(())
    }

    fn execute(&mut self, commands: &[Command], ctx: &mut Context) -> Result<()> {
        let domain = self.domain();
        for command in commands {
            debug!("session {}: {:?}", self.id, command);
            let mut sender = CommandSender::new(self.id, &mut self.header_id, &mut *ctx.transport);
            match *command {
                Command::Start(port) => {
                    sender.command(HFI_CMD_START, port.hfi_port(domain), None)?;
                }
                Command::Pause(port) => {
                    sender.command(HFI_CMD_PAUSE, port.hfi_port(domain), None)?;
                }
                Command::Resume(port, _) => {
                    sender.command(HFI_CMD_RESUME, port.hfi_port(domain), None)?;
                }
                Command::QueueInputInternal => {
                    self.setup_buffers(Port::Input, ctx)?;
                    self.caps.adjust(CapId::STAGE, None)?;
                    self.caps.adjust(CapId::PIPE, None)?;
                    self.post_properties(ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Queues the deferred buffers of every port that accepts buffers.
    fn queue_deferred(&mut self, ctx: &mut Context) -> Result<()> {
        let meta = self.meta_flags();
        let mut sender = CommandSender::new(self.id, &mut self.header_id, &mut *ctx.transport);
        for port in [Port::Input, Port::Output] {
            if self.sm.allow_qbuf(port, false) != Allow::Allow {
                continue;
            }
            self.buffers.queue_deferred(
                data_type(port),
                &self.sm,
                meta[port.index()],
                &mut sender,
            )?;
        }
        Ok(())
    }

    pub fn streamon(&mut self, port: Port, ctx: &mut Context) -> Result<()> {
        if !self.sm.allow_streamon(port) {
            return Err(StateError::NotAllowed {
                action: "streamon",
                state: self.sm.state(),
                sub_state: self.sm.sub_state(),
            }
            .into());
        }

        if port == self.control_port() {
            self.caps.adjust_all()?;
            self.post_properties(ctx)?;
        }
        self.setup_buffers(port, ctx)?;

        let commands = self.sm.streamon(port)?;
        self.execute(&commands, ctx)?;
        if port == self.control_port() {
            self.caps.set_streaming(true);
        }
        self.queue_deferred(ctx)
    }

    /// Takes a buffer from the client, and queues it to the firmware or defers it depending on
    /// the session state.
    pub fn qbuf(&mut self, buf: Buffer, ctx: &mut Context) -> Result<()> {
        let domain = self.domain();
        let buffer_type = buf.buffer_type;
        let port = buffer_type.port(domain);

        match self.sm.allow_qbuf(port, buffer_type.is_meta()) {
            Allow::Disallow => {
                return Err(VidcError::LocalValidation(format!(
                    "qbuf not allowed in state {:?}",
                    self.sm.state()
                )))
            }
            Allow::Ignore => return Ok(()),
            Allow::Defer => {
                let id = self.buffers.add_external(buf)?;
                self.buffers.defer(id)?;
            }
            Allow::Allow => {
                let id = self.buffers.add_external(buf)?;
                let meta = self.meta_enabled(port);
                let mut sender =
                    CommandSender::new(self.id, &mut self.header_id, &mut *ctx.transport);
                if let Err(e) = self.buffers.enqueue(id, &self.sm, meta, &mut sender) {
                    self.buffers.discard(id);
                    return Err(e.into());
                }
            }
        }

        if domain == Domain::Decoder && buffer_type == BufferType::Output {
            let mut sender = CommandSender::new(self.id, &mut self.header_id, &mut *ctx.transport);
            self.buffers.release_nonref(&self.dpb_list, &mut sender)?;
        }
        Ok(())
    }

    /// Asks the firmware to output every pending frame. Does not wait: the firmware needs output
    /// buffers from the client to complete the drain.
    pub fn drain(&mut self, ctx: &mut Context) -> Result<()> {
        match self.sm.request_drain()? {
            Allow::Allow => {
                let port = Port::Input.hfi_port(self.domain());
                let mut sender =
                    CommandSender::new(self.id, &mut self.header_id, &mut *ctx.transport);
                sender.command(HFI_CMD_DRAIN, port, None)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Resumes the session after a drain or a settings change completed.
    pub fn resume(&mut self, ctx: &mut Context) -> Result<()> {
        let commands = self.sm.resume()?;
        self.execute(&commands, ctx)?;
        self.queue_deferred(ctx)
    }

    pub fn set_control(&mut self, id: CapId, value: i32, ctx: &mut Context) -> Result<()> {
        if self.sm.is_error() {
            return Err(VidcError::LocalValidation("session is in error".into()));
        }
        self.caps.set_control(id, value)?;
        if self.sm.is_streaming(self.control_port()) {
            self.post_properties(ctx)?;
        }
        Ok(())
    }

    /// Posts a stop for `port`. Returns the completion to wait for, or `None` if the firmware
    /// cannot be talked to anymore.
    pub fn begin_stop(
        &mut self,
        port: Port,
        ctx: &mut Context,
    ) -> Result<Option<(Signal, Receiver<()>)>> {
        if !self.sm.is_streaming(port) {
            return Err(StateError::NotStreaming(port).into());
        }
        if self.sm.is_error() {
            return Ok(None);
        }
        let signal = Signal::stop(port);
        let rx = self.expect(signal);
        let hfi_port = port.hfi_port(self.domain());
        let mut sender = CommandSender::new(self.id, &mut self.header_id, &mut *ctx.transport);
        if let Err(e) = sender.command(HFI_CMD_STOP, hfi_port, None) {
            self.cancel(signal);
            return Err(e.into());
        }
        Ok(Some((signal, rx)))
    }

    /// Completes a stream off once the firmware stopped `port`, or gave up on it. Every buffer
    /// of the port still pending is returned to the client.
    pub fn finish_stop(&mut self, port: Port, ctx: &mut Context) -> Result<()> {
        self.sm.streamoff(port)?;
        if port == self.control_port() {
            self.caps.set_streaming(false);
        }
        let done = self.buffers.flush(port, self.sm.is_error());
        self.send_buffer_done(done, ctx);
        Ok(())
    }

    /// Returns every client buffer and posts a close. Returns the completion to wait for, or
    /// `None` if the firmware cannot be talked to anymore.
    pub fn begin_close(&mut self, ctx: &mut Context) -> Result<Option<(Signal, Receiver<()>)>> {
        let error = self.sm.is_error();
        for port in [Port::Input, Port::Output] {
            let done = self.buffers.flush(port, error);
            self.send_buffer_done(done, ctx);
        }
        if error {
            return Ok(None);
        }
        let rx = self.expect(Signal::Close);
        let mut sender = CommandSender::new(self.id, &mut self.header_id, &mut *ctx.transport);
        if let Err(e) = sender.command(HFI_CMD_CLOSE, HfiPort::NONE, None) {
            self.cancel(Signal::Close);
            return Err(e.into());
        }
        Ok(Some((Signal::Close, rx)))
    }

    /// Frees everything the session still holds.
    pub fn finish_close(&mut self, ctx: &mut Context) {
        self.buffers.destroy_all(&mut *ctx.allocator);
        self.cancel_all();
        self.sm.change_state(SessionState::Close);
        debug!("session {}: closed", self.id);
    }

    /// Handles an input port settings change reported by the decoder firmware.
    pub fn input_psc(&mut self, ctx: &mut Context) -> Result<()> {
        self.sm.input_psc()?;

        let params = self.subscription[Port::Input.index()];
        let updates = [
            (CapId::FRAME_WIDTH, params.width()),
            (CapId::FRAME_HEIGHT, params.height()),
            (CapId::MIN_BUFFERS_OUTPUT, params.fw_min_count),
            (CapId::PROFILE, params.profile),
            (CapId::LEVEL, params.level),
            (CapId::POC, params.pic_order_cnt),
        ];
        for (id, value) in updates {
            let prev = self.caps.value(id);
            self.caps.update_from_firmware(id, value as i32);
            let changed = self.caps.value(id) != prev;
            self.caps.propagate(id, changed)?;
        }
        // The fence count depends on the new frame height even if the line count did not move.
        self.caps
            .propagate(CapId::EARLY_NOTIFY_LINE_COUNT, false)?;

        for buffer_type in [BufferType::Output, BufferType::OutputMeta] {
            let req = sizes::requirement(&self.caps, buffer_type);
            self.buffers.compute_requirements(buffer_type, req);
        }

        let width = self.caps.value(CapId::FRAME_WIDTH).max(0) as u32;
        let height = self.caps.value(CapId::FRAME_HEIGHT).max(0) as u32;
        debug!(
            "session {}: input settings change to {}x{}, {} output buffers",
            self.id, width, height, params.fw_min_count
        );
        ctx.events.send_event(VidcEvent::SettingsChanged {
            session_id: self.id,
            width,
            height,
            min_output_count: self.buffers.pool(BufferType::Output).min_count,
        });
        Ok(())
    }

    /// Returns whether `sub_state` is fully set.
    pub fn is_sub_state(&self, sub_state: SubState) -> bool {
        self.sm.is_sub_state(sub_state)
    }
}

/// A session as shared between its client and the response worker.
pub struct Session {
    id: u32,
    domain: Domain,
    codec: Codec,
    /// Serializes client requests, including across the blocking waits.
    pub(crate) client_lock: Mutex<()>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: u32, domain: Domain, codec: Codec) -> Self {
        Self {
            id,
            domain,
            codec,
            client_lock: Mutex::new(()),
            inner: Mutex::new(SessionInner::new(id, domain, codec)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Takes the inner lock.
    pub fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().sm.state()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::MemoryHandle;
    use crate::RegionKind;

    /// Records every message posted to the firmware.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub messages: Vec<Vec<u8>>,
        pub resets: usize,
    }

    impl HfiTransport for RecordingTransport {
        fn post(&mut self, message: &[u8]) -> std::result::Result<(), i32> {
            self.messages.push(message.to_vec());
            Ok(())
        }

        fn reset(&mut self) -> std::result::Result<(), i32> {
            self.resets += 1;
            Ok(())
        }
    }

    impl RecordingTransport {
        /// Types of every packet posted, in order.
        pub fn packet_types(&self) -> Vec<u32> {
            self.messages
                .iter()
                .flat_map(|m| {
                    parse_response(m)
                        .map(|(_, packets)| {
                            packets
                                .iter()
                                .map(|p| p.header.pkt_type)
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default()
                })
                .collect()
        }

        /// Buffer descriptors posted, with the port they were posted on.
        pub fn buffers(&self) -> Vec<(HfiPort, HfiBuffer)> {
            let mut out = Vec::new();
            for m in &self.messages {
                let Ok((_, packets)) = parse_response(m) else {
                    continue;
                };
                for p in packets {
                    if p.header.pkt_type != HFI_CMD_BUFFER {
                        continue;
                    }
                    if let (Some(port), Ok(buf)) = (HfiPort::n(p.header.port), p.read_buffer()) {
                        out.push((port, buf));
                    }
                }
            }
            out
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingAllocator {
        next_addr: u64,
        pub live: usize,
    }

    impl VidcMemoryAllocator for CountingAllocator {
        fn alloc(
            &mut self,
            size: u32,
            region: RegionKind,
        ) -> std::result::Result<MemoryHandle, i32> {
            self.live += 1;
            self.next_addr += 0x100_0000;
            Ok(MemoryHandle {
                id: self.next_addr,
                size,
                region,
            })
        }

        fn map(&mut self, handle: &MemoryHandle) -> std::result::Result<u64, i32> {
            Ok(handle.id)
        }

        fn unmap(&mut self, _: &MemoryHandle) -> std::result::Result<(), i32> {
            Ok(())
        }

        fn free(&mut self, _: MemoryHandle) {
            self.live -= 1;
        }
    }

    #[derive(Default)]
    pub(crate) struct CollectingEvents {
        pub events: Vec<VidcEvent>,
    }

    impl VidcEventQueue for CollectingEvents {
        fn send_event(&mut self, event: VidcEvent) {
            self.events.push(event);
        }
    }

    #[derive(Default)]
    pub(crate) struct Collaborators {
        pub transport: RecordingTransport,
        pub allocator: CountingAllocator,
        pub events: CollectingEvents,
    }

    impl Collaborators {
        pub fn context(&mut self) -> Context<'_> {
            Context {
                transport: &mut self.transport,
                allocator: &mut self.allocator,
                events: &mut self.events,
            }
        }
    }

    /// Builds a firmware response for `session_id` made of `packets`.
    pub(crate) fn response(
        session_id: u32,
        packets: &[(u32, HfiPacketFlags, HfiPort, HfiPayloadType, Vec<u8>)],
    ) -> Vec<u8> {
        let mut writer = PacketWriter::new(session_id, 0);
        for (pkt_type, flags, port, payload_type, payload) in packets {
            writer
                .add_packet(*pkt_type, *flags, *port, *payload_type, payload)
                .unwrap();
        }
        writer.finish().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn opened(domain: Domain, codec: Codec, collab: &mut Collaborators) -> SessionInner {
        let mut inner = SessionInner::new(3, domain, codec);
        inner.open(&mut collab.context()).unwrap();
        inner
    }

    #[test]
    fn open_posts_open() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut collab = Collaborators::default();
        let inner = opened(Domain::Decoder, Codec::H264, &mut collab);
        assert_eq!(collab.transport.packet_types(), vec![HFI_CMD_OPEN]);
        let (header, _) = parse_response(&collab.transport.messages[0]).unwrap();
        assert_eq!(header.session_id, inner.id());
        assert_eq!(inner.sm.state(), SessionState::Open);
    }

    #[test]
    fn decoder_streamon_input() {
        let mut collab = Collaborators::default();
        let mut inner = opened(Domain::Decoder, Codec::H264, &mut collab);

        // Buffers queued before streaming are deferred.
        inner
            .qbuf(
                Buffer::new(BufferType::Input, 0, 0x4000, 4096),
                &mut collab.context(),
            )
            .unwrap();
        assert_eq!(collab.transport.buffers().len(), 0);

        inner
            .streamon(Port::Input, &mut collab.context())
            .unwrap();
        assert_eq!(inner.sm.state(), SessionState::InputStreaming);

        let types = collab.transport.packet_types();
        // Properties go before the internal buffers, which go before the start.
        let first_prop = types
            .iter()
            .position(|t| hfi_range(*t) == HFI_PROP_BEGIN)
            .unwrap();
        let first_buf = types.iter().position(|t| *t == HFI_CMD_BUFFER).unwrap();
        let start = types.iter().position(|t| *t == HFI_CMD_START).unwrap();
        assert!(first_prop < first_buf && first_buf < start);

        // BIN, COMV, NON_COMV, LINE and PERSIST for an H.264 decoder, then the deferred input.
        let buffers = collab.transport.buffers();
        let internal: Vec<u32> = buffers[..buffers.len() - 1]
            .iter()
            .map(|(_, b)| b.buffer_type)
            .collect();
        assert_eq!(
            internal,
            vec![
                HfiBufferType::BIN as u32,
                HfiBufferType::COMV as u32,
                HfiBufferType::NON_COMV as u32,
                HfiBufferType::LINE as u32,
                HfiBufferType::PERSIST as u32,
            ]
        );
        let persist = buffers
            .iter()
            .find(|(_, b)| b.buffer_type == HfiBufferType::PERSIST as u32)
            .unwrap();
        assert_eq!(persist.0, HfiPort::NONE);
        let (port, input) = buffers.last().unwrap();
        assert_eq!(*port, HfiPort::BITSTREAM);
        assert_eq!(input.buffer_type, HfiBufferType::BITSTREAM as u32);
        assert_eq!(collab.allocator.live, 5);

        // Not allowed twice.
        assert!(matches!(
            inner.streamon(Port::Input, &mut collab.context()),
            Err(VidcError::LocalValidation(_))
        ));
    }

    #[test]
    fn qbuf_rejected_in_error() {
        let mut collab = Collaborators::default();
        let mut inner = opened(Domain::Encoder, Codec::Hevc, &mut collab);
        inner.force_error("test");
        assert!(matches!(
            inner.qbuf(
                Buffer::new(BufferType::Input, 0, 0x4000, 4096),
                &mut collab.context()
            ),
            Err(VidcError::LocalValidation(_))
        ));
        assert_eq!(inner.buffers.buffers(BufferType::Input).count(), 0);
    }

    #[test]
    fn drain_requires_input_streaming() {
        let mut collab = Collaborators::default();
        let mut inner = opened(Domain::Decoder, Codec::Vp9, &mut collab);
        // Nothing to drain yet.
        inner.drain(&mut collab.context()).unwrap();
        assert!(!inner.is_sub_state(SubState::DRAIN));

        inner
            .streamon(Port::Input, &mut collab.context())
            .unwrap();
        inner.drain(&mut collab.context()).unwrap();
        assert!(inner.is_sub_state(SubState::DRAIN));
        assert_eq!(collab.transport.packet_types().last(), Some(&HFI_CMD_DRAIN));
        // Already draining.
        assert!(inner.drain(&mut collab.context()).is_err());
    }

    #[test]
    fn dynamic_controls_are_posted() {
        let mut collab = Collaborators::default();
        let mut inner = opened(Domain::Encoder, Codec::H264, &mut collab);
        inner
            .set_control(CapId::BIT_RATE, 2_000_000, &mut collab.context())
            .unwrap();
        // Stored until streaming starts.
        assert_eq!(collab.transport.messages.len(), 1);

        inner
            .streamon(Port::Output, &mut collab.context())
            .unwrap();
        let sent = collab.transport.messages.len();
        inner
            .set_control(CapId::BIT_RATE, 4_000_000, &mut collab.context())
            .unwrap();
        assert_eq!(collab.transport.messages.len(), sent + 1);
        let (_, packets) = parse_response(collab.transport.messages.last().unwrap()).unwrap();
        assert!(packets
            .iter()
            .any(|p| p.header.pkt_type == HFI_PROP_TOTAL_BITRATE));

        assert!(matches!(
            inner.set_control(CapId::PROFILE, 0, &mut collab.context()),
            Err(VidcError::LocalValidation(_))
        ));
    }

    #[test]
    fn stop_and_close() {
        let mut collab = Collaborators::default();
        let mut inner = opened(Domain::Encoder, Codec::H264, &mut collab);
        assert!(matches!(
            inner.begin_stop(Port::Input, &mut collab.context()),
            Err(VidcError::LocalValidation(_))
        ));

        inner
            .streamon(Port::Input, &mut collab.context())
            .unwrap();
        inner
            .qbuf(
                Buffer::new(BufferType::Input, 0, 0x4000, 4096),
                &mut collab.context(),
            )
            .unwrap();
        let (signal, rx) = inner
            .begin_stop(Port::Input, &mut collab.context())
            .unwrap()
            .unwrap();
        assert_eq!(signal, Signal::StopInput);
        inner.signal(signal);
        rx.try_recv().unwrap();
        inner
            .finish_stop(Port::Input, &mut collab.context())
            .unwrap();
        assert_eq!(inner.sm.state(), SessionState::Open);
        assert!(matches!(
            collab.events.events.as_slice(),
            [VidcEvent::BufferDone { buffer, .. }] if buffer.data_size == 0
        ));

        let (_, rx) = inner
            .begin_close(&mut collab.context())
            .unwrap()
            .unwrap();
        inner.cancel_all();
        assert!(rx.recv().is_err());
        inner.finish_close(&mut collab.context());
        assert_eq!(inner.sm.state(), SessionState::Close);
        assert_eq!(collab.allocator.live, 0);
    }
}
