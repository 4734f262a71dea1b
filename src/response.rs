// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Handling of the responses sent by the firmware.
//!
//! A response is a batch of packets. System responses (session id 0) are turned into
//! [`SystemEvent`]s for the core to act upon. Session responses are dispatched to the session
//! they target with [`dispatch`], which processes their packets by range: session errors first,
//! then information, properties, and finally commands. Within a range packets keep the order in
//! which they arrived.

use log::debug;
use log::error;
use log::warn;

use crate::buffer::BufferFlags;
use crate::buffer::BufferType;
use crate::capability::CapId;
use crate::capability::ENTROPY_CABAC;
use crate::capability::ENTROPY_CAVLC;
use crate::capability::MAX_FENCE_COUNT;
use crate::error::Result;
use crate::error::VidcError;
use crate::protocol::*;
use crate::session::Context;
use crate::session::SessionInner;
use crate::session::Signal;
use crate::session::SubscriptionParams;
use crate::state::Port;
use crate::state::SessionState;
use crate::Domain;
use crate::VidcEvent;

/// What the core must do after a system response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    /// The firmware completed its initialization.
    InitDone,
    ImageVersion(String),
    /// The firmware hit a fatal error and must be restarted.
    Error(u32),
    Unhandled(u32),
}

/// Interprets the packets of a system response. Processing stops at the first system error.
pub fn system_events(packets: &[ResponsePacket]) -> Vec<SystemEvent> {
    let mut events = Vec::new();
    for pkt in packets {
        let pkt_type = pkt.header.pkt_type;
        if pkt.header.flags().contains(HfiPacketFlags::SYSTEM_ERROR)
            || hfi_range(pkt_type) == HFI_SYSTEM_ERROR_BEGIN
        {
            events.push(SystemEvent::Error(pkt_type));
            break;
        }
        let event = match hfi_range(pkt_type) {
            HFI_PROP_BEGIN if pkt_type == HFI_PROP_IMAGE_VERSION => {
                let version = String::from_utf8_lossy(pkt.payload)
                    .trim_end_matches('\0')
                    .to_string();
                SystemEvent::ImageVersion(version)
            }
            HFI_CMD_BEGIN if pkt_type == HFI_CMD_INIT => SystemEvent::InitDone,
            _ => SystemEvent::Unhandled(pkt_type),
        };
        events.push(event);
    }
    events
}

/// Range a packet is processed in. Packets flagged as session errors are processed first,
/// whatever their type.
fn packet_range(pkt: &ResponsePacket) -> u32 {
    if pkt.header.flags().contains(HfiPacketFlags::SESSION_ERROR) {
        HFI_SESSION_ERROR_BEGIN
    } else {
        hfi_range(pkt.header.pkt_type)
    }
}

const PASSES: [u32; 4] = [
    HFI_SESSION_ERROR_BEGIN,
    HFI_INFORMATION_BEGIN,
    HFI_PROP_BEGIN,
    HFI_CMD_BEGIN,
];

/// Processes the packets of a response addressed to the session behind `inner`.
///
/// Errors are not returned: a packet the session cannot process moves it to `Error` and is
/// reported to its clients.
pub fn dispatch(inner: &mut SessionInner, packets: &[ResponsePacket], ctx: &mut Context) {
    inner.frame_info = Default::default();

    let settings_change = packets.iter().any(|p| {
        p.header.pkt_type == HFI_CMD_SETTINGS_CHANGE
            && p.header.port == HfiPort::BITSTREAM as u32
    });
    if settings_change {
        inner.subscription[Port::Input.index()] = SubscriptionParams::from_caps(&inner.caps);
    }

    for range in PASSES {
        for pkt in packets.iter().filter(|p| packet_range(p) == range) {
            let res = match range {
                HFI_SESSION_ERROR_BEGIN => handle_session_error(inner, pkt, ctx),
                HFI_INFORMATION_BEGIN => handle_information(inner, pkt, ctx),
                HFI_PROP_BEGIN => handle_property(inner, pkt),
                _ => handle_command(inner, pkt, ctx),
            };
            if let Err(e) = res {
                fail(inner, e, ctx);
            }
        }
    }

    let buffers = packets
        .iter()
        .any(|p| p.header.pkt_type == HFI_CMD_BUFFER);
    if buffers {
        let meta = [
            inner.meta_enabled(Port::Input),
            inner.meta_enabled(Port::Output),
        ];
        match inner.buffers.deliver_dequeued(meta) {
            Ok(done) => inner.send_buffer_done(done, ctx),
            Err(e) => fail(inner, e.into(), ctx),
        }
    }

    inner.frame_info = Default::default();
}

fn fail(inner: &mut SessionInner, e: VidcError, ctx: &mut Context) {
    inner.force_error(&format!("{:#}", e));
    ctx.events.send_error(inner.id(), e.errno());
}

fn protocol(msg: String) -> VidcError {
    VidcError::ProtocolViolation(msg)
}

fn handle_session_error(
    inner: &mut SessionInner,
    pkt: &ResponsePacket,
    ctx: &mut Context,
) -> Result<()> {
    let pkt_type = pkt.header.pkt_type;
    let name = match pkt_type {
        HFI_ERROR_MAX_SESSIONS => "max sessions reached",
        HFI_ERROR_UNKNOWN_SESSION => "unknown session",
        HFI_ERROR_INVALID_STATE => "invalid state",
        HFI_ERROR_INSUFFICIENT_RESOURCES => "insufficient resources",
        HFI_ERROR_BUFFER_NOT_SET => "buffer not set",
        HFI_ERROR_FATAL => "fatal",
        HFI_ERROR_STREAM_UNSUPPORTED => "unsupported stream",
        _ => "unknown error",
    };
    inner.force_error(&format!("firmware error {:#x} ({})", pkt_type, name));
    inner.cancel_all();
    ctx.events
        .send_error(inner.id(), VidcError::Session(pkt_type).errno());
    Ok(())
}

fn handle_information(
    inner: &mut SessionInner,
    pkt: &ResponsePacket,
    ctx: &mut Context,
) -> Result<()> {
    match pkt.header.pkt_type {
        HFI_INFO_UNSUPPORTED => warn!("session {}: unsupported stream", inner.id()),
        HFI_INFO_DATA_CORRUPT => inner.frame_info.data_corrupt = true,
        HFI_INFO_BUFFER_OVERFLOW => inner.frame_info.overflow = true,
        HFI_INFO_NEGATIVE_TIMESTAMP => debug!("session {}: negative timestamp", inner.id()),
        HFI_INFO_VCODEC_RESET => warn!("session {}: vcodec reset", inner.id()),
        // The firmware had no buffer left to carry the last flag.
        HFI_INFO_HFI_FLAG_DRAIN_LAST => {
            inner.sm.drain_last_flag()?;
            send_eos(inner, ctx);
        }
        HFI_INFO_HFI_FLAG_PSC_LAST => inner.sm.psc_last_flag()?,
        t => warn!("session {}: unknown information {:#x}", inner.id(), t),
    }
    Ok(())
}

fn send_eos(inner: &SessionInner, ctx: &mut Context) {
    if inner.domain() == Domain::Decoder && inner.caps.value(CapId::LAST_FLAG_EVENT_ENABLE) == 0 {
        debug!("session {}: last flag event not enabled", inner.id());
        return;
    }
    ctx.events.send_event(VidcEvent::Eos {
        session_id: inner.id(),
    });
}

fn handle_property(inner: &mut SessionInner, pkt: &ResponsePacket) -> Result<()> {
    let pkt_type = pkt.header.pkt_type;
    let domain = inner.domain();
    let port = HfiPort::n(pkt.header.port).and_then(|p| Port::from_hfi(domain, p));

    if pkt.header.payload_info == HfiPayloadType::NONE as u32 {
        if pkt_type == HFI_PROP_NO_OUTPUT && port == Some(Port::Input) {
            inner.frame_info.no_output = true;
        } else if !pkt.header.flags().contains(HfiPacketFlags::INFORMATION) {
            warn!(
                "session {}: property {:#x} without payload",
                inner.id(),
                pkt_type
            );
        }
        return Ok(());
    }
    pkt.check_payload()?;

    if let Some(params) = subscription_field(inner, port, pkt_type) {
        *params = pkt.read_u32()?;
        return Ok(());
    }

    match pkt_type {
        HFI_PROP_CROP_OFFSETS => {
            let Some(port) = port else {
                return Err(protocol("crop offsets without port".into()));
            };
            inner.subscription[port.index()].crop_offsets =
                [pkt.read_u32_at(0)?, pkt.read_u32_at(1)?];
        }
        HFI_PROP_PICTURE_TYPE => {
            let picture_type = pkt.read_u32()?;
            inner.frame_info.picture_type = picture_type;
            if HfiPictureType::from_bits_truncate(picture_type).contains(HfiPictureType::B) {
                inner.has_bframe = true;
            }
        }
        HFI_PROP_NO_OUTPUT => {
            if port == Some(Port::Input) {
                inner.frame_info.no_output = true;
            } else {
                warn!("session {}: no output on port {:?}", inner.id(), port);
            }
        }
        HFI_PROP_SUBFRAME_INPUT => inner.frame_info.subframe_input = pkt.read_u32()?,
        HFI_PROP_WORST_COMPRESSION_RATIO => inner.frame_info.compression_ratio = pkt.read_u32()?,
        HFI_PROP_WORST_COMPLEXITY_FACTOR => inner.frame_info.complexity_factor = pkt.read_u32()?,
        HFI_PROP_CABAC_SESSION => {
            let entropy = if pkt.read_u32()? != 0 {
                ENTROPY_CABAC
            } else {
                ENTROPY_CAVLC
            };
            inner.caps.update_from_firmware(CapId::ENTROPY_MODE, entropy);
        }
        HFI_PROP_DPB_LIST => {
            if domain != Domain::Decoder
                || port != Some(Port::Output)
                || inner.caps.value(CapId::DPB_LIST) == 0
            {
                warn!("session {}: unexpected dpb list", inner.id());
                return Ok(());
            }
            inner.dpb_list = pkt
                .read_u32_array()?
                .into_iter()
                .map(u64::from)
                .collect();
            debug!("session {}: dpb list {:x?}", inner.id(), inner.dpb_list);
        }
        HFI_PROP_QUALITY_MODE => debug!("session {}: quality mode {}", inner.id(), pkt.read_u32()?),
        HFI_PROP_STAGE | HFI_PROP_PIPE => {
            let id = if pkt_type == HFI_PROP_STAGE {
                CapId::STAGE
            } else {
                CapId::PIPE
            };
            let value = pkt.read_u32()?;
            if inner.caps.value(id) != value as i32 {
                warn!(
                    "session {}: firmware {:?} {} does not match {}",
                    inner.id(),
                    id,
                    value,
                    inner.caps.value(id)
                );
            }
        }
        HFI_PROP_FENCE => {
            let ids = pkt.read_u64_array()?;
            if ids.len() > MAX_FENCE_COUNT as usize {
                return Err(protocol(format!("{} fences in one packet", ids.len())));
            }
            if ids.windows(2).any(|w| w[1] < w[0]) {
                return Err(protocol(format!("fence ids out of order: {:?}", ids)));
            }
            inner.frame_info.fence_ids = ids;
        }
        t => warn!("session {}: unknown property {:#x}", inner.id(), t),
    }
    Ok(())
}

/// Returns the subscription field updated by `pkt_type`, if it is a single-value subscription
/// parameter.
fn subscription_field(
    inner: &mut SessionInner,
    port: Option<Port>,
    pkt_type: u32,
) -> Option<&mut u32> {
    let params = &mut inner.subscription[port?.index()];
    let field = match pkt_type {
        HFI_PROP_BITSTREAM_RESOLUTION => &mut params.bitstream_resolution,
        HFI_PROP_LUMA_CHROMA_BIT_DEPTH => &mut params.bit_depth,
        HFI_PROP_CODED_FRAMES => &mut params.coded_frames,
        HFI_PROP_BUFFER_FW_MIN_OUTPUT_COUNT => &mut params.fw_min_count,
        HFI_PROP_PIC_ORDER_CNT_TYPE => &mut params.pic_order_cnt,
        HFI_PROP_SIGNAL_COLOR_INFO => &mut params.color_info,
        HFI_PROP_PROFILE => &mut params.profile,
        HFI_PROP_LEVEL => &mut params.level,
        HFI_PROP_TIER => &mut params.tier,
        HFI_PROP_AV1_FILM_GRAIN_PRESENT => &mut params.av1_film_grain_present,
        HFI_PROP_AV1_SUPER_BLOCK_ENABLED => &mut params.av1_super_block_enabled,
        _ => return None,
    };
    Some(field)
}

fn handle_command(
    inner: &mut SessionInner,
    pkt: &ResponsePacket,
    ctx: &mut Context,
) -> Result<()> {
    let id = inner.id();
    match pkt.header.pkt_type {
        HFI_CMD_OPEN => debug!("session {}: open done", id),
        HFI_CMD_CLOSE => inner.signal(Signal::Close),
        HFI_CMD_START => debug!("session {}: start done on port {}", id, pkt.header.port),
        HFI_CMD_STOP => {
            let port = HfiPort::n(pkt.header.port)
                .and_then(|p| Port::from_hfi(inner.domain(), p))
                .ok_or_else(|| protocol(format!("stop done on port {}", pkt.header.port)))?;
            let res = inner.sm.stop_done(port);
            inner.signal(Signal::stop(port));
            res?;
        }
        HFI_CMD_DRAIN => inner.sm.drain_done()?,
        HFI_CMD_BUFFER => handle_buffer(inner, pkt, ctx)?,
        HFI_CMD_SETTINGS_CHANGE => {
            if pkt.header.port == HfiPort::BITSTREAM as u32 && inner.domain() == Domain::Decoder {
                inner.input_psc(ctx)?;
            } else {
                debug!("session {}: settings change on port {}", id, pkt.header.port);
            }
        }
        HFI_CMD_SUBSCRIBE_MODE
        | HFI_CMD_DELIVERY_MODE
        | HFI_CMD_PAUSE
        | HFI_CMD_RESUME
        | HFI_CMD_STABILITY => debug!("session {}: command {:#x} done", id, pkt.header.pkt_type),
        HFI_CMD_EARLY_NOTIFY_PARTIAL_FRAME => {
            pkt.check_payload()?;
            let fence_id = pkt
                .read_u64_array()?
                .first()
                .copied()
                .ok_or_else(|| protocol("partial frame without fence".into()))?;
            if fence_id < inner.prev_fence_id {
                return Err(protocol(format!(
                    "partial frame fence {} before {}",
                    fence_id, inner.prev_fence_id
                )));
            }
            inner.prev_fence_id = fence_id;
            inner.fences_received += 1;
            ctx.events
                .send_event(VidcEvent::FenceSignalled { session_id: id, fence_id });
        }
        t => warn!("session {}: unknown command {:#x}", id, t),
    }
    Ok(())
}

fn handle_buffer(inner: &mut SessionInner, pkt: &ResponsePacket, ctx: &mut Context) -> Result<()> {
    if pkt.payload.is_empty() {
        debug!("session {}: buffer packet without payload", inner.id());
        return Ok(());
    }
    let wire = pkt.read_buffer()?;
    let domain = inner.domain();
    let hfi_port = HfiPort::n(pkt.header.port)
        .ok_or_else(|| protocol(format!("buffer on invalid port {}", pkt.header.port)))?;
    let hfi_type = HfiBufferType::n(wire.buffer_type)
        .ok_or_else(|| protocol(format!("invalid buffer type {}", wire.buffer_type)))?;
    if hfi_port == HfiPort::NONE
        && !matches!(hfi_type, HfiBufferType::ARP | HfiBufferType::PERSIST)
    {
        return Err(protocol(format!("{:?} buffer without port", hfi_type)));
    }

    if domain == Domain::Decoder
        && hfi_type == HfiBufferType::RAW
        && wire.flags().contains(HfiBufferFlags::RELEASE_DONE)
    {
        inner.buffers.on_output_release_done(wire.base_address)?;
        return Ok(());
    }

    let buffer_type = BufferType::from_hfi(domain, hfi_port, hfi_type).ok_or_else(|| {
        protocol(format!(
            "unexpected {:?} buffer on port {:?}",
            hfi_type, hfi_port
        ))
    })?;

    if buffer_type.is_internal() {
        if wire.flags().contains(HfiBufferFlags::RELEASE_DONE) {
            inner
                .buffers
                .on_release_done(buffer_type, wire.base_address, &mut *ctx.allocator)?;
        } else {
            debug!("session {}: {:?} buffer returned", inner.id(), buffer_type);
        }
        return Ok(());
    }

    match buffer_type {
        BufferType::Output => handle_output_buffer(inner, wire, ctx),
        _ => {
            inner.buffers.on_firmware_return(buffer_type, &wire);
            Ok(())
        }
    }
}

fn handle_output_buffer(
    inner: &mut SessionInner,
    mut wire: HfiBuffer,
    ctx: &mut Context,
) -> Result<()> {
    let domain = inner.domain();
    let wire_flags = wire.flags();
    let last = wire_flags.contains(HfiBufferFlags::LAST);
    let psc_last = domain == Domain::Decoder && wire_flags.contains(HfiBufferFlags::PSC_LAST);

    if last {
        inner.sm.drain_last_flag()?;
    }
    if psc_last {
        inner.sm.psc_last_flag()?;
    }
    if last || psc_last {
        // Carries no frame, and the firmware does not keep it as a reference.
        wire.data_size = 0;
        wire.flags &= !HfiBufferFlags::READONLY.bits();
    }
    if domain == Domain::Encoder && inner.frame_info.data_corrupt {
        return Err(protocol("encoder output is corrupt".into()));
    }

    let Some(id) = inner.buffers.on_firmware_return(BufferType::Output, &wire) else {
        return Ok(());
    };

    let info = &inner.frame_info;
    let mut flags = BufferFlags::empty();
    let picture = HfiPictureType::from_bits_truncate(info.picture_type);
    if picture.intersects(
        HfiPictureType::IDR | HfiPictureType::I | HfiPictureType::CRA | HfiPictureType::BLA,
    ) {
        flags |= BufferFlags::KEYFRAME;
    }
    if picture.contains(HfiPictureType::P) {
        flags |= BufferFlags::PFRAME;
    }
    if picture.contains(HfiPictureType::B) {
        flags |= BufferFlags::BFRAME;
    }
    if info.data_corrupt || info.overflow {
        flags |= BufferFlags::ERROR;
    }
    let codec_config = wire_flags.contains(HfiBufferFlags::CODEC_CONFIG);
    if codec_config {
        flags |= BufferFlags::CODEC_CONFIG;
    } else if info.no_output {
        flags |= BufferFlags::ERROR;
    }
    if last || (psc_last && inner.caps.value(CapId::LAST_FLAG_EVENT_ENABLE) == 0) {
        flags |= BufferFlags::LAST;
    }

    let data_size = match inner.buffers.get_mut(id) {
        Some(buf) => {
            buf.flags = flags;
            buf.data_size
        }
        None => 0,
    };
    if last {
        send_eos(inner, ctx);
    }

    let fences = std::mem::take(&mut inner.frame_info.fence_ids);
    for fence_id in fences {
        if fence_id <= inner.prev_fence_id && inner.sm.state() != SessionState::OutputStreaming {
            error!(
                "session {}: fence {} after {}",
                inner.id(),
                fence_id,
                inner.prev_fence_id
            );
            return Err(protocol(format!("fence {} regressed", fence_id)));
        }
        inner.prev_fence_id = fence_id;
        inner.fences_received += 1;
        let session_id = inner.id();
        ctx.events.send_event(if data_size > 0 {
            VidcEvent::FenceSignalled {
                session_id,
                fence_id,
            }
        } else {
            VidcEvent::FenceDestroyed {
                session_id,
                fence_id,
            }
        });
    }

    let expected = inner.fences_per_output();
    if inner.fences_received < expected {
        return Err(protocol(format!(
            "{} fences received for an output buffer, {} expected",
            inner.fences_received, expected
        )));
    }
    inner.fences_received -= expected;
    Ok(())
}

#[cfg(test)]
mod tests {
    use zerocopy::AsBytes;

    use super::*;
    use crate::buffer::Buffer;
    use crate::buffer::BufferAttr;
    use crate::session::testing::*;
    use crate::state::SubState;
    use crate::Codec;

    const SID: u32 = 3;

    type Pkt = (u32, HfiPacketFlags, HfiPort, HfiPayloadType, Vec<u8>);

    fn prop(pkt_type: u32, port: HfiPort, value: u32) -> Pkt {
        (
            pkt_type,
            HfiPacketFlags::SUCCESS,
            port,
            HfiPayloadType::U32,
            value.to_le_bytes().to_vec(),
        )
    }

    fn cmd(pkt_type: u32, port: HfiPort) -> Pkt {
        (
            pkt_type,
            HfiPacketFlags::SUCCESS,
            port,
            HfiPayloadType::NONE,
            vec![],
        )
    }

    fn buffer(port: HfiPort, wire: HfiBuffer) -> Pkt {
        (
            HFI_CMD_BUFFER,
            HfiPacketFlags::SUCCESS,
            port,
            HfiPayloadType::STRUCTURE,
            wire.as_bytes().to_vec(),
        )
    }

    fn feed(inner: &mut SessionInner, collab: &mut Collaborators, packets: &[Pkt]) {
        let bytes = response(SID, packets);
        let (_, packets) = parse_response(&bytes).unwrap();
        dispatch(inner, &packets, &mut collab.context());
    }

    fn streaming(domain: Domain, collab: &mut Collaborators) -> SessionInner {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut inner = SessionInner::new(SID, domain, Codec::H264);
        inner.open(&mut collab.context()).unwrap();
        let (first, second) = match domain {
            Domain::Decoder => (Port::Input, Port::Output),
            Domain::Encoder => (Port::Output, Port::Input),
        };
        inner.streamon(first, &mut collab.context()).unwrap();
        inner.streamon(second, &mut collab.context()).unwrap();
        assert_eq!(inner.sm.state(), SessionState::Streaming);
        inner
    }

    fn output_wire(domain: Domain, index: u32, addr: u64, data_size: u32) -> HfiBuffer {
        HfiBuffer {
            buffer_type: match domain {
                Domain::Decoder => HfiBufferType::RAW as u32,
                Domain::Encoder => HfiBufferType::BITSTREAM as u32,
            },
            index,
            base_address: addr,
            data_size,
            ..Default::default()
        }
    }

    fn fence(id: u64) -> Pkt {
        (
            HFI_PROP_FENCE,
            HfiPacketFlags::SUCCESS,
            HfiPort::RAW,
            HfiPayloadType::BLOB,
            id.to_le_bytes().to_vec(),
        )
    }

    fn partial_frame(payload: Vec<u8>) -> Pkt {
        (
            HFI_CMD_EARLY_NOTIFY_PARTIAL_FRAME,
            HfiPacketFlags::SUCCESS,
            HfiPort::RAW,
            HfiPayloadType::U64,
            payload,
        )
    }

    fn queue_outputs(inner: &mut SessionInner, collab: &mut Collaborators, count: u32) {
        for index in 0..count {
            inner
                .qbuf(
                    Buffer::new(BufferType::Output, index, output_addr(index), 0x20000),
                    &mut collab.context(),
                )
                .unwrap();
        }
    }

    fn output_addr(index: u32) -> u64 {
        0x10000 + index as u64 * 0x20000
    }

    fn errors(collab: &Collaborators) -> Vec<i32> {
        collab
            .events
            .events
            .iter()
            .filter_map(|e| match e {
                VidcEvent::Error { errno, .. } => Some(*errno),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn decoded_frame_is_delivered() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Decoder, &mut collab);
        inner
            .qbuf(
                Buffer::new(BufferType::Output, 0, 0x10000, 0x20000),
                &mut collab.context(),
            )
            .unwrap();

        // The buffer comes first but the picture type is processed before it.
        feed(
            &mut inner,
            &mut collab,
            &[
                buffer(HfiPort::RAW, output_wire(Domain::Decoder, 0, 0x10000, 1000)),
                prop(HFI_PROP_PICTURE_TYPE, HfiPort::RAW, HfiPictureType::IDR.bits()),
            ],
        );

        let done: Vec<_> = collab
            .events
            .events
            .iter()
            .filter_map(|e| match e {
                VidcEvent::BufferDone { buffer, .. } => Some(buffer.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].data_size, 1000);
        assert_eq!(done[0].flags, BufferFlags::KEYFRAME);
        assert_eq!(inner.buffers.buffers(BufferType::Output).count(), 0);
        assert_eq!(inner.frame_info, Default::default());
    }

    #[test]
    fn settings_change_reads_new_parameters() {
        let mut collab = Collaborators::default();
        let mut inner = SessionInner::new(SID, Domain::Decoder, Codec::Hevc);
        inner.open(&mut collab.context()).unwrap();
        inner
            .streamon(Port::Input, &mut collab.context())
            .unwrap();

        // The settings change arrives before the new parameters.
        feed(
            &mut inner,
            &mut collab,
            &[
                cmd(HFI_CMD_SETTINGS_CHANGE, HfiPort::BITSTREAM),
                prop(
                    HFI_PROP_BITSTREAM_RESOLUTION,
                    HfiPort::BITSTREAM,
                    (1280 << 16) | 720,
                ),
                prop(HFI_PROP_BUFFER_FW_MIN_OUTPUT_COUNT, HfiPort::BITSTREAM, 6),
            ],
        );

        assert_eq!(inner.caps.value(CapId::FRAME_WIDTH), 1280);
        assert_eq!(inner.caps.value(CapId::FRAME_HEIGHT), 720);
        assert_eq!(inner.caps.value(CapId::MIN_BUFFERS_OUTPUT), 6);
        assert!(inner.is_sub_state(SubState::DRC | SubState::INPUT_PAUSE | SubState::FIRST_IPSC));
        assert_eq!(
            collab.events.events,
            vec![VidcEvent::SettingsChanged {
                session_id: SID,
                width: 1280,
                height: 720,
                min_output_count: 6,
            }]
        );
    }

    #[test]
    fn settings_change_reports_clamped_resolution() {
        let mut collab = Collaborators::default();
        let mut inner = SessionInner::new(SID, Domain::Decoder, Codec::H264);
        inner.open(&mut collab.context()).unwrap();
        inner
            .streamon(Port::Input, &mut collab.context())
            .unwrap();

        feed(
            &mut inner,
            &mut collab,
            &[
                cmd(HFI_CMD_SETTINGS_CHANGE, HfiPort::BITSTREAM),
                prop(
                    HFI_PROP_BITSTREAM_RESOLUTION,
                    HfiPort::BITSTREAM,
                    (10000 << 16) | 64,
                ),
            ],
        );

        assert_eq!(inner.caps.value(CapId::FRAME_WIDTH), 8192);
        assert_eq!(inner.caps.value(CapId::FRAME_HEIGHT), 96);
        assert!(collab.events.events.iter().any(|e| matches!(
            e,
            VidcEvent::SettingsChanged {
                width: 8192,
                height: 96,
                ..
            }
        )));
    }

    #[test]
    fn second_settings_change_is_fatal() {
        let mut collab = Collaborators::default();
        let mut inner = SessionInner::new(SID, Domain::Decoder, Codec::H264);
        inner.open(&mut collab.context()).unwrap();
        inner
            .streamon(Port::Input, &mut collab.context())
            .unwrap();

        let change = [cmd(HFI_CMD_SETTINGS_CHANGE, HfiPort::BITSTREAM)];
        feed(&mut inner, &mut collab, &change);
        assert!(inner.is_sub_state(SubState::DRC));
        feed(&mut inner, &mut collab, &change);

        assert!(inner.sm.is_error());
        let changes = collab
            .events
            .events
            .iter()
            .filter(|e| matches!(e, VidcEvent::SettingsChanged { .. }))
            .count();
        assert_eq!(changes, 1);
        assert_eq!(errors(&collab).len(), 1);
    }

    #[test]
    fn drain_last_buffer() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Encoder, &mut collab);
        inner
            .qbuf(
                Buffer::new(BufferType::Output, 0, 0x20000, 0x10000),
                &mut collab.context(),
            )
            .unwrap();
        inner.drain(&mut collab.context()).unwrap();

        feed(
            &mut inner,
            &mut collab,
            &[cmd(HFI_CMD_DRAIN, HfiPort::BITSTREAM)],
        );
        assert!(inner.is_sub_state(SubState::DRAIN | SubState::INPUT_PAUSE));

        let mut wire = output_wire(Domain::Encoder, 0, 0x20000, 64);
        wire.flags = HfiBufferFlags::LAST.bits();
        feed(&mut inner, &mut collab, &[buffer(HfiPort::BITSTREAM, wire)]);

        assert!(inner.is_sub_state(SubState::DRAIN_LAST_BUFFER | SubState::OUTPUT_PAUSE));
        assert!(matches!(
            collab.events.events.as_slice(),
            [VidcEvent::Eos { .. }, VidcEvent::BufferDone { buffer, .. }]
                if buffer.data_size == 0 && buffer.flags == BufferFlags::LAST
        ));
    }

    #[test]
    fn stop_done_signals_waiter() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Decoder, &mut collab);
        let (_, rx) = inner
            .begin_stop(Port::Output, &mut collab.context())
            .unwrap()
            .unwrap();
        feed(&mut inner, &mut collab, &[cmd(HFI_CMD_STOP, HfiPort::RAW)]);
        rx.try_recv().unwrap();
        assert!(inner.is_sub_state(SubState::OUTPUT_PAUSE));
    }

    #[test]
    fn session_error_wakes_waiters() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Decoder, &mut collab);
        let (_, rx) = inner
            .begin_stop(Port::Input, &mut collab.context())
            .unwrap()
            .unwrap();
        // Flagged as a session error, so handled before the stop.
        feed(
            &mut inner,
            &mut collab,
            &[
                cmd(HFI_CMD_STOP, HfiPort::BITSTREAM),
                (
                    HFI_ERROR_FATAL,
                    HfiPacketFlags::SESSION_ERROR,
                    HfiPort::NONE,
                    HfiPayloadType::NONE,
                    vec![],
                ),
            ],
        );
        assert!(inner.sm.is_error());
        assert!(rx.recv().is_err());
        assert_eq!(errors(&collab), vec![libc::EIO]);
    }

    #[test]
    fn fences() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Decoder, &mut collab);
        for (index, addr) in [(0, 0x10000), (1, 0x30000)] {
            inner
                .qbuf(
                    Buffer::new(BufferType::Output, index, addr, 0x20000),
                    &mut collab.context(),
                )
                .unwrap();
        }
        feed(
            &mut inner,
            &mut collab,
            &[
                fence(7),
                buffer(HfiPort::RAW, output_wire(Domain::Decoder, 0, 0x10000, 100)),
            ],
        );
        assert!(collab.events.events.contains(&VidcEvent::FenceSignalled {
            session_id: SID,
            fence_id: 7
        }));
        assert_eq!(inner.prev_fence_id, 7);

        feed(
            &mut inner,
            &mut collab,
            &[
                fence(5),
                buffer(HfiPort::RAW, output_wire(Domain::Decoder, 1, 0x30000, 100)),
            ],
        );
        assert!(inner.sm.is_error());
        assert_eq!(errors(&collab), vec![libc::EPROTO]);
    }

    #[test]
    fn partial_frame_fence() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Decoder, &mut collab);
        inner.prev_fence_id = 4;

        // The same id as the last one is fine.
        feed(&mut inner, &mut collab, &[partial_frame(4u64.to_le_bytes().to_vec())]);
        assert!(collab.events.events.contains(&VidcEvent::FenceSignalled {
            session_id: SID,
            fence_id: 4
        }));
        assert!(errors(&collab).is_empty());
        assert_eq!(inner.fences_received, 1);

        feed(&mut inner, &mut collab, &[partial_frame(3u64.to_le_bytes().to_vec())]);
        assert!(inner.sm.is_error());
        assert_eq!(errors(&collab), vec![libc::EPROTO]);
        assert_eq!(inner.prev_fence_id, 4);
    }

    #[test]
    fn partial_frame_without_fence() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Decoder, &mut collab);

        feed(&mut inner, &mut collab, &[partial_frame(vec![])]);
        assert!(inner.sm.is_error());
        assert_eq!(errors(&collab).len(), 1);
        assert!(!collab
            .events
            .events
            .iter()
            .any(|e| matches!(e, VidcEvent::FenceSignalled { .. })));
        assert_eq!(inner.fences_received, 0);
    }

    #[test]
    fn output_fence_count() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Decoder, &mut collab);
        inner.caps.update_from_firmware(CapId::META_OUTBUF_FENCE, 1);
        assert_eq!(inner.fences_per_output(), 1);
        queue_outputs(&mut inner, &mut collab, 2);

        feed(
            &mut inner,
            &mut collab,
            &[
                fence(1),
                buffer(HfiPort::RAW, output_wire(Domain::Decoder, 0, output_addr(0), 100)),
            ],
        );
        assert!(errors(&collab).is_empty());
        assert_eq!(inner.fences_received, 0);

        // The second frame comes back without its fence.
        feed(
            &mut inner,
            &mut collab,
            &[buffer(HfiPort::RAW, output_wire(Domain::Decoder, 1, output_addr(1), 100))],
        );
        assert!(inner.sm.is_error());
        assert_eq!(errors(&collab), vec![libc::EPROTO]);
    }

    #[test]
    fn early_notify_fences_count_toward_output() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Decoder, &mut collab);
        inner.caps.update_from_firmware(CapId::META_OUTBUF_FENCE, 1);
        inner.caps.update_from_firmware(CapId::EARLY_NOTIFY_ENABLE, 1);
        inner.caps.update_from_firmware(CapId::EARLY_NOTIFY_FENCE_COUNT, 2);
        assert_eq!(inner.fences_per_output(), 2);
        queue_outputs(&mut inner, &mut collab, 1);

        feed(&mut inner, &mut collab, &[partial_frame(1u64.to_le_bytes().to_vec())]);
        feed(
            &mut inner,
            &mut collab,
            &[
                fence(2),
                buffer(HfiPort::RAW, output_wire(Domain::Decoder, 0, output_addr(0), 100)),
            ],
        );
        assert!(errors(&collab).is_empty());
        assert!(!inner.sm.is_error());
        assert_eq!(inner.fences_received, 0);
        assert_eq!(inner.prev_fence_id, 2);
    }

    #[test]
    fn internal_buffer_release_done() {
        let mut collab = Collaborators::default();
        let mut inner = SessionInner::new(SID, Domain::Decoder, Codec::H264);
        inner.open(&mut collab.context()).unwrap();
        inner
            .streamon(Port::Input, &mut collab.context())
            .unwrap();
        let live = collab.allocator.live;
        let (addr, index) = inner
            .buffers
            .buffers(BufferType::Bin)
            .map(|(_, b)| (b.device_addr, b.index))
            .next()
            .unwrap();

        let wire = HfiBuffer {
            buffer_type: HfiBufferType::BIN as u32,
            index,
            base_address: addr,
            flags: HfiBufferFlags::RELEASE_DONE.bits(),
            ..Default::default()
        };
        feed(&mut inner, &mut collab, &[buffer(HfiPort::BITSTREAM, wire)]);
        assert_eq!(collab.allocator.live, live - 1);
        assert!(!inner.sm.is_error());

        // Unknown address.
        feed(&mut inner, &mut collab, &[buffer(HfiPort::BITSTREAM, wire)]);
        assert!(inner.sm.is_error());
    }

    #[test]
    fn buffer_without_port_is_rejected() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Decoder, &mut collab);
        let wire = HfiBuffer {
            buffer_type: HfiBufferType::BIN as u32,
            ..Default::default()
        };
        feed(&mut inner, &mut collab, &[buffer(HfiPort::NONE, wire)]);
        assert!(inner.sm.is_error());
        assert_eq!(errors(&collab), vec![libc::EPROTO]);
    }

    #[test]
    fn read_only_output_is_retained() {
        let mut collab = Collaborators::default();
        let mut inner = streaming(Domain::Decoder, &mut collab);
        inner
            .qbuf(
                Buffer::new(BufferType::Output, 0, 0x10000, 0x20000),
                &mut collab.context(),
            )
            .unwrap();
        let mut wire = output_wire(Domain::Decoder, 0, 0x10000, 100);
        wire.flags = HfiBufferFlags::READONLY.bits();
        feed(&mut inner, &mut collab, &[buffer(HfiPort::RAW, wire)]);

        let ro: Vec<_> = inner.buffers.read_only().collect();
        assert_eq!(ro.len(), 1);
        assert_eq!(ro[0].device_addr, 0x10000);
        assert!(ro[0].attr.contains(BufferAttr::READ_ONLY));
    }

    #[test]
    fn system_responses() {
        let mut writer = PacketWriter::new(0, 0);
        writer
            .add_packet(
                HFI_PROP_IMAGE_VERSION,
                HfiPacketFlags::SUCCESS,
                HfiPort::NONE,
                HfiPayloadType::STRING,
                b"fw-1.2\0\0",
            )
            .unwrap()
            .add_packet(
                HFI_CMD_INIT,
                HfiPacketFlags::SUCCESS,
                HfiPort::NONE,
                HfiPayloadType::NONE,
                &[],
            )
            .unwrap()
            .add_packet(
                HFI_SYS_ERROR_WD_TIMEOUT,
                HfiPacketFlags::SYSTEM_ERROR,
                HfiPort::NONE,
                HfiPayloadType::NONE,
                &[],
            )
            .unwrap()
            .add_packet(
                HFI_CMD_INIT,
                HfiPacketFlags::SUCCESS,
                HfiPort::NONE,
                HfiPayloadType::NONE,
                &[],
            )
            .unwrap();
        let bytes = writer.finish().unwrap();
        let (_, packets) = parse_response(&bytes).unwrap();
        assert_eq!(
            system_events(&packets),
            vec![
                SystemEvent::ImageVersion("fw-1.2".into()),
                SystemEvent::InitDone,
                SystemEvent::Error(HFI_SYS_ERROR_WD_TIMEOUT),
            ]
        );
    }
}
