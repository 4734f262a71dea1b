// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire definitions of the host-firmware interface (HFI): the packet header, packets, the buffer
//! descriptor and the identifiers carried in them.
//!
//! Every message exchanged with the firmware is a [`HfiHeader`] followed by `num_packets`
//! packets, each made of a [`HfiPacket`] and an optional payload. All fields are little-endian.

use bitflags::bitflags;
use enumn::N;
use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::io::ReadFromQueue;
use crate::io::WriteToQueue;
use crate::HfiTransport;

pub const HFI_RANGE_MASK: u32 = 0xff00_0000;
pub const HFI_CMD_BEGIN: u32 = 0x0100_0000;
pub const HFI_PROP_BEGIN: u32 = 0x0300_0000;
pub const HFI_SESSION_ERROR_BEGIN: u32 = 0x0400_0000;
pub const HFI_SYSTEM_ERROR_BEGIN: u32 = 0x0500_0000;
pub const HFI_INFORMATION_BEGIN: u32 = 0x0600_0000;

/// Returns the range a packet type belongs to.
pub fn hfi_range(pkt_type: u32) -> u32 {
    pkt_type & HFI_RANGE_MASK
}

pub const HFI_CMD_INIT: u32 = 0x0100_0001;
pub const HFI_CMD_POWER_COLLAPSE: u32 = 0x0100_0002;
pub const HFI_CMD_OPEN: u32 = 0x0100_0003;
pub const HFI_CMD_CLOSE: u32 = 0x0100_0004;
pub const HFI_CMD_START: u32 = 0x0100_0005;
pub const HFI_CMD_STOP: u32 = 0x0100_0006;
pub const HFI_CMD_DRAIN: u32 = 0x0100_0007;
pub const HFI_CMD_RESUME: u32 = 0x0100_0008;
pub const HFI_CMD_BUFFER: u32 = 0x0100_0009;
pub const HFI_CMD_DELIVERY_MODE: u32 = 0x0100_000a;
pub const HFI_CMD_SUBSCRIBE_MODE: u32 = 0x0100_000b;
pub const HFI_CMD_SETTINGS_CHANGE: u32 = 0x0100_000c;
pub const HFI_CMD_STABILITY: u32 = 0x0100_000d;
pub const HFI_CMD_PAUSE: u32 = 0x0100_0011;
pub const HFI_CMD_EARLY_NOTIFY_PARTIAL_FRAME: u32 = 0x0100_0012;

pub const HFI_INFO_UNSUPPORTED: u32 = 0x0600_0001;
pub const HFI_INFO_DATA_CORRUPT: u32 = 0x0600_0002;
pub const HFI_INFO_NEGATIVE_TIMESTAMP: u32 = 0x0600_0003;
pub const HFI_INFO_BUFFER_OVERFLOW: u32 = 0x0600_0004;
pub const HFI_INFO_VCODEC_RESET: u32 = 0x0600_0005;
pub const HFI_INFO_HFI_FLAG_DRAIN_LAST: u32 = 0x0600_0006;
pub const HFI_INFO_HFI_FLAG_PSC_LAST: u32 = 0x0600_0007;

pub const HFI_ERROR_MAX_SESSIONS: u32 = 0x0400_0002;
pub const HFI_ERROR_UNKNOWN_SESSION: u32 = 0x0400_0003;
pub const HFI_ERROR_INVALID_STATE: u32 = 0x0400_0004;
pub const HFI_ERROR_INSUFFICIENT_RESOURCES: u32 = 0x0400_0005;
pub const HFI_ERROR_BUFFER_NOT_SET: u32 = 0x0400_0006;
pub const HFI_ERROR_FATAL: u32 = 0x0400_0007;
pub const HFI_ERROR_STREAM_UNSUPPORTED: u32 = 0x0400_0008;

pub const HFI_SYS_ERROR_WD_TIMEOUT: u32 = 0x0500_0001;
pub const HFI_SYS_ERROR_NOC: u32 = 0x0500_0002;
pub const HFI_SYS_ERROR_FATAL: u32 = 0x0500_0003;

pub const HFI_PROP_IMAGE_VERSION: u32 = 0x0300_0001;
pub const HFI_PROP_BITSTREAM_RESOLUTION: u32 = 0x0300_0002;
pub const HFI_PROP_CROP_OFFSETS: u32 = 0x0300_0003;
pub const HFI_PROP_LUMA_CHROMA_BIT_DEPTH: u32 = 0x0300_0004;
pub const HFI_PROP_CODED_FRAMES: u32 = 0x0300_0005;
pub const HFI_PROP_BUFFER_FW_MIN_OUTPUT_COUNT: u32 = 0x0300_0006;
pub const HFI_PROP_PIC_ORDER_CNT_TYPE: u32 = 0x0300_0007;
pub const HFI_PROP_SIGNAL_COLOR_INFO: u32 = 0x0300_0008;
pub const HFI_PROP_PROFILE: u32 = 0x0300_0009;
pub const HFI_PROP_LEVEL: u32 = 0x0300_000a;
pub const HFI_PROP_TIER: u32 = 0x0300_000b;
pub const HFI_PROP_AV1_FILM_GRAIN_PRESENT: u32 = 0x0300_000c;
pub const HFI_PROP_AV1_SUPER_BLOCK_ENABLED: u32 = 0x0300_000d;
pub const HFI_PROP_PICTURE_TYPE: u32 = 0x0300_000e;
pub const HFI_PROP_NO_OUTPUT: u32 = 0x0300_000f;
pub const HFI_PROP_SUBFRAME_INPUT: u32 = 0x0300_0010;
pub const HFI_PROP_WORST_COMPRESSION_RATIO: u32 = 0x0300_0011;
pub const HFI_PROP_WORST_COMPLEXITY_FACTOR: u32 = 0x0300_0012;
pub const HFI_PROP_CABAC_SESSION: u32 = 0x0300_0013;
pub const HFI_PROP_DPB_LIST: u32 = 0x0300_0014;
pub const HFI_PROP_QUALITY_MODE: u32 = 0x0300_0015;
pub const HFI_PROP_STAGE: u32 = 0x0300_0016;
pub const HFI_PROP_PIPE: u32 = 0x0300_0017;
pub const HFI_PROP_FENCE: u32 = 0x0300_0018;
pub const HFI_PROP_COLOR_FORMAT: u32 = 0x0300_0019;
pub const HFI_PROP_RATE_CONTROL: u32 = 0x0300_001a;
pub const HFI_PROP_TOTAL_BITRATE: u32 = 0x0300_001b;
pub const HFI_PROP_TOTAL_PEAK_BITRATE: u32 = 0x0300_001c;
pub const HFI_PROP_LAYER_COUNT: u32 = 0x0300_001d;
pub const HFI_PROP_LAYER_ENCODING_TYPE: u32 = 0x0300_001e;
pub const HFI_PROP_BITRATE_LAYER1: u32 = 0x0300_001f;
pub const HFI_PROP_BITRATE_LAYER2: u32 = 0x0300_0020;
pub const HFI_PROP_BITRATE_LAYER3: u32 = 0x0300_0021;
pub const HFI_PROP_BITRATE_LAYER4: u32 = 0x0300_0022;
pub const HFI_PROP_BITRATE_LAYER5: u32 = 0x0300_0023;
pub const HFI_PROP_BITRATE_LAYER6: u32 = 0x0300_0024;
pub const HFI_PROP_MAX_GOP_FRAMES: u32 = 0x0300_0025;
pub const HFI_PROP_MAX_B_FRAMES: u32 = 0x0300_0026;
pub const HFI_PROP_8X8_TRANSFORM: u32 = 0x0300_0027;
pub const HFI_PROP_MULTI_SLICE_MB_COUNT: u32 = 0x0300_0028;
pub const HFI_PROP_ENABLE_SLICE_DELIVERY: u32 = 0x0300_0029;
pub const HFI_PROP_LTR_COUNT: u32 = 0x0300_002a;
pub const HFI_PROP_LTR_USE: u32 = 0x0300_002b;
pub const HFI_PROP_LTR_MARK: u32 = 0x0300_002c;
pub const HFI_PROP_MIN_QP_PACKED: u32 = 0x0300_002d;
pub const HFI_PROP_MAX_QP_PACKED: u32 = 0x0300_002e;
pub const HFI_PROP_DECODE_ORDER_OUTPUT: u32 = 0x0300_002f;
pub const HFI_PROP_EARLY_NOTIFY_ENABLE: u32 = 0x0300_0030;
pub const HFI_PROP_EARLY_NOTIFY_LINE_COUNT: u32 = 0x0300_0031;
pub const HFI_PROP_EARLY_NOTIFY_FENCE_COUNT: u32 = 0x0300_0032;
pub const HFI_PROP_SECURE: u32 = 0x0300_0033;
pub const HFI_PROP_ENABLE_FENCE: u32 = 0x0300_0034;
pub const HFI_PROP_LOW_LATENCY: u32 = 0x0300_0035;
pub const HFI_PROP_FRAME_RATE: u32 = 0x0300_0036;

bitflags! {
    /// Flags carried in [`HfiPacket::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HfiPacketFlags: u32 {
        const SUCCESS = 0x0000_0001;
        const INFORMATION = 0x0000_0002;
        const SESSION_ERROR = 0x0000_0004;
        const SYSTEM_ERROR = 0x0000_0008;
        const RESPONSE_REQUIRED = 0x0000_0010;
        const NON_DISCARDABLE = 0x0000_0020;
    }
}

bitflags! {
    /// Flags carried in [`HfiBuffer::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HfiBufferFlags: u32 {
        /// Host request to release an internal buffer. The firmware echoes the same bit back as
        /// `RELEASE_DONE`.
        const RELEASE = 0x0000_0001;
        const RELEASE_DONE = 0x0000_0001;
        const READONLY = 0x0000_0010;
        const CODEC_CONFIG = 0x0000_0100;
        const LAST = 0x1000_0000;
        const PSC_LAST = 0x2000_0000;
    }
}

bitflags! {
    /// Picture types reported through `HFI_PROP_PICTURE_TYPE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HfiPictureType: u32 {
        const IDR = 0x01;
        const P = 0x02;
        const B = 0x04;
        const I = 0x08;
        const CRA = 0x10;
        const BLA = 0x20;
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum HfiPayloadType {
    NONE = 0,
    U32 = 1,
    S32 = 2,
    U64 = 3,
    S64 = 4,
    STRUCTURE = 5,
    BLOB = 6,
    STRING = 7,
    Q16 = 8,
    U32_ENUM = 9,
    PACKED_32 = 10,
    U32_ARRAY = 11,
    S32_ARRAY = 12,
    PACKED_64 = 13,
}

impl HfiPayloadType {
    /// Size a payload of this type must have, if fixed.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            HfiPayloadType::U32
            | HfiPayloadType::S32
            | HfiPayloadType::Q16
            | HfiPayloadType::U32_ENUM
            | HfiPayloadType::PACKED_32 => Some(4),
            HfiPayloadType::U64 | HfiPayloadType::S64 | HfiPayloadType::PACKED_64 => Some(8),
            _ => None,
        }
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug, Hash)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum HfiBufferType {
    BITSTREAM = 1,
    RAW = 2,
    METADATA = 3,
    SUBCACHE = 4,
    PARTIAL_DATA = 5,
    DPB = 6,
    BIN = 7,
    ARP = 8,
    COMV = 9,
    NON_COMV = 10,
    LINE = 11,
    PERSIST = 12,
    VPSS = 13,
}

#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug, Hash)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum HfiPort {
    NONE = 0,
    BITSTREAM = 1,
    RAW = 2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct HfiHeader {
    /// Size of the whole message, header included.
    pub size: u32,
    pub session_id: u32,
    pub num_packets: u32,
    pub header_id: u32,
    pub reserved: [u32; 4],
}

pub const HFI_HEADER_SIZE: usize = std::mem::size_of::<HfiHeader>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct HfiPacket {
    /// Size of the packet, payload included.
    pub size: u32,
    pub pkt_type: u32,
    pub port: u32,
    pub flags: u32,
    pub payload_info: u32,
}

pub const HFI_PACKET_SIZE: usize = std::mem::size_of::<HfiPacket>();

impl HfiPacket {
    pub fn flags(&self) -> HfiPacketFlags {
        HfiPacketFlags::from_bits_retain(self.flags)
    }

    pub fn payload_type(&self) -> Option<HfiPayloadType> {
        HfiPayloadType::n(self.payload_info)
    }
}

/// Buffer descriptor exchanged in the payload of `HFI_CMD_BUFFER`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct HfiBuffer {
    pub buffer_type: u32,
    pub index: u32,
    pub base_address: u64,
    pub addr_offset: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub buffer_size: u32,
    pub timestamp: i64,
    pub flags: u32,
    pub reserved: u32,
}

pub const HFI_BUFFER_SIZE: usize = std::mem::size_of::<HfiBuffer>();

impl HfiBuffer {
    pub fn flags(&self) -> HfiBufferFlags {
        HfiBufferFlags::from_bits_retain(self.flags)
    }
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("response of {0} bytes is too short")]
    Truncated(usize),
    #[error("header size {size} invalid for a response of {len} bytes")]
    HeaderSize { size: u32, len: usize },
    #[error("response contains no packets")]
    NoPackets,
    #[error("packet {index} has invalid size {size}")]
    PacketSize { index: u32, size: u32 },
    #[error("packet {index} overruns the response")]
    Overrun { index: u32 },
    #[error("payload of type {0:?} has invalid size {1}")]
    PayloadSize(HfiPayloadType, usize),
    #[error("unknown payload type {0}")]
    PayloadType(u32),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport failed to post message: errno {0}")]
    Transport(i32),
}

/// A validated packet borrowed from a firmware response.
#[derive(Debug, Clone, Copy)]
pub struct ResponsePacket<'a> {
    pub header: HfiPacket,
    pub payload: &'a [u8],
}

impl<'a> ResponsePacket<'a> {
    /// Checks the payload size against the declared payload type. Arrays, blobs and strings must
    /// simply not be empty.
    pub fn check_payload(&self) -> Result<(), PacketError> {
        let payload_type = self
            .header
            .payload_type()
            .ok_or(PacketError::PayloadType(self.header.payload_info))?;
        let ok = match payload_type.fixed_size() {
            Some(size) => self.payload.len() == size,
            None => match payload_type {
                HfiPayloadType::NONE => self.payload.is_empty(),
                HfiPayloadType::STRUCTURE => {
                    self.header.pkt_type != HFI_CMD_BUFFER || self.payload.len() == HFI_BUFFER_SIZE
                }
                _ => !self.payload.is_empty(),
            },
        };
        if ok {
            Ok(())
        } else {
            Err(PacketError::PayloadSize(payload_type, self.payload.len()))
        }
    }

    pub fn read_u32(&self) -> Result<u32, PacketError> {
        let mut reader = self.payload;
        Ok(reader.read_obj::<u32>()?)
    }

    pub fn read_u32_at(&self, index: usize) -> Result<u32, PacketError> {
        let start = index * 4;
        let mut reader = self.payload.get(start..).unwrap_or_default();
        Ok(reader.read_obj::<u32>()?)
    }

    pub fn read_u32_array(&self) -> Result<Vec<u32>, PacketError> {
        let mut reader = self.payload;
        let mut out = Vec::with_capacity(self.payload.len() / 4);
        while reader.len() >= 4 {
            out.push(reader.read_obj::<u32>()?);
        }
        Ok(out)
    }

    pub fn read_u64_array(&self) -> Result<Vec<u64>, PacketError> {
        let mut reader = self.payload;
        let mut out = Vec::with_capacity(self.payload.len() / 8);
        while reader.len() >= 8 {
            out.push(reader.read_obj::<u64>()?);
        }
        Ok(out)
    }

    pub fn read_buffer(&self) -> Result<HfiBuffer, PacketError> {
        if self.payload.len() != HFI_BUFFER_SIZE {
            return Err(PacketError::PayloadSize(
                HfiPayloadType::STRUCTURE,
                self.payload.len(),
            ));
        }
        let mut reader = self.payload;
        Ok(reader.read_obj::<HfiBuffer>()?)
    }
}

/// Validates the header of a firmware response and splits it into its packets.
pub fn parse_response(bytes: &[u8]) -> Result<(HfiHeader, Vec<ResponsePacket>), PacketError> {
    if bytes.len() < HFI_HEADER_SIZE + HFI_PACKET_SIZE {
        return Err(PacketError::Truncated(bytes.len()));
    }
    let mut reader = bytes;
    let header: HfiHeader = reader.read_obj()?;
    let total = header.size as usize;
    if total < HFI_HEADER_SIZE + HFI_PACKET_SIZE || total > bytes.len() {
        return Err(PacketError::HeaderSize {
            size: header.size,
            len: bytes.len(),
        });
    }
    if header.num_packets == 0 {
        return Err(PacketError::NoPackets);
    }

    let mut packets = Vec::with_capacity(header.num_packets as usize);
    let mut offset = HFI_HEADER_SIZE;
    for index in 0..header.num_packets {
        if offset + HFI_PACKET_SIZE > total {
            return Err(PacketError::Overrun { index });
        }
        let mut reader = &bytes[offset..total];
        let pkt: HfiPacket = reader.read_obj()?;
        let size = pkt.size as usize;
        if size < HFI_PACKET_SIZE {
            return Err(PacketError::PacketSize {
                index,
                size: pkt.size,
            });
        }
        if offset + size > total {
            return Err(PacketError::Overrun { index });
        }
        packets.push(ResponsePacket {
            header: pkt,
            payload: &bytes[offset + HFI_PACKET_SIZE..offset + size],
        });
        offset += size;
    }

    Ok((header, packets))
}

/// Builds a message of one or more packets for the firmware.
pub struct PacketWriter {
    session_id: u32,
    header_id: u32,
    num_packets: u32,
    body: Vec<u8>,
}

impl PacketWriter {
    pub fn new(session_id: u32, header_id: u32) -> Self {
        Self {
            session_id,
            header_id,
            num_packets: 0,
            body: Vec::new(),
        }
    }

    pub fn add_packet(
        &mut self,
        pkt_type: u32,
        flags: HfiPacketFlags,
        port: HfiPort,
        payload_type: HfiPayloadType,
        payload: &[u8],
    ) -> Result<&mut Self, PacketError> {
        self.body.write_obj(HfiPacket {
            size: (HFI_PACKET_SIZE + payload.len()) as u32,
            pkt_type,
            port: port as u32,
            flags: flags.bits(),
            payload_info: payload_type as u32,
        })?;
        self.body.extend_from_slice(payload);
        self.num_packets += 1;
        Ok(self)
    }

    pub fn add_u32(
        &mut self,
        pkt_type: u32,
        port: HfiPort,
        payload_type: HfiPayloadType,
        value: u32,
    ) -> Result<&mut Self, PacketError> {
        let mut payload = Vec::with_capacity(4);
        payload.write_obj(value)?;
        self.add_packet(
            pkt_type,
            HfiPacketFlags::RESPONSE_REQUIRED | HfiPacketFlags::NON_DISCARDABLE,
            port,
            payload_type,
            &payload,
        )
    }

    pub fn add_buffer(
        &mut self,
        pkt_type: u32,
        port: HfiPort,
        buffer: HfiBuffer,
    ) -> Result<&mut Self, PacketError> {
        let mut payload = Vec::with_capacity(HFI_BUFFER_SIZE);
        payload.write_obj(buffer)?;
        self.add_packet(
            pkt_type,
            HfiPacketFlags::RESPONSE_REQUIRED | HfiPacketFlags::NON_DISCARDABLE,
            port,
            HfiPayloadType::STRUCTURE,
            &payload,
        )
    }

    pub fn num_packets(&self) -> u32 {
        self.num_packets
    }

    pub fn finish(self) -> Result<Vec<u8>, PacketError> {
        let mut out = Vec::with_capacity(HFI_HEADER_SIZE + self.body.len());
        out.write_obj(HfiHeader {
            size: (HFI_HEADER_SIZE + self.body.len()) as u32,
            session_id: self.session_id,
            num_packets: self.num_packets,
            header_id: self.header_id,
            reserved: [0; 4],
        })?;
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

/// Builds and posts messages on behalf of one session, stamping each with a fresh header id.
pub struct CommandSender<'a> {
    session_id: u32,
    header_id: &'a mut u32,
    transport: &'a mut dyn HfiTransport,
}

impl<'a> CommandSender<'a> {
    pub fn new(
        session_id: u32,
        header_id: &'a mut u32,
        transport: &'a mut dyn HfiTransport,
    ) -> Self {
        Self {
            session_id,
            header_id,
            transport,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Returns an empty message for this session.
    pub fn writer(&mut self) -> PacketWriter {
        *self.header_id = self.header_id.wrapping_add(1);
        PacketWriter::new(self.session_id, *self.header_id)
    }

    /// Posts `writer` to the firmware. Messages without packets are silently dropped.
    pub fn send(&mut self, writer: PacketWriter) -> Result<(), PacketError> {
        if writer.num_packets() == 0 {
            return Ok(());
        }
        let message = writer.finish()?;
        self.transport
            .post(&message)
            .map_err(PacketError::Transport)
    }

    /// Posts a single command packet, with a `u32` payload if `value` is given.
    pub fn command(
        &mut self,
        pkt_type: u32,
        port: HfiPort,
        value: Option<(HfiPayloadType, u32)>,
    ) -> Result<(), PacketError> {
        let mut writer = self.writer();
        match value {
            Some((payload_type, value)) => {
                writer.add_u32(pkt_type, port, payload_type, value)?;
            }
            None => {
                writer.add_packet(
                    pkt_type,
                    HfiPacketFlags::RESPONSE_REQUIRED | HfiPacketFlags::NON_DISCARDABLE,
                    port,
                    HfiPayloadType::NONE,
                    &[],
                )?;
            }
        }
        self.send(writer)
    }

    /// Posts one `HFI_CMD_BUFFER` packet per descriptor, in a single message.
    pub fn buffers(&mut self, buffers: &[(HfiPort, HfiBuffer)]) -> Result<(), PacketError> {
        let mut writer = self.writer();
        for (port, buffer) in buffers {
            writer.add_buffer(HFI_CMD_BUFFER, *port, *buffer)?;
        }
        self.send(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes() {
        assert_eq!(HFI_HEADER_SIZE, 32);
        assert_eq!(HFI_PACKET_SIZE, 20);
        assert_eq!(HFI_BUFFER_SIZE, 48);
    }

    #[test]
    fn parse_written_message() {
        let mut writer = PacketWriter::new(7, 3);
        writer
            .add_u32(HFI_CMD_START, HfiPort::RAW, HfiPayloadType::U32, 1)
            .unwrap()
            .add_buffer(
                HFI_CMD_BUFFER,
                HfiPort::BITSTREAM,
                HfiBuffer {
                    buffer_type: HfiBufferType::BITSTREAM as u32,
                    index: 4,
                    base_address: 0x1000,
                    ..Default::default()
                },
            )
            .unwrap();
        let bytes = writer.finish().unwrap();

        let (header, packets) = parse_response(&bytes).unwrap();
        assert_eq!(header.session_id, 7);
        assert_eq!(header.header_id, 3);
        assert_eq!(header.num_packets, 2);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].read_u32().unwrap(), 1);
        assert_eq!(packets[1].header.port, HfiPort::BITSTREAM as u32);
        let buf = packets[1].read_buffer().unwrap();
        assert_eq!(buf.index, 4);
        assert_eq!(buf.base_address, 0x1000);
        packets[1].check_payload().unwrap();
    }

    #[test]
    fn reject_bad_headers() {
        assert!(matches!(
            parse_response(&[0u8; 10]),
            Err(PacketError::Truncated(10))
        ));

        let mut writer = PacketWriter::new(1, 0);
        writer
            .add_packet(
                HFI_CMD_OPEN,
                HfiPacketFlags::SUCCESS,
                HfiPort::NONE,
                HfiPayloadType::NONE,
                &[],
            )
            .unwrap();
        let good = writer.finish().unwrap();

        // Declared size larger than what was received.
        let mut bad = good.clone();
        bad[0..4].copy_from_slice(&((good.len() + 4) as u32).to_le_bytes());
        assert!(matches!(
            parse_response(&bad),
            Err(PacketError::HeaderSize { .. })
        ));

        // No packets.
        let mut bad = good.clone();
        bad[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(parse_response(&bad), Err(PacketError::NoPackets)));

        // Packet of size zero.
        let mut bad = good.clone();
        bad[32..36].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            parse_response(&bad),
            Err(PacketError::PacketSize { index: 0, size: 0 })
        ));

        // Packet extends past the declared size.
        let mut bad = good.clone();
        bad[32..36].copy_from_slice(&64u32.to_le_bytes());
        assert!(matches!(
            parse_response(&bad),
            Err(PacketError::Overrun { index: 0 })
        ));

        // Two packets announced, one present.
        let mut bad = good;
        bad[8..12].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            parse_response(&bad),
            Err(PacketError::Overrun { index: 1 })
        ));
    }

    #[test]
    fn payload_size_checks() {
        let pkt = ResponsePacket {
            header: HfiPacket {
                size: 28,
                pkt_type: HFI_PROP_PROFILE,
                port: 1,
                flags: 0,
                payload_info: HfiPayloadType::U32 as u32,
            },
            payload: &[0u8; 8],
        };
        assert!(matches!(
            pkt.check_payload(),
            Err(PacketError::PayloadSize(HfiPayloadType::U32, 8))
        ));

        let pkt = ResponsePacket {
            header: HfiPacket {
                payload_info: HfiPayloadType::U64 as u32,
                ..pkt.header
            },
            ..pkt
        };
        pkt.check_payload().unwrap();

        let pkt = ResponsePacket {
            header: HfiPacket {
                payload_info: 99,
                ..pkt.header
            },
            ..pkt
        };
        assert!(matches!(
            pkt.check_payload(),
            Err(PacketError::PayloadType(99))
        ));
    }

    #[derive(Default)]
    struct Recorder {
        messages: Vec<Vec<u8>>,
        fail: bool,
    }

    impl HfiTransport for Recorder {
        fn post(&mut self, message: &[u8]) -> Result<(), i32> {
            if self.fail {
                return Err(libc::EIO);
            }
            self.messages.push(message.to_vec());
            Ok(())
        }
    }

    #[test]
    fn sender_stamps_header_ids() {
        let mut transport = Recorder::default();
        let mut header_id = 0;
        let mut sender = CommandSender::new(5, &mut header_id, &mut transport);
        sender
            .command(HFI_CMD_START, HfiPort::BITSTREAM, None)
            .unwrap();
        sender
            .command(
                HFI_CMD_RESUME,
                HfiPort::RAW,
                Some((HfiPayloadType::U32, 0)),
            )
            .unwrap();
        // Nothing to post.
        sender.buffers(&[]).unwrap();
        assert_eq!(header_id, 3);

        assert_eq!(transport.messages.len(), 2);
        let (header, packets) = parse_response(&transport.messages[1]).unwrap();
        assert_eq!(header.session_id, 5);
        assert_eq!(header.header_id, 2);
        assert_eq!(packets[0].header.pkt_type, HFI_CMD_RESUME);

        transport.fail = true;
        let mut sender = CommandSender::new(5, &mut header_id, &mut transport);
        assert!(matches!(
            sender.command(HFI_CMD_STOP, HfiPort::RAW, None),
            Err(PacketError::Transport(libc::EIO))
        ));
    }
}
