// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer sizing formulas.
//!
//! Sizes are derived from the coded resolution and a few capabilities, and rounded to the 4K
//! granularity the firmware maps buffers with.

use crate::buffer::BufferType;
use crate::capability::CapId;
use crate::capability::CapabilityTable;
use crate::capability::RC_CQ;
use crate::capability::RC_OFF;
use crate::Codec;
use crate::Domain;

/// Linear NV12 output. Any other color format is compressed and decoded in place.
pub const COLOR_FMT_NV12: i32 = 0;

const ALIGN_4K: u32 = 4096;
const META_BUFFER_SIZE: u32 = 16 * 1024;
const ENC_ARP_SIZE: u32 = 204_800;

const NUM_MBS_720P: u32 = (1280 / 16) * (720 / 16);
const NUM_MBS_4K: u32 = (4096 / 16) * (2304 / 16);

const MIN_DEC_INPUT_BUFFERS: u32 = 4;
const MIN_ENC_INPUT_BUFFERS: u32 = 4;
const MIN_ENC_OUTPUT_BUFFERS: u32 = 4;
const DEFAULT_EXTRA_COUNT: u32 = 2;

/// Size and count a pool must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Requirement {
    pub size: u32,
    pub min_count: u32,
    pub extra_count: u32,
}

fn align(value: u32, to: u32) -> u32 {
    value.div_ceil(to).saturating_mul(to)
}

fn num_mbs(width: u32, height: u32) -> u32 {
    (align(width, 16) / 16) * (align(height, 16) / 16)
}

/// Size of an NV12 frame with the firmware's stride and scanline alignment.
pub fn nv12_size(width: u32, height: u32) -> u32 {
    let stride = align(width, 128);
    let y_plane = stride * align(height, 32);
    let uv_plane = stride * align(height.div_ceil(2), 16);
    align(y_plane + uv_plane, ALIGN_4K)
}

fn decoder_input_size(width: u32, height: u32) -> u32 {
    let mbs = num_mbs(width, height);
    let (base_mbs, div) = if mbs > NUM_MBS_4K {
        (mbs, 4)
    } else {
        (mbs.max(NUM_MBS_720P), 2)
    };
    align(base_mbs * 256 * 3 / 2 / div, ALIGN_4K)
}

fn encoder_output_size(width: u32, height: u32, rate_control: i32) -> u32 {
    let frame = align(width, 32) * align(height, 32) * 3 / 2;
    // Constant quality and disabled rate control can produce frames larger than the raw input.
    let size = match rate_control {
        RC_CQ | RC_OFF => frame,
        _ => frame / 2,
    };
    align(size, ALIGN_4K)
}

fn persist_size(codec: Codec) -> u32 {
    match codec {
        Codec::H264 => 0xa_0000,
        Codec::Hevc => 0x10_0000,
        Codec::Vp9 => 0x8_4000,
        Codec::Av1 => 0x40_0000,
    }
}

fn output_min_count(caps: &CapabilityTable) -> u32 {
    match caps.domain() {
        Domain::Decoder => caps.value(CapId::MIN_BUFFERS_OUTPUT).max(1) as u32,
        Domain::Encoder => MIN_ENC_OUTPUT_BUFFERS,
    }
}

/// Returns what a pool of `buffer_type` needs for the current configuration of `caps`. A
/// `min_count` of 0 means the buffer is not used by this session.
pub fn requirement(caps: &CapabilityTable, buffer_type: BufferType) -> Requirement {
    let width = caps.value(CapId::FRAME_WIDTH).max(0) as u32;
    let height = caps.value(CapId::FRAME_HEIGHT).max(0) as u32;
    let pipes = caps.value(CapId::PIPE).max(1) as u32;
    let mbs = num_mbs(width, height);
    let codec = caps.codec();
    let domain = caps.domain();

    let (size, min_count) = match (domain, buffer_type) {
        (Domain::Decoder, BufferType::Input) => {
            (decoder_input_size(width, height), MIN_DEC_INPUT_BUFFERS)
        }
        (Domain::Decoder, BufferType::Output) => (nv12_size(width, height), output_min_count(caps)),
        (Domain::Encoder, BufferType::Input) => (nv12_size(width, height), MIN_ENC_INPUT_BUFFERS),
        (Domain::Encoder, BufferType::Output) => (
            encoder_output_size(width, height, caps.value(CapId::BITRATE_MODE)),
            output_min_count(caps),
        ),
        (_, BufferType::InputMeta) => (META_BUFFER_SIZE, MIN_DEC_INPUT_BUFFERS),
        (_, BufferType::OutputMeta) => (META_BUFFER_SIZE, output_min_count(caps)),

        (_, BufferType::Bin) => (align(mbs * 384, ALIGN_4K) * pipes, 1),
        (Domain::Decoder, BufferType::Comv) => match codec {
            Codec::Vp9 => (0, 0),
            _ => {
                let frames = output_min_count(caps) + 1;
                (align(mbs * 64 * frames, ALIGN_4K), 1)
            }
        },
        (Domain::Encoder, BufferType::Comv) => {
            let frames = caps.value(CapId::B_FRAME).max(0) as u32 + 2;
            (align(mbs * 64 * frames, ALIGN_4K), 1)
        }
        (Domain::Decoder, BufferType::NonComv) => match codec {
            Codec::H264 | Codec::Hevc => (align(mbs * 16 + 64 * 1024, ALIGN_4K), 1),
            _ => (0, 0),
        },
        (Domain::Encoder, BufferType::NonComv) => (align(mbs * 32 + 64 * 1024, ALIGN_4K), 1),
        (_, BufferType::Line) => (align(align(width, 16) * 128 * pipes, ALIGN_4K), 1),
        (Domain::Decoder, BufferType::Persist) => (persist_size(codec), 1),
        (Domain::Decoder, BufferType::PartialData) => match codec {
            Codec::Av1 => (align(mbs * 256, ALIGN_4K), 1),
            _ => (0, 0),
        },
        (Domain::Decoder, BufferType::Dpb) => {
            // Compressed output is decoded in place. Linear output needs its own references.
            if caps.value(CapId::PIX_FMTS) == COLOR_FMT_NV12 {
                (nv12_size(width, height), output_min_count(caps))
            } else {
                (0, 0)
            }
        }
        (Domain::Encoder, BufferType::Dpb) => {
            let recon = caps.value(CapId::LTR_COUNT).max(0) as u32
                + caps.value(CapId::ENH_LAYER_COUNT).max(0) as u32
                + 2;
            (nv12_size(width, height), recon)
        }
        (Domain::Encoder, BufferType::Arp) => (ENC_ARP_SIZE, 1),
        (Domain::Encoder, BufferType::Vpss) => (nv12_size(width, height), 1),
        _ => (0, 0),
    };

    let extra_count = match buffer_type {
        BufferType::Input | BufferType::Output if min_count > 0 => DEFAULT_EXTRA_COUNT,
        _ => 0,
    };
    Requirement {
        size: if min_count > 0 { size } else { 0 },
        min_count: if size > 0 { min_count } else { 0 },
        extra_count,
    }
}
