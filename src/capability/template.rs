// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capability database: the set of capabilities each (domain, codec) pair starts with, their
//! ranges, defaults, dependencies and wire mapping.
//!
//! This is a subset of what the firmware supports: the controls the session logic reads, adjusts
//! or sends. Controls with no effect on session behavior are left out.
//!
//! Entry order matters: it is the tie-break order of the dependency resolution.

use crate::capability::*;
use crate::protocol::*;
use crate::Codec;
use crate::Domain;

pub const MAX_BITRATE: i32 = 245_000_000;
pub const MAX_LTR_COUNT: i32 = 2;
pub const MAX_ENH_LAYERS: i32 = 5;

const DYN: CapFlags = CapFlags::DYNAMIC_ALLOWED;
const MENU: CapFlags = CapFlags::MENU;

fn profile(codec: Codec) -> (i32, i32, i32) {
    // (min, max, default)
    match codec {
        Codec::H264 => (
            H264_PROFILE_BASELINE,
            H264_PROFILE_CONSTRAINED_HIGH,
            H264_PROFILE_HIGH,
        ),
        Codec::Hevc => (0, 2, 0),
        Codec::Vp9 => (0, 3, 0),
        Codec::Av1 => (0, 0, 0),
    }
}

fn common(domain: Domain, codec: Codec) -> Vec<Capability> {
    // Encoder properties target the bitstream it produces, decoder ones the bitstream it
    // consumes. Both are on the BITSTREAM port.
    let port = HfiPort::BITSTREAM;
    let (profile_min, profile_max, profile_default) = profile(codec);
    let (height, out_port) = match domain {
        Domain::Encoder => (1080, HfiPort::RAW),
        Domain::Decoder => (240, HfiPort::RAW),
    };

    vec![
        Capability::new(CapId::FRAME_WIDTH, 96, 8192, 1, 1920),
        Capability::new(CapId::FRAME_HEIGHT, 96, 8192, 1, height),
        Capability::new(CapId::PIX_FMTS, 0, 7, 1, 0).hfi(
            HFI_PROP_COLOR_FORMAT,
            out_port,
            Setter::U32Enum,
        ),
        Capability::new(CapId::SECURE_MODE, 0, 1, 1, 0).hfi(HFI_PROP_SECURE, port, Setter::U32),
        Capability::new(CapId::STAGE, 1, 2, 1, 2).hfi(HFI_PROP_STAGE, port, Setter::U32),
        Capability::new(CapId::PIPE, 1, 4, 1, 4).hfi(HFI_PROP_PIPE, port, Setter::U32),
        Capability::new(CapId::INPUT_META_ENABLE, 0, 1, 1, 0),
        Capability::new(CapId::OUTPUT_META_ENABLE, 0, 1, 1, 0),
        Capability::new(
            CapId::PROFILE,
            profile_min,
            profile_max,
            1,
            profile_default,
        )
        .flags(MENU)
        .hfi(HFI_PROP_PROFILE, port, Setter::U32Enum),
        Capability::new(CapId::LEVEL, 0, 20, 1, 0)
            .flags(MENU)
            .hfi(HFI_PROP_LEVEL, port, Setter::U32Enum),
    ]
}

fn encoder(codec: Codec) -> Vec<Capability> {
    let port = HfiPort::BITSTREAM;
    let mut caps = vec![
        Capability::new(CapId::BITRATE_MODE, RC_VBR, RC_OFF, 1, RC_VBR)
            .flags(MENU)
            .hfi(HFI_PROP_RATE_CONTROL, port, Setter::U32Enum),
        Capability::new(CapId::ALL_INTRA, 0, 1, 1, 0),
        Capability::new(CapId::ENH_LAYER_COUNT, 0, MAX_ENH_LAYERS, 1, 0)
            .flags(DYN)
            .hfi(HFI_PROP_LAYER_COUNT, port, Setter::U32),
        Capability::new(CapId::LAYER_TYPE, LAYER_HIER_B, LAYER_HIER_P, 1, LAYER_HIER_P)
            .flags(MENU)
            .hfi(HFI_PROP_LAYER_ENCODING_TYPE, port, Setter::U32Enum),
        Capability::new(CapId::BIT_RATE, 1, MAX_BITRATE, 1, 20_000_000)
            .flags(DYN)
            .parents(&[CapId::ENH_LAYER_COUNT])
            .adjust(Adjust::BitRate)
            .hfi(HFI_PROP_TOTAL_BITRATE, port, Setter::Bitrate),
    ];

    for layer in [
        CapId::L0_BR,
        CapId::L1_BR,
        CapId::L2_BR,
        CapId::L3_BR,
        CapId::L4_BR,
        CapId::L5_BR,
    ] {
        caps.push(
            Capability::new(layer, 1, MAX_BITRATE, 1, 20_000_000)
                .flags(DYN)
                .adjust(Adjust::DynamicLayerBitrate),
        );
    }

    caps.extend([
        Capability::new(CapId::PEAK_BITRATE, 1, MAX_BITRATE, 1, 20_000_000)
            .flags(DYN)
            .parents(&[CapId::BIT_RATE])
            .adjust(Adjust::PeakBitrate)
            .hfi(HFI_PROP_TOTAL_PEAK_BITRATE, port, Setter::U32),
        Capability::new(CapId::GOP_SIZE, 0, i32::MAX, 1, 60)
            .flags(DYN)
            .parents(&[CapId::ENH_LAYER_COUNT])
            .adjust(Adjust::GopSize)
            .hfi(HFI_PROP_MAX_GOP_FRAMES, port, Setter::U32),
        Capability::new(CapId::B_FRAME, 0, 7, 1, 0)
            .parents(&[CapId::ENH_LAYER_COUNT, CapId::LAYER_TYPE])
            .adjust(Adjust::BFrame)
            .hfi(HFI_PROP_MAX_B_FRAMES, port, Setter::U32),
        Capability::new(CapId::SLICE_MODE, SLICE_MODE_SINGLE, SLICE_MODE_MAX_BYTES, 1, 0)
            .flags(MENU)
            .hfi(HFI_PROP_MULTI_SLICE_MB_COUNT, port, Setter::U32),
        Capability::new(
            CapId::DELIVERY_MODE,
            DELIVERY_FRAME_BASED,
            DELIVERY_SLICE_BASED,
            1,
            DELIVERY_FRAME_BASED,
        )
        .flags(MENU)
        .parents(&[CapId::SLICE_MODE])
        .adjust(Adjust::DeliveryMode)
        .hfi(HFI_PROP_ENABLE_SLICE_DELIVERY, port, Setter::U32),
        Capability::new(CapId::LTR_COUNT, 0, MAX_LTR_COUNT, 1, 0)
            .parents(&[CapId::BITRATE_MODE, CapId::ALL_INTRA])
            .adjust(Adjust::LtrCount)
            .hfi(HFI_PROP_LTR_COUNT, port, Setter::U32),
        Capability::new(CapId::USE_LTR, 0, (1 << MAX_LTR_COUNT) - 1, 0, 0)
            .flags(DYN | CapFlags::BITMASK)
            .adjust(Adjust::UseLtr)
            .hfi(HFI_PROP_LTR_USE, port, Setter::U32),
        Capability::new(CapId::MARK_LTR, 0, MAX_LTR_COUNT - 1, 1, 0)
            .flags(DYN)
            .adjust(Adjust::MarkLtr)
            .hfi(HFI_PROP_LTR_MARK, port, Setter::U32),
        Capability::new(CapId::MIN_FRAME_QP, 0, 51, 1, 10)
            .flags(DYN)
            .hfi(HFI_PROP_MIN_QP_PACKED, port, Setter::QpPacked),
        Capability::new(CapId::MAX_FRAME_QP, 0, 51, 1, 51)
            .flags(DYN)
            .parents(&[CapId::MIN_FRAME_QP])
            .adjust(Adjust::MaxQp)
            .hfi(HFI_PROP_MAX_QP_PACKED, port, Setter::QpPacked),
    ]);

    if codec == Codec::H264 {
        caps.extend([
            Capability::new(CapId::ENTROPY_MODE, ENTROPY_CAVLC, ENTROPY_CABAC, 1, ENTROPY_CABAC)
                .flags(MENU)
                .parents(&[CapId::PROFILE])
                .adjust(Adjust::EntropyMode)
                .hfi(HFI_PROP_CABAC_SESSION, port, Setter::U32),
            Capability::new(CapId::TRANSFORM_8X8, 0, 1, 1, 1)
                .parents(&[CapId::PROFILE])
                .adjust(Adjust::Transform8x8)
                .hfi(HFI_PROP_8X8_TRANSFORM, port, Setter::U32),
        ]);
    }

    caps
}

fn decoder(codec: Codec) -> Vec<Capability> {
    let port = HfiPort::BITSTREAM;
    let mut caps = vec![
        Capability::new(CapId::MIN_BUFFERS_OUTPUT, 0, 64, 1, 4),
        Capability::new(CapId::LOWLATENCY_MODE, 0, 1, 1, 0).hfi(
            HFI_PROP_LOW_LATENCY,
            port,
            Setter::U32,
        ),
        Capability::new(CapId::OUTPUT_ORDER, 0, 1, 1, 0).hfi(
            HFI_PROP_DECODE_ORDER_OUTPUT,
            port,
            Setter::U32,
        ),
        Capability::new(CapId::META_OUTBUF_FENCE, 0, 1, 1, 0)
            .parents(&[CapId::OUTPUT_ORDER])
            .adjust(Adjust::OutbufFence)
            .hfi(HFI_PROP_ENABLE_FENCE, port, Setter::U32),
        Capability::new(CapId::EARLY_NOTIFY_ENABLE, 0, 1, 1, 0)
            .parents(&[
                CapId::LOWLATENCY_MODE,
                CapId::OUTPUT_ORDER,
                CapId::META_OUTBUF_FENCE,
            ])
            .adjust(Adjust::EarlyNotifyEnable)
            .hfi(HFI_PROP_EARLY_NOTIFY_ENABLE, port, Setter::U32),
        Capability::new(CapId::EARLY_NOTIFY_LINE_COUNT, 0, 8192, 1, 0)
            .flags(DYN)
            .parents(&[CapId::EARLY_NOTIFY_ENABLE])
            .adjust(Adjust::EarlyNotifyLineCount)
            .hfi(HFI_PROP_EARLY_NOTIFY_LINE_COUNT, port, Setter::U32),
        Capability::new(CapId::EARLY_NOTIFY_FENCE_COUNT, 0, MAX_FENCE_COUNT, 1, 0)
            .flags(CapFlags::ALWAYS_REEVALUATE)
            .parents(&[CapId::EARLY_NOTIFY_LINE_COUNT])
            .adjust(Adjust::EarlyNotifyFenceCount)
            .hfi(HFI_PROP_EARLY_NOTIFY_FENCE_COUNT, port, Setter::U32),
        Capability::new(CapId::LAST_FLAG_EVENT_ENABLE, 0, 1, 1, 0),
        Capability::new(CapId::POC, 0, 2, 1, 0),
    ];

    if codec != Codec::Av1 {
        caps.push(Capability::new(CapId::DPB_LIST, 0, 1, 1, 0));
    }

    caps
}

/// Returns the capabilities a new session of `domain` and `codec` starts with.
pub fn template(domain: Domain, codec: Codec) -> Vec<Capability> {
    let mut caps = common(domain, codec);
    caps.extend(match domain {
        Domain::Encoder => encoder(codec),
        Domain::Decoder => decoder(codec),
    });
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_duplicates() {
        for domain in [Domain::Encoder, Domain::Decoder] {
            for codec in [Codec::H264, Codec::Hevc, Codec::Vp9, Codec::Av1] {
                let caps = template(domain, codec);
                let mut ids: Vec<CapId> = caps.iter().map(|c| c.id).collect();
                ids.sort();
                ids.dedup();
                assert_eq!(ids.len(), caps.len(), "{:?} {:?}", domain, codec);
                for cap in &caps {
                    assert!(
                        cap.flags.contains(CapFlags::BITMASK)
                            || (cap.min..=cap.max).contains(&cap.value),
                        "{:?} default out of range",
                        cap.id
                    );
                }
            }
        }
    }

    #[test]
    fn codec_specific_entries() {
        let h264 = template(Domain::Encoder, Codec::H264);
        assert!(h264.iter().any(|c| c.id == CapId::ENTROPY_MODE));
        let hevc = template(Domain::Encoder, Codec::Hevc);
        assert!(!hevc.iter().any(|c| c.id == CapId::ENTROPY_MODE));
        let av1 = template(Domain::Decoder, Codec::Av1);
        assert!(!av1.iter().any(|c| c.id == CapId::DPB_LIST));
        assert!(!av1.iter().any(|c| c.id == CapId::BIT_RATE));
    }
}
