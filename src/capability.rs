// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-session capability table and its dependency graph.
//!
//! Each capability can declare parents whose values it derives from. The table computes a
//! topological order over these edges once per session, adjusts values in that order, and
//! serializes the ones that changed into property packets for the firmware. When a capability is
//! changed while streaming, the change is propagated to its children breadth-first.

pub mod template;

use std::collections::BTreeMap;
use std::collections::VecDeque;

use bitflags::bitflags;
use enumn::N;
use log::debug;
use log::error;
use log::warn;
use thiserror::Error;

use crate::protocol::*;
use crate::Codec;
use crate::Domain;

/// Maximum number of early-notify fences per frame.
pub const MAX_FENCE_COUNT: i32 = 32;

pub const RC_VBR: i32 = 0;
pub const RC_CBR: i32 = 1;
pub const RC_CQ: i32 = 2;
pub const RC_OFF: i32 = 3;

pub const LAYER_HIER_B: i32 = 0;
pub const LAYER_HIER_P: i32 = 1;

pub const H264_PROFILE_BASELINE: i32 = 0;
pub const H264_PROFILE_CONSTRAINED_BASELINE: i32 = 1;
pub const H264_PROFILE_MAIN: i32 = 2;
pub const H264_PROFILE_HIGH: i32 = 4;
pub const H264_PROFILE_CONSTRAINED_HIGH: i32 = 5;

pub const ENTROPY_CAVLC: i32 = 0;
pub const ENTROPY_CABAC: i32 = 1;

pub const SLICE_MODE_SINGLE: i32 = 0;
pub const SLICE_MODE_MAX_MB: i32 = 1;
pub const SLICE_MODE_MAX_BYTES: i32 = 2;

pub const DELIVERY_FRAME_BASED: i32 = 0;
pub const DELIVERY_SLICE_BASED: i32 = 1;

#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug, Hash)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum CapId {
    FRAME_WIDTH = 1,
    FRAME_HEIGHT,
    PIX_FMTS,
    MIN_BUFFERS_OUTPUT,
    SECURE_MODE,
    STAGE,
    PIPE,
    INPUT_META_ENABLE,
    OUTPUT_META_ENABLE,
    BITRATE_MODE,
    ALL_INTRA,
    ENH_LAYER_COUNT,
    LAYER_TYPE,
    BIT_RATE,
    L0_BR,
    L1_BR,
    L2_BR,
    L3_BR,
    L4_BR,
    L5_BR,
    PEAK_BITRATE,
    GOP_SIZE,
    B_FRAME,
    PROFILE,
    LEVEL,
    ENTROPY_MODE,
    TRANSFORM_8X8,
    SLICE_MODE,
    DELIVERY_MODE,
    LTR_COUNT,
    USE_LTR,
    MARK_LTR,
    MIN_FRAME_QP,
    MAX_FRAME_QP,
    LOWLATENCY_MODE,
    OUTPUT_ORDER,
    META_OUTBUF_FENCE,
    EARLY_NOTIFY_ENABLE,
    EARLY_NOTIFY_LINE_COUNT,
    EARLY_NOTIFY_FENCE_COUNT,
    LAST_FLAG_EVENT_ENABLE,
    DPB_LIST,
    POC,
}

const LAYER_BITRATES: [CapId; 6] = [
    CapId::L0_BR,
    CapId::L1_BR,
    CapId::L2_BR,
    CapId::L3_BR,
    CapId::L4_BR,
    CapId::L5_BR,
];

const LAYER_BITRATE_PROPS: [u32; 6] = [
    HFI_PROP_BITRATE_LAYER1,
    HFI_PROP_BITRATE_LAYER2,
    HFI_PROP_BITRATE_LAYER3,
    HFI_PROP_BITRATE_LAYER4,
    HFI_PROP_BITRATE_LAYER5,
    HFI_PROP_BITRATE_LAYER6,
];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CapFlags: u32 {
        const MENU = 0x01;
        const BITMASK = 0x02;
        const DYNAMIC_ALLOWED = 0x04;
        const CLIENT_SET = 0x08;
        /// Re-run this capability's adjustment whenever one of its parents is re-evaluated,
        /// even if the parent's value did not change. Only the early-notify fence count needs
        /// this, as it also depends on the frame height which is not one of its parents.
        const ALWAYS_REEVALUATE = 0x10;
    }
}

/// How a capability derives its value from its parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjust {
    None,
    EntropyMode,
    Transform8x8,
    LtrCount,
    UseLtr,
    MarkLtr,
    GopSize,
    BFrame,
    BitRate,
    DynamicLayerBitrate,
    PeakBitrate,
    MaxQp,
    DeliveryMode,
    OutbufFence,
    EarlyNotifyEnable,
    EarlyNotifyLineCount,
    EarlyNotifyFenceCount,
}

/// How a capability is serialized for the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setter {
    None,
    U32,
    S32,
    Q16,
    U32Enum,
    QpPacked,
    Bitrate,
}

#[derive(Debug, Clone)]
pub struct Capability {
    pub id: CapId,
    pub value: i32,
    pub min: i32,
    pub max: i32,
    pub step_or_mask: i32,
    pub flags: CapFlags,
    pub hfi_id: u32,
    pub port: HfiPort,
    pub parents: Vec<CapId>,
    pub children: Vec<CapId>,
    pub adjust: Adjust,
    pub setter: Setter,
}

impl Capability {
    pub(crate) fn new(id: CapId, min: i32, max: i32, step_or_mask: i32, value: i32) -> Self {
        Self {
            id,
            value,
            min,
            max,
            step_or_mask,
            flags: CapFlags::empty(),
            hfi_id: 0,
            port: HfiPort::NONE,
            parents: Vec::new(),
            children: Vec::new(),
            adjust: Adjust::None,
            setter: Setter::None,
        }
    }

    pub(crate) fn flags(mut self, flags: CapFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub(crate) fn hfi(mut self, hfi_id: u32, port: HfiPort, setter: Setter) -> Self {
        self.hfi_id = hfi_id;
        self.port = port;
        self.setter = setter;
        self
    }

    pub(crate) fn parents(mut self, parents: &[CapId]) -> Self {
        self.parents = parents.to_vec();
        self
    }

    pub(crate) fn adjust(mut self, adjust: Adjust) -> Self {
        self.adjust = adjust;
        self
    }

    fn clamp(&self, value: i32) -> i32 {
        if self.flags.contains(CapFlags::BITMASK) {
            value
        } else {
            value.clamp(self.min, self.max)
        }
    }
}

/// A single property to send to the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyPacket {
    pub cap: CapId,
    pub hfi_id: u32,
    pub port: HfiPort,
    pub payload_type: HfiPayloadType,
    pub value: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("dependency loop detected around {0:?}")]
    Cycle(CapId),
    #[error("{child:?} depends on {parent:?} which is not in the table")]
    UnknownParent { child: CapId, parent: CapId },
    #[error("{child:?} reads {parent:?} which is not one of its parents")]
    MissingParent { child: CapId, parent: CapId },
    #[error("{0:?} cannot be changed while streaming")]
    NotDynamic(CapId),
    #[error("{0:?} is not supported by this session")]
    Unsupported(CapId),
    #[error("invalid value {value} for {id:?}")]
    InvalidValue { id: CapId, value: i32 },
    #[error("invalid fence count {0}")]
    FenceCount(i32),
}

pub struct CapabilityTable {
    domain: Domain,
    codec: Codec,
    caps: BTreeMap<CapId, Capability>,
    /// Insertion order of the template, used to break ties.
    template_order: Vec<CapId>,
    /// Resolved dependency order, empty until `build_dependency_order` succeeds.
    order: Vec<CapId>,
    dirty: Vec<CapId>,
    streaming: bool,
}

impl CapabilityTable {
    /// Instantiates the table for `domain` and `codec` from the template database.
    pub fn new(domain: Domain, codec: Codec) -> Self {
        Self::from_caps(domain, codec, template::template(domain, codec))
    }

    pub(crate) fn from_caps(domain: Domain, codec: Codec, list: Vec<Capability>) -> Self {
        let template_order: Vec<CapId> = list.iter().map(|c| c.id).collect();
        let mut caps: BTreeMap<CapId, Capability> = list.into_iter().map(|c| (c.id, c)).collect();

        for id in &template_order {
            let parents = caps.get(id).map(|c| c.parents.clone()).unwrap_or_default();
            for parent in parents {
                if let Some(p) = caps.get_mut(&parent) {
                    if !p.children.contains(id) {
                        p.children.push(*id);
                    }
                }
            }
        }

        Self {
            domain,
            codec,
            caps,
            template_order,
            order: Vec::new(),
            dirty: Vec::new(),
            streaming: false,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn get(&self, id: CapId) -> Option<&Capability> {
        self.caps.get(&id)
    }

    /// Returns the current value of `id`, or 0 if the session does not have it.
    pub fn value(&self, id: CapId) -> i32 {
        self.caps.get(&id).map(|c| c.value).unwrap_or(0)
    }

    pub fn is_client_set(&self, id: CapId) -> bool {
        self.caps
            .get(&id)
            .map(|c| c.flags.contains(CapFlags::CLIENT_SET))
            .unwrap_or(false)
    }

    pub fn dependency_order(&self) -> &[CapId] {
        &self.order
    }

    pub fn dirty(&self) -> &[CapId] {
        &self.dirty
    }

    /// Tells whether the port that takes control properties is streaming. Changes made while
    /// streaming are propagated immediately and restricted to dynamic capabilities.
    pub fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
    }

    /// Computes the order in which capabilities must be adjusted so that every parent comes
    /// before its children.
    ///
    /// Nothing is modified if the graph contains a cycle or an unknown parent.
    pub fn build_dependency_order(&mut self) -> Result<(), CapabilityError> {
        if !self.order.is_empty() {
            return Ok(());
        }

        for id in &self.template_order {
            if let Some(cap) = self.caps.get(id) {
                if let Some(parent) = cap.parents.iter().find(|p| !self.caps.contains_key(p)) {
                    return Err(CapabilityError::UnknownParent {
                        child: *id,
                        parent: *parent,
                    });
                }
            }
        }

        let mut root: Vec<CapId> = Vec::new();
        let mut opt: VecDeque<CapId> = VecDeque::new();
        for id in &self.template_order {
            match self.caps.get(id) {
                Some(cap) if cap.parents.is_empty() => root.push(*id),
                Some(_) => opt.push_back(*id),
                None => (),
            }
        }

        // Promote children whose parents are all roots. `root` grows while being walked.
        let mut i = 0;
        while i < root.len() {
            let children = self
                .caps
                .get(&root[i])
                .map(|c| c.children.clone())
                .unwrap_or_default();
            for child in children {
                if root.contains(&child) {
                    continue;
                }
                if self.all_parents_in(child, &root) {
                    opt.retain(|id| *id != child);
                    root.push(child);
                }
            }
            i += 1;
        }

        // Cycle through the remaining nodes until they are all resolved. A full pass without
        // progress means a loop.
        let mut num_nodes = opt.len();
        let mut remaining = num_nodes;
        let mut pass_count = num_nodes;
        while let Some(id) = opt.pop_front() {
            pass_count -= 1;
            if self.all_parents_in(id, &root) {
                root.push(id);
                remaining -= 1;
            } else {
                opt.push_back(id);
            }

            if pass_count == 0 {
                if num_nodes == remaining && remaining != 0 {
                    let id = opt.front().copied().unwrap_or(id);
                    error!("dependency loop detected in subgraph of {} nodes", num_nodes);
                    return Err(CapabilityError::Cycle(id));
                }
                num_nodes = remaining;
                pass_count = remaining;
            }
        }

        debug!("capability order: {:?}", root);
        self.order = root;
        Ok(())
    }

    fn all_parents_in(&self, id: CapId, resolved: &[CapId]) -> bool {
        self.caps
            .get(&id)
            .map(|c| c.parents.iter().all(|p| resolved.contains(p)))
            .unwrap_or(false)
    }

    /// Reads `parent` on behalf of `child`, checking that the edge was declared.
    fn parent_value(&self, child: CapId, parent: CapId) -> Result<i32, CapabilityError> {
        let declared = self
            .caps
            .get(&child)
            .map(|c| c.parents.contains(&parent))
            .unwrap_or(false);
        match (declared, self.caps.get(&parent)) {
            (true, Some(p)) => Ok(p.value),
            _ => {
                error!("{:?} is not a parent of {:?}", parent, child);
                Err(CapabilityError::MissingParent { child, parent })
            }
        }
    }

    fn update_value(&mut self, id: CapId, value: i32) {
        if let Some(cap) = self.caps.get_mut(&id) {
            let value = cap.clamp(value);
            if cap.value != value {
                debug!("{:?}: {} -> {}", id, cap.value, value);
            }
            cap.value = value;
        }
    }

    fn mark_dirty(&mut self, id: CapId) {
        if !self.dirty.contains(&id) {
            self.dirty.push(id);
        }
    }

    /// Runs the adjustment of `id`, using `explicit` as the requested value if given, and records
    /// it as needing to be sent to the firmware.
    ///
    /// Unknown ids are ignored.
    pub fn adjust(&mut self, id: CapId, explicit: Option<i32>) -> Result<(), CapabilityError> {
        if !self.caps.contains_key(&id) {
            warn!("adjust of unknown capability {:?} ignored", id);
            return Ok(());
        }
        self.run_adjust(id, explicit)?;
        self.mark_dirty(id);
        Ok(())
    }

    /// Adjusts every capability in dependency order and marks all of them dirty.
    pub fn adjust_all(&mut self) -> Result<(), CapabilityError> {
        self.build_dependency_order()?;
        for id in self.order.clone() {
            self.run_adjust(id, None)?;
            self.mark_dirty(id);
        }
        Ok(())
    }

    /// Client entry point for changing a capability.
    ///
    /// Before streaming the value is only stored, to be adjusted when streaming starts. While
    /// streaming the capability must allow dynamic changes, and the change is propagated to its
    /// children right away.
    pub fn set_control(&mut self, id: CapId, value: i32) -> Result<(), CapabilityError> {
        let cap = self
            .caps
            .get_mut(&id)
            .ok_or(CapabilityError::Unsupported(id))?;
        if cap.flags.contains(CapFlags::MENU) && !(cap.min..=cap.max).contains(&value) {
            return Err(CapabilityError::InvalidValue { id, value });
        }

        if !self.streaming {
            cap.flags |= CapFlags::CLIENT_SET;
            cap.value = cap.clamp(value);
            return Ok(());
        }

        if !cap.flags.contains(CapFlags::DYNAMIC_ALLOWED) {
            return Err(CapabilityError::NotDynamic(id));
        }
        cap.flags |= CapFlags::CLIENT_SET;
        self.adjust_dynamic(id, value)
    }

    fn adjust_dynamic(&mut self, id: CapId, value: i32) -> Result<(), CapabilityError> {
        let prev = self.value(id);
        self.run_adjust(id, Some(value))?;
        let changed = self.value(id) != prev;

        // Sending the same GOP size again would make the firmware generate an IDR frame.
        if !changed && id == CapId::GOP_SIZE {
            return Ok(());
        }
        self.mark_dirty(id);
        self.propagate(id, changed)
    }

    /// Re-evaluates the children of `id` breadth-first. Children of a capability whose value did
    /// not change are only visited if they are flagged `ALWAYS_REEVALUATE`.
    pub fn propagate(&mut self, id: CapId, parent_changed: bool) -> Result<(), CapabilityError> {
        let mut queue: VecDeque<CapId> = VecDeque::new();
        self.queue_children(id, parent_changed, &mut queue);

        while let Some(child) = queue.pop_front() {
            let prev = self.value(child);
            self.run_adjust(child, None)?;
            let changed = self.value(child) != prev;
            if changed {
                self.mark_dirty(child);
            }
            self.queue_children(child, changed, &mut queue);
        }
        Ok(())
    }

    fn queue_children(&self, id: CapId, changed: bool, queue: &mut VecDeque<CapId>) {
        let Some(cap) = self.caps.get(&id) else {
            return;
        };
        for child in &cap.children {
            let reevaluate = self
                .caps
                .get(child)
                .map(|c| c.flags.contains(CapFlags::ALWAYS_REEVALUATE))
                .unwrap_or(false);
            if (changed || reevaluate) && !queue.contains(child) {
                queue.push_back(*child);
            }
        }
    }

    /// Mirrors a value reported by the firmware, without adjustment.
    pub fn update_from_firmware(&mut self, id: CapId, value: i32) {
        if !self.caps.contains_key(&id) {
            warn!("firmware value for unknown capability {:?} ignored", id);
            return;
        }
        self.update_value(id, value);
    }

    fn layer_count(&self) -> usize {
        (self.value(CapId::ENH_LAYER_COUNT).max(0) as usize).min(LAYER_BITRATES.len() - 1)
    }

    fn all_layer_bitrates_set(&self) -> bool {
        LAYER_BITRATES[..=self.layer_count()]
            .iter()
            .all(|id| self.is_client_set(*id))
    }

    fn cumulative_bitrate(&self) -> u64 {
        LAYER_BITRATES[..=self.layer_count()]
            .iter()
            .map(|id| self.value(*id).max(0) as u64)
            .fold(0u64, |acc, v| acc.saturating_add(v))
    }

    fn max_bitrate(&self) -> u64 {
        self.caps
            .get(&CapId::BIT_RATE)
            .map(|c| c.max.max(0) as u64)
            .unwrap_or(0)
    }

    fn run_adjust(&mut self, id: CapId, explicit: Option<i32>) -> Result<(), CapabilityError> {
        let Some(cap) = self.caps.get(&id) else {
            return Ok(());
        };
        let mut value = explicit.unwrap_or(cap.value);
        let client_set = cap.flags.contains(CapFlags::CLIENT_SET);
        let adjust = cap.adjust;

        match adjust {
            Adjust::None => (),
            Adjust::EntropyMode => {
                if self.codec != Codec::H264 {
                    return Ok(());
                }
                let profile = self.parent_value(id, CapId::PROFILE)?;
                if profile == H264_PROFILE_BASELINE || profile == H264_PROFILE_CONSTRAINED_BASELINE
                {
                    value = ENTROPY_CAVLC;
                }
            }
            Adjust::Transform8x8 => {
                if self.codec != Codec::H264 {
                    return Ok(());
                }
                let profile = self.parent_value(id, CapId::PROFILE)?;
                if profile != H264_PROFILE_HIGH && profile != H264_PROFILE_CONSTRAINED_HIGH {
                    value = 0;
                }
            }
            Adjust::LtrCount => {
                let rc = self.parent_value(id, CapId::BITRATE_MODE)?;
                let all_intra = self.parent_value(id, CapId::ALL_INTRA)?;
                if (rc != RC_OFF && rc != RC_CBR) || all_intra != 0 {
                    debug!("ltr unsupported, rc {} all_intra {}", rc, all_intra);
                    value = 0;
                }
            }
            Adjust::UseLtr => {
                let ltr_count = self.value(CapId::LTR_COUNT);
                if ltr_count == 0 {
                    return Ok(());
                }
                if value <= 0 || value > (1 << ltr_count) - 1 {
                    error!("invalid use ltr mask {}", value);
                    return Ok(());
                }
            }
            Adjust::MarkLtr => {
                let ltr_count = self.value(CapId::LTR_COUNT);
                if ltr_count == 0 {
                    return Ok(());
                }
                if value < 0 || value > ltr_count - 1 {
                    error!("invalid mark ltr index {}", value);
                    return Ok(());
                }
            }
            Adjust::GopSize => {
                let layers = self.parent_value(id, CapId::ENH_LAYER_COUNT)?;
                if layers > 0 {
                    // Layered encoding needs the GOP to be a multiple of the sub-GOP size.
                    let min_gop = 1i32 << layers.min(5);
                    let num_subgops = (value.max(0) + (min_gop >> 1)) / min_gop;
                    value = if num_subgops > 0 {
                        num_subgops.saturating_mul(min_gop)
                    } else {
                        min_gop
                    };
                }
            }
            Adjust::BFrame => {
                let layers = self.parent_value(id, CapId::ENH_LAYER_COUNT)?;
                let layer_type = self.parent_value(id, CapId::LAYER_TYPE)?;
                value = if layers == 0 || layer_type != LAYER_HIER_B {
                    0
                } else {
                    ((1i32 << layers.min(5)) - 1).min(7)
                };
            }
            Adjust::BitRate => return self.adjust_bitrate(id, explicit, client_set),
            Adjust::DynamicLayerBitrate => return self.adjust_layer_bitrate(id, explicit),
            Adjust::PeakBitrate => {
                // Applies under every rate control.
                let bitrate = self.parent_value(id, CapId::BIT_RATE)?;
                value = if client_set { value.max(bitrate) } else { bitrate };
            }
            Adjust::MaxQp => {
                let min_qp = self.parent_value(id, CapId::MIN_FRAME_QP)?;
                value = value.max(min_qp);
            }
            Adjust::DeliveryMode => {
                if self.domain == Domain::Decoder {
                    return Ok(());
                }
                let slice_mode = self.parent_value(id, CapId::SLICE_MODE)?;
                if slice_mode != SLICE_MODE_MAX_MB {
                    value = DELIVERY_FRAME_BASED;
                }
            }
            Adjust::OutbufFence => {
                if self.parent_value(id, CapId::OUTPUT_ORDER)? == 0 {
                    value = 0;
                }
            }
            Adjust::EarlyNotifyEnable => {
                let low_latency = self.parent_value(id, CapId::LOWLATENCY_MODE)?;
                let output_order = self.parent_value(id, CapId::OUTPUT_ORDER)?;
                let fence = self.parent_value(id, CapId::META_OUTBUF_FENCE)?;
                if low_latency == 0 || output_order == 0 || fence == 0 {
                    value = 0;
                }
            }
            Adjust::EarlyNotifyLineCount => {
                if self.parent_value(id, CapId::EARLY_NOTIFY_ENABLE)? == 0 {
                    value = 0;
                }
            }
            Adjust::EarlyNotifyFenceCount => {
                let line_count = self.parent_value(id, CapId::EARLY_NOTIFY_LINE_COUNT)?;
                if self.value(CapId::EARLY_NOTIFY_ENABLE) == 0 {
                    value = 0;
                } else if line_count <= 0 {
                    value = 1;
                } else {
                    let height = self.value(CapId::FRAME_HEIGHT).max(0);
                    value = (height + line_count - 1) / line_count;
                    if value > MAX_FENCE_COUNT {
                        error!("invalid fence count {}, line count {}", value, line_count);
                        self.update_value(id, value);
                        return Err(CapabilityError::FenceCount(value));
                    }
                }
            }
        }

        self.update_value(id, value);
        Ok(())
    }

    fn adjust_bitrate(
        &mut self,
        id: CapId,
        explicit: Option<i32>,
        client_set: bool,
    ) -> Result<(), CapabilityError> {
        // The total bitrate takes precedence over layer bitrates when the client set it.
        if client_set {
            let value = explicit.unwrap_or(self.value(id));
            self.update_value(id, value);
            return Ok(());
        }
        if self.streaming {
            return Ok(());
        }

        let layers = self.parent_value(id, CapId::ENH_LAYER_COUNT)?;
        let max_bitrate = self.max_bitrate();
        if self.value(id) as u64 > max_bitrate {
            self.update_value(id, max_bitrate.min(i32::MAX as u64) as i32);
        }
        if layers <= 0 {
            return Ok(());
        }
        if !self.all_layer_bitrates_set() {
            debug!("client did not set all layer bitrates");
            return Ok(());
        }

        let mut cumulative = self.cumulative_bitrate();
        if cumulative > max_bitrate && max_bitrate > 0 {
            let decrement_percent = cumulative.saturating_sub(max_bitrate).saturating_mul(100)
                / max_bitrate;
            cumulative = 0;
            for layer in LAYER_BITRATES[..=self.layer_count()].iter().copied() {
                let layer_value = self.value(layer).max(0) as u64;
                let decrement = layer_value.saturating_mul(decrement_percent) / 100;
                let new_value = layer_value.saturating_sub(decrement);
                cumulative = cumulative.saturating_add(new_value);
                self.update_value(layer, new_value.min(i32::MAX as u64) as i32);
                self.mark_dirty(layer);
            }
        }
        self.update_value(id, cumulative.min(i32::MAX as u64) as i32);
        Ok(())
    }

    fn adjust_layer_bitrate(
        &mut self,
        id: CapId,
        explicit: Option<i32>,
    ) -> Result<(), CapabilityError> {
        let Some(requested) = explicit else {
            return Ok(());
        };
        if !self.streaming {
            self.update_value(id, requested);
            return Ok(());
        }
        if self.is_client_set(CapId::BIT_RATE) {
            return Ok(());
        }
        if self.value(CapId::ENH_LAYER_COUNT) <= 0 {
            error!("layer bitrate {:?} set without layers", id);
            return Err(CapabilityError::Unsupported(id));
        }
        if !self.all_layer_bitrates_set() {
            self.update_value(id, requested);
            return Ok(());
        }

        let max_bitrate = self.max_bitrate();
        let old = self.value(id).max(0) as u64;
        let mut new = requested.max(0) as u64;
        let total = self
            .cumulative_bitrate()
            .saturating_sub(old)
            .saturating_add(new);
        if total > max_bitrate {
            new = new.saturating_sub(total - max_bitrate);
        }
        self.update_value(id, new.min(i32::MAX as u64) as i32);
        let cumulative = self.cumulative_bitrate();
        self.update_value(CapId::BIT_RATE, cumulative.min(i32::MAX as u64) as i32);
        self.mark_dirty(CapId::BIT_RATE);
        Ok(())
    }

    /// Serializes every dirty capability, in dependency order, into property packets.
    ///
    /// Either all packets are returned, or none: on the first failure the remaining dirty
    /// capabilities are discarded and the error returned.
    pub fn set_all_dirty(&mut self) -> Result<Vec<PropertyPacket>, CapabilityError> {
        self.build_dependency_order()?;
        let dirty = std::mem::take(&mut self.dirty);
        let mut packets = Vec::new();
        for id in self.order.iter().copied().filter(|id| dirty.contains(id)) {
            self.serialize(id, &mut packets)?;
        }
        Ok(packets)
    }

    fn serialize(
        &self,
        id: CapId,
        packets: &mut Vec<PropertyPacket>,
    ) -> Result<(), CapabilityError> {
        let Some(cap) = self.caps.get(&id) else {
            return Ok(());
        };
        if cap.hfi_id == 0 {
            return Ok(());
        }
        let mut push = |hfi_id: u32, payload_type: HfiPayloadType, value: u32| {
            packets.push(PropertyPacket {
                cap: id,
                hfi_id,
                port: cap.port,
                payload_type,
                value,
            })
        };
        let unsigned = |value: i32| {
            u32::try_from(value).map_err(|_| CapabilityError::InvalidValue { id, value })
        };

        match cap.setter {
            Setter::None => (),
            Setter::U32 => push(cap.hfi_id, HfiPayloadType::U32, unsigned(cap.value)?),
            Setter::U32Enum => push(cap.hfi_id, HfiPayloadType::U32_ENUM, unsigned(cap.value)?),
            Setter::S32 => push(cap.hfi_id, HfiPayloadType::S32, cap.value as u32),
            Setter::Q16 => {
                let q16 = unsigned(cap.value)?
                    .checked_mul(1 << 16)
                    .ok_or(CapabilityError::InvalidValue {
                        id,
                        value: cap.value,
                    })?;
                push(cap.hfi_id, HfiPayloadType::Q16, q16);
            }
            Setter::QpPacked => {
                // Same QP for I, P and B frames, with the enable bits set for all three.
                let qp = unsigned(cap.value)? & 0xff;
                push(
                    cap.hfi_id,
                    HfiPayloadType::PACKED_32,
                    qp | qp << 8 | qp << 16 | 0x7 << 24,
                );
            }
            Setter::Bitrate => {
                let layered = self.value(CapId::ENH_LAYER_COUNT) > 0
                    && !self.is_client_set(CapId::BIT_RATE)
                    && self.all_layer_bitrates_set();
                if layered {
                    for (layer, prop) in LAYER_BITRATES[..=self.layer_count()]
                        .iter()
                        .zip(LAYER_BITRATE_PROPS.iter())
                    {
                        push(*prop, HfiPayloadType::U32, unsigned(self.value(*layer))?);
                    }
                } else {
                    push(cap.hfi_id, HfiPayloadType::U32, unsigned(cap.value)?);
                }
            }
        }
        Ok(())
    }
}
