// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer bookkeeping for a session.
//!
//! All buffers of a session live in one arena and are referred to by [`BufferId`]. Each buffer
//! belongs to exactly one list: the pool of its type, the read-only list (decoder output
//! buffers the firmware still references), or the release list (read-only buffers being handed
//! back to the firmware for release).
//!
//! Client buffers follow the attribute chain `DEFERRED -> QUEUED -> DEQUEUED -> BUFFER_DONE`
//! and are removed from their pool once completed. Internal buffers are allocated through a
//! [`VidcMemoryAllocator`], stay queued to the firmware and are removed once the firmware
//! acknowledges their release.

pub mod sizes;

use std::collections::BTreeMap;

use bitflags::bitflags;
use log::debug;
use log::error;
use log::warn;
use thiserror::Error;

use crate::protocol::CommandSender;
use crate::protocol::HfiBuffer;
use crate::protocol::HfiBufferFlags;
use crate::protocol::HfiBufferType;
use crate::protocol::HfiPort;
use crate::protocol::PacketError;
use crate::state::Port;
use crate::state::SessionStateMachine;
use crate::Domain;
use crate::MemoryHandle;
use crate::RegionKind;
use crate::VidcMemoryAllocator;

pub use sizes::Requirement;

/// Number of read-only buffers above which non-reference ones are handed back to the firmware.
pub const MAX_DPB_COUNT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BufferType {
    Input,
    Output,
    InputMeta,
    OutputMeta,
    Bin,
    Arp,
    Comv,
    NonComv,
    Line,
    Dpb,
    Persist,
    Vpss,
    PartialData,
}

impl BufferType {
    pub const INTERNAL: [BufferType; 9] = [
        BufferType::Bin,
        BufferType::Arp,
        BufferType::Comv,
        BufferType::NonComv,
        BufferType::Line,
        BufferType::Dpb,
        BufferType::Persist,
        BufferType::Vpss,
        BufferType::PartialData,
    ];

    pub fn is_internal(self) -> bool {
        !matches!(
            self,
            BufferType::Input | BufferType::Output | BufferType::InputMeta | BufferType::OutputMeta
        )
    }

    pub fn is_meta(self) -> bool {
        matches!(self, BufferType::InputMeta | BufferType::OutputMeta)
    }

    /// Returns the metadata type travelling with buffers of this type, if any.
    pub fn meta(self) -> Option<BufferType> {
        match self {
            BufferType::Input => Some(BufferType::InputMeta),
            BufferType::Output => Some(BufferType::OutputMeta),
            _ => None,
        }
    }

    /// Returns the session port buffers of this type are attached to.
    pub fn port(self, domain: Domain) -> Port {
        match (domain, self) {
            (_, BufferType::Input | BufferType::InputMeta) => Port::Input,
            (_, BufferType::Output | BufferType::OutputMeta) => Port::Output,
            (Domain::Decoder, BufferType::Dpb) => Port::Output,
            (Domain::Decoder, _) => Port::Input,
            (Domain::Encoder, BufferType::Vpss) => Port::Input,
            (Domain::Encoder, _) => Port::Output,
        }
    }

    pub fn hfi_port(self, domain: Domain) -> HfiPort {
        match self {
            BufferType::Arp | BufferType::Persist => HfiPort::NONE,
            _ => self.port(domain).hfi_port(domain),
        }
    }

    pub fn hfi_type(self, domain: Domain) -> HfiBufferType {
        match (domain, self) {
            (Domain::Decoder, BufferType::Input) | (Domain::Encoder, BufferType::Output) => {
                HfiBufferType::BITSTREAM
            }
            (Domain::Decoder, BufferType::Output) | (Domain::Encoder, BufferType::Input) => {
                HfiBufferType::RAW
            }
            (_, BufferType::InputMeta | BufferType::OutputMeta) => HfiBufferType::METADATA,
            (_, BufferType::Bin) => HfiBufferType::BIN,
            (_, BufferType::Arp) => HfiBufferType::ARP,
            (_, BufferType::Comv) => HfiBufferType::COMV,
            (_, BufferType::NonComv) => HfiBufferType::NON_COMV,
            (_, BufferType::Line) => HfiBufferType::LINE,
            (_, BufferType::Dpb) => HfiBufferType::DPB,
            (_, BufferType::Persist) => HfiBufferType::PERSIST,
            (_, BufferType::Vpss) => HfiBufferType::VPSS,
            (_, BufferType::PartialData) => HfiBufferType::PARTIAL_DATA,
        }
    }

    /// Resolves the buffer type of a descriptor returned by the firmware on `port`. Returns
    /// `None` for types that are not expected on that port.
    pub fn from_hfi(domain: Domain, port: HfiPort, hfi_type: HfiBufferType) -> Option<BufferType> {
        use HfiBufferType as T;

        let Some(session_port) = Port::from_hfi(domain, port) else {
            return match (domain, hfi_type) {
                (Domain::Encoder, T::ARP) => Some(BufferType::Arp),
                (Domain::Decoder, T::PERSIST) => Some(BufferType::Persist),
                _ => None,
            };
        };

        let buffer_type = match (domain, session_port, hfi_type) {
            (_, Port::Input, T::METADATA) => BufferType::InputMeta,
            (_, Port::Output, T::METADATA) => BufferType::OutputMeta,
            (Domain::Decoder, Port::Input, T::BITSTREAM) => BufferType::Input,
            (Domain::Decoder, Port::Input, T::BIN) => BufferType::Bin,
            (Domain::Decoder, Port::Input, T::COMV) => BufferType::Comv,
            (Domain::Decoder, Port::Input, T::NON_COMV) => BufferType::NonComv,
            (Domain::Decoder, Port::Input, T::LINE) => BufferType::Line,
            (Domain::Decoder, Port::Input, T::PERSIST) => BufferType::Persist,
            (Domain::Decoder, Port::Input, T::PARTIAL_DATA) => BufferType::PartialData,
            (Domain::Decoder, Port::Output, T::RAW) => BufferType::Output,
            (Domain::Decoder, Port::Output, T::DPB) => BufferType::Dpb,
            (Domain::Encoder, Port::Input, T::RAW) => BufferType::Input,
            (Domain::Encoder, Port::Input, T::VPSS) => BufferType::Vpss,
            (Domain::Encoder, Port::Output, T::BITSTREAM) => BufferType::Output,
            (Domain::Encoder, Port::Output, T::BIN) => BufferType::Bin,
            (Domain::Encoder, Port::Output, T::COMV) => BufferType::Comv,
            (Domain::Encoder, Port::Output, T::NON_COMV) => BufferType::NonComv,
            (Domain::Encoder, Port::Output, T::LINE) => BufferType::Line,
            (Domain::Encoder, Port::Output, T::ARP) => BufferType::Arp,
            (Domain::Encoder, Port::Output, T::DPB) => BufferType::Dpb,
            _ => return None,
        };
        Some(buffer_type)
    }

    /// Memory region internal buffers of this type are allocated from.
    pub fn region(self, domain: Domain, secure: bool) -> RegionKind {
        if !secure {
            return RegionKind::NonSecure;
        }
        match (domain, self) {
            (Domain::Decoder, BufferType::Input) | (Domain::Encoder, BufferType::Output) => {
                RegionKind::SecureBitstream
            }
            (Domain::Decoder, BufferType::Output)
            | (Domain::Encoder, BufferType::Input)
            | (_, BufferType::Dpb)
            | (_, BufferType::Vpss) => RegionKind::SecurePixel,
            _ => RegionKind::SecureNonPixel,
        }
    }
}

bitflags! {
    /// Lifecycle attributes of a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferAttr: u32 {
        const DEFERRED = 1 << 0;
        const READ_ONLY = 1 << 1;
        const PENDING_RELEASE = 1 << 2;
        const QUEUED = 1 << 3;
        const DEQUEUED = 1 << 4;
        const BUFFER_DONE = 1 << 5;
    }
}

bitflags! {
    /// Flags reported to the client with a completed buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        const KEYFRAME = 1 << 0;
        const PFRAME = 1 << 1;
        const BFRAME = 1 << 2;
        const ERROR = 1 << 3;
        const CODEC_CONFIG = 1 << 4;
        const LAST = 1 << 5;
    }
}

/// Stable reference to a buffer of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

/// Which list a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Pool,
    ReadOnly,
    Release,
}

#[derive(Debug, Clone)]
pub struct Buffer {
    pub buffer_type: BufferType,
    pub index: u32,
    pub device_addr: u64,
    /// Backing memory, for internal buffers.
    pub memory: Option<MemoryHandle>,
    pub buffer_size: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub timestamp: i64,
    pub flags: BufferFlags,
    pub attr: BufferAttr,
    membership: Membership,
}

impl Buffer {
    pub fn new(buffer_type: BufferType, index: u32, device_addr: u64, buffer_size: u32) -> Self {
        Self {
            buffer_type,
            index,
            device_addr,
            memory: None,
            buffer_size,
            data_offset: 0,
            data_size: 0,
            timestamp: 0,
            flags: BufferFlags::empty(),
            attr: BufferAttr::empty(),
            membership: Membership::Pool,
        }
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    fn to_hfi(&self, domain: Domain) -> HfiBuffer {
        let mut flags = HfiBufferFlags::empty();
        if self.attr.contains(BufferAttr::READ_ONLY) {
            flags |= HfiBufferFlags::READONLY;
        }
        if self.flags.contains(BufferFlags::CODEC_CONFIG) {
            flags |= HfiBufferFlags::CODEC_CONFIG;
        }
        HfiBuffer {
            buffer_type: self.buffer_type.hfi_type(domain) as u32,
            index: self.index,
            base_address: self.device_addr,
            addr_offset: 0,
            data_offset: self.data_offset,
            data_size: self.data_size,
            buffer_size: self.buffer_size,
            timestamp: self.timestamp,
            flags: flags.bits(),
            reserved: 0,
        }
    }
}

/// A client buffer handed back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDone {
    pub buffer_type: BufferType,
    pub index: u32,
    pub device_addr: u64,
    pub data_offset: u32,
    pub data_size: u32,
    pub timestamp: i64,
    pub flags: BufferFlags,
}

impl From<&Buffer> for BufferDone {
    fn from(buf: &Buffer) -> Self {
        Self {
            buffer_type: buf.buffer_type,
            index: buf.index,
            device_addr: buf.device_addr,
            data_offset: buf.data_offset,
            data_size: buf.data_size,
            timestamp: buf.timestamp,
            flags: buf.flags,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    pub min_count: u32,
    pub extra_count: u32,
    pub actual_count: u32,
    pub size: u32,
    /// The current buffers satisfy the last computed requirement and are kept as is.
    pub reuse: bool,
    members: Vec<BufferId>,
}

impl BufferPool {
    pub fn members(&self) -> &[BufferId] {
        &self.members
    }

    fn reset(&mut self) {
        self.min_count = 0;
        self.extra_count = 0;
        self.actual_count = 0;
        self.size = 0;
        self.reuse = false;
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("failed to allocate buffer memory: errno {0}")]
    Alloc(i32),
    #[error("{0:?} port is not streaming")]
    NotStreaming(Port),
    #[error("{0}")]
    InvalidState(&'static str),
    #[error("no such buffer")]
    NotFound,
    #[error("failed to post buffer: {0}")]
    Packet(#[from] PacketError),
    #[error("no buffer with device address {0:#x}")]
    UnknownAddress(u64),
    #[error("no dequeued metadata buffer for index {0}")]
    MetaMismatch(u32),
}

pub struct BufferManager {
    domain: Domain,
    arena: Vec<Option<Buffer>>,
    free_slots: Vec<usize>,
    pools: BTreeMap<BufferType, BufferPool>,
    read_only: Vec<BufferId>,
    release: Vec<BufferId>,
}

impl BufferManager {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            arena: Vec::new(),
            free_slots: Vec::new(),
            pools: BTreeMap::new(),
            read_only: Vec::new(),
            release: Vec::new(),
        }
    }

    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.arena.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: BufferId) -> Option<&mut Buffer> {
        self.arena.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Returns the pool of `buffer_type`. Pools start empty.
    pub fn pool(&self, buffer_type: BufferType) -> BufferPool {
        self.pools.get(&buffer_type).cloned().unwrap_or_default()
    }

    fn pool_mut(&mut self, buffer_type: BufferType) -> &mut BufferPool {
        self.pools.entry(buffer_type).or_default()
    }

    /// Iterates over the pool buffers of `buffer_type`.
    pub fn buffers(&self, buffer_type: BufferType) -> impl Iterator<Item = (BufferId, &Buffer)> {
        self.pools
            .get(&buffer_type)
            .map(|p| p.members.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(move |id| self.get(*id).map(|b| (*id, b)))
    }

    pub fn read_only(&self) -> impl Iterator<Item = &Buffer> {
        self.read_only.iter().filter_map(move |id| self.get(*id))
    }

    pub fn release_list(&self) -> impl Iterator<Item = &Buffer> {
        self.release.iter().filter_map(move |id| self.get(*id))
    }

    fn list_mut(&mut self, membership: Membership, buffer_type: BufferType) -> &mut Vec<BufferId> {
        match membership {
            Membership::Pool => &mut self.pool_mut(buffer_type).members,
            Membership::ReadOnly => &mut self.read_only,
            Membership::Release => &mut self.release,
        }
    }

    fn insert(&mut self, mut buf: Buffer, membership: Membership) -> BufferId {
        buf.membership = membership;
        let buffer_type = buf.buffer_type;
        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.arena[slot] = Some(buf);
                BufferId(slot)
            }
            None => {
                self.arena.push(Some(buf));
                BufferId(self.arena.len() - 1)
            }
        };
        self.list_mut(membership, buffer_type).push(id);
        id
    }

    fn remove(&mut self, id: BufferId) -> Option<Buffer> {
        let buf = self.arena.get_mut(id.0)?.take()?;
        self.list_mut(buf.membership, buf.buffer_type)
            .retain(|m| *m != id);
        self.free_slots.push(id.0);
        Some(buf)
    }

    /// Forgets a client buffer that could not be queued.
    pub fn discard(&mut self, id: BufferId) {
        self.remove(id);
    }

    fn move_to(&mut self, id: BufferId, membership: Membership) {
        let Some((old, buffer_type)) = self.get(id).map(|b| (b.membership, b.buffer_type)) else {
            return;
        };
        self.list_mut(old, buffer_type).retain(|m| *m != id);
        self.list_mut(membership, buffer_type).push(id);
        if let Some(buf) = self.get_mut(id) {
            buf.membership = membership;
        }
    }

    fn find(
        &self,
        buffer_type: BufferType,
        pred: impl Fn(&Buffer) -> bool,
    ) -> Option<BufferId> {
        self.buffers(buffer_type)
            .find(|(_, b)| pred(b))
            .map(|(id, _)| id)
    }

    fn find_read_only(&self, device_addr: u64) -> Option<BufferId> {
        self.read_only
            .iter()
            .copied()
            .find(|id| self.get(*id).map(|b| b.device_addr) == Some(device_addr))
    }

    /// Records the requirement computed for `buffer_type`. Returns whether the current buffers
    /// can be reused as they are.
    pub fn compute_requirements(&mut self, buffer_type: BufferType, req: Requirement) -> bool {
        let pool = self.pool_mut(buffer_type);
        pool.reuse = pool.size > 0 && req.size <= pool.size && req.min_count <= pool.min_count;
        if pool.reuse {
            debug!(
                "{:?}: reusing {} buffers of {} bytes",
                buffer_type, pool.min_count, pool.size
            );
        } else {
            pool.size = req.size;
            pool.min_count = req.min_count;
            pool.extra_count = req.extra_count;
            pool.actual_count = req.min_count + req.extra_count;
        }
        pool.reuse
    }

    /// Allocates the internal buffers the pool of `buffer_type` is missing.
    pub fn allocate(
        &mut self,
        buffer_type: BufferType,
        allocator: &mut dyn VidcMemoryAllocator,
        secure: bool,
    ) -> Result<(), BufferError> {
        if !buffer_type.is_internal() {
            return Ok(());
        }
        let pool = self.pool(buffer_type);
        if pool.reuse || pool.size == 0 {
            return Ok(());
        }
        let live = self
            .buffers(buffer_type)
            .filter(|(_, b)| !b.attr.contains(BufferAttr::PENDING_RELEASE))
            .count() as u32;
        let region = buffer_type.region(self.domain, secure);

        for index in live..pool.min_count {
            let memory = allocator
                .alloc(pool.size, region)
                .map_err(BufferError::Alloc)?;
            let device_addr = match allocator.map(&memory) {
                Ok(addr) => addr,
                Err(e) => {
                    allocator.free(memory);
                    return Err(BufferError::Alloc(e));
                }
            };
            let mut buf = Buffer::new(buffer_type, index, device_addr, pool.size);
            buf.memory = Some(memory);
            self.insert(buf, Membership::Pool);
            debug!(
                "{:?}: allocated buffer {} at {:#x}, {} bytes",
                buffer_type, index, device_addr, pool.size
            );
        }
        Ok(())
    }

    /// Registers a buffer queued by the client. Every new buffer starts deferred.
    pub fn add_external(&mut self, mut buf: Buffer) -> Result<BufferId, BufferError> {
        if buf.buffer_type.is_internal() {
            return Err(BufferError::InvalidState("internal buffers cannot be queued"));
        }
        let pending = self.find(buf.buffer_type, |b| {
            b.index == buf.index && !b.attr.contains(BufferAttr::BUFFER_DONE)
        });
        if pending.is_some() {
            error!("{:?}: buffer {} already queued", buf.buffer_type, buf.index);
            return Err(BufferError::InvalidState("buffer already queued"));
        }

        buf.attr = BufferAttr::DEFERRED;
        if self.domain == Domain::Decoder && buf.buffer_type == BufferType::Output {
            // The firmware still references this memory: queue it back read-only.
            if let Some(ro) = self.find_read_only(buf.device_addr) {
                self.remove(ro);
                buf.attr |= BufferAttr::READ_ONLY;
                debug!("ro buffer {:#x} queued back", buf.device_addr);
            }
        }
        Ok(self.insert(buf, Membership::Pool))
    }

    pub fn defer(&mut self, id: BufferId) -> Result<(), BufferError> {
        let buf = self.get_mut(id).ok_or(BufferError::NotFound)?;
        buf.attr |= BufferAttr::DEFERRED;
        debug!("{:?}: buffer {} deferred", buf.buffer_type, buf.index);
        Ok(())
    }

    /// Queues a client buffer to the firmware, together with its metadata buffer if
    /// `meta_enabled`.
    pub fn enqueue(
        &mut self,
        id: BufferId,
        sm: &SessionStateMachine,
        meta_enabled: bool,
        sender: &mut CommandSender,
    ) -> Result<(), BufferError> {
        if sm.is_error() {
            return Err(BufferError::InvalidState("session is in error"));
        }
        let buf = self.get(id).ok_or(BufferError::NotFound)?;
        let port = buf.buffer_type.port(self.domain);
        if !sm.is_streaming(port) {
            return Err(BufferError::NotStreaming(port));
        }

        let hfi_port = port.hfi_port(self.domain);
        let mut packets = vec![(hfi_port, buf.to_hfi(self.domain))];
        let mut ids = vec![id];
        if let Some(meta_type) = buf.buffer_type.meta().filter(|_| meta_enabled) {
            let index = buf.index;
            let meta_id = self
                .find(meta_type, |m| {
                    m.index == index && !m.attr.contains(BufferAttr::BUFFER_DONE)
                })
                .ok_or(BufferError::InvalidState("missing metadata buffer"))?;
            if let Some(meta) = self.get(meta_id) {
                packets.push((hfi_port, meta.to_hfi(self.domain)));
            }
            ids.push(meta_id);
        }

        sender.buffers(&packets)?;

        for id in ids {
            if let Some(buf) = self.get_mut(id) {
                buf.attr
                    .remove(BufferAttr::DEFERRED | BufferAttr::DEQUEUED | BufferAttr::BUFFER_DONE);
                buf.attr.insert(BufferAttr::QUEUED);
                debug!(
                    "{:?}: qbuf {} addr {:#x} size {}",
                    buf.buffer_type, buf.index, buf.device_addr, buf.data_size
                );
            }
        }
        Ok(())
    }

    /// Queues every deferred buffer of `buffer_type`.
    pub fn queue_deferred(
        &mut self,
        buffer_type: BufferType,
        sm: &SessionStateMachine,
        meta_enabled: bool,
        sender: &mut CommandSender,
    ) -> Result<(), BufferError> {
        // Metadata buffers are queued with their data buffer.
        if buffer_type.is_meta() {
            return Ok(());
        }
        let deferred: Vec<BufferId> = self
            .buffers(buffer_type)
            .filter(|(_, b)| b.attr.contains(BufferAttr::DEFERRED))
            .map(|(id, _)| id)
            .collect();
        for id in deferred {
            self.enqueue(id, sm, meta_enabled, sender)?;
        }
        Ok(())
    }

    /// Queues the internal buffers of `buffer_type` the firmware does not hold yet.
    pub fn queue_internal(
        &mut self,
        buffer_type: BufferType,
        sender: &mut CommandSender,
    ) -> Result<(), BufferError> {
        if !buffer_type.is_internal() || self.pool(buffer_type).reuse {
            return Ok(());
        }
        let hfi_port = buffer_type.hfi_port(self.domain);
        let ids: Vec<BufferId> = self
            .buffers(buffer_type)
            .filter(|(_, b)| {
                !b.attr
                    .intersects(BufferAttr::PENDING_RELEASE | BufferAttr::QUEUED)
            })
            .map(|(id, _)| id)
            .collect();
        let packets: Vec<(HfiPort, HfiBuffer)> = ids
            .iter()
            .filter_map(|id| self.get(*id))
            .map(|b| (hfi_port, b.to_hfi(self.domain)))
            .collect();

        sender.buffers(&packets)?;

        for id in ids {
            if let Some(buf) = self.get_mut(id) {
                buf.attr.insert(BufferAttr::QUEUED);
            }
        }
        debug!("{:?}: queued {} internal buffers", buffer_type, packets.len());
        Ok(())
    }

    /// Updates the client buffer the firmware just returned. Returns `None` if the descriptor
    /// does not match a queued buffer.
    pub fn on_firmware_return(
        &mut self,
        buffer_type: BufferType,
        wire: &HfiBuffer,
    ) -> Option<BufferId> {
        let decoder_output =
            self.domain == Domain::Decoder && buffer_type == BufferType::Output;
        let found = self.find(buffer_type, |b| {
            if decoder_output {
                b.device_addr == wire.base_address && b.data_offset == wire.data_offset
            } else {
                b.index == wire.index
            }
        });
        let Some(id) = found else {
            warn!(
                "{:?}: no buffer for index {} addr {:#x}",
                buffer_type, wire.index, wire.base_address
            );
            return None;
        };
        let buf = self.get_mut(id)?;
        if !buf.attr.contains(BufferAttr::QUEUED) {
            warn!("{:?}: buffer {} was not queued", buffer_type, buf.index);
            return None;
        }
        buf.data_offset = wire.data_offset;
        buf.data_size = wire.data_size;
        buf.timestamp = wire.timestamp;
        buf.attr.remove(BufferAttr::QUEUED);
        buf.attr.insert(BufferAttr::DEQUEUED);
        debug!(
            "{:?}: dqbuf {} addr {:#x} size {}",
            buffer_type, buf.index, buf.device_addr, buf.data_size
        );

        if decoder_output {
            let read_only = wire.flags().contains(HfiBufferFlags::READONLY);
            buf.attr.set(BufferAttr::READ_ONLY, read_only);
            let copy = read_only.then(|| Buffer {
                memory: None,
                attr: BufferAttr::READ_ONLY,
                ..buf.clone()
            });
            match (copy, self.find_read_only(wire.base_address)) {
                (Some(copy), None) => {
                    self.insert(copy, Membership::ReadOnly);
                    debug!("ro buffer {:#x} retained", wire.base_address);
                }
                (None, Some(ro)) => {
                    self.remove(ro);
                    debug!("ro buffer {:#x} dropped", wire.base_address);
                }
                _ => (),
            }
        }
        Some(id)
    }

    /// Completes every dequeued client buffer, metadata first, and frees their pool entries.
    ///
    /// `meta_enabled` tells, per port, whether data buffers must be paired with a metadata
    /// buffer of the same index. A missing pair fails the whole pass before anything is
    /// completed.
    pub fn deliver_dequeued(
        &mut self,
        meta_enabled: [bool; 2],
    ) -> Result<Vec<BufferDone>, BufferError> {
        for data_type in [BufferType::Input, BufferType::Output] {
            if !meta_enabled[data_type.port(self.domain).index()] {
                continue;
            }
            let Some(meta_type) = data_type.meta() else {
                continue;
            };
            for (_, buf) in self
                .buffers(data_type)
                .filter(|(_, b)| b.attr.contains(BufferAttr::DEQUEUED))
            {
                let paired = self
                    .find(meta_type, |m| {
                        m.index == buf.index && m.attr.contains(BufferAttr::DEQUEUED)
                    })
                    .is_some();
                if !paired {
                    error!("{:?}: buffer {} has no dequeued metadata", data_type, buf.index);
                    return Err(BufferError::MetaMismatch(buf.index));
                }
            }
        }

        let mut done = Vec::new();
        for buffer_type in [
            BufferType::InputMeta,
            BufferType::Input,
            BufferType::OutputMeta,
            BufferType::Output,
        ] {
            let dequeued: Vec<BufferId> = self
                .buffers(buffer_type)
                .filter(|(_, b)| b.attr.contains(BufferAttr::DEQUEUED))
                .map(|(id, _)| id)
                .collect();
            for id in dequeued {
                let Some(buf) = self.get_mut(id) else {
                    continue;
                };
                buf.attr.remove(BufferAttr::DEQUEUED);
                if buf.attr.contains(BufferAttr::BUFFER_DONE) {
                    debug!("{:?}: buffer {} done already", buffer_type, buf.index);
                } else {
                    buf.attr.insert(BufferAttr::BUFFER_DONE);
                    done.push(BufferDone::from(&*buf));
                }
                self.remove(id);
            }
        }
        Ok(done)
    }

    /// Asks the firmware to release the internal buffers of `buffer_type` it holds.
    pub fn release(
        &mut self,
        buffer_type: BufferType,
        sender: &mut CommandSender,
    ) -> Result<(), BufferError> {
        if !buffer_type.is_internal() || self.pool(buffer_type).reuse {
            return Ok(());
        }
        let hfi_port = buffer_type.hfi_port(self.domain);
        let ids: Vec<BufferId> = self
            .buffers(buffer_type)
            .filter(|(_, b)| {
                b.attr.contains(BufferAttr::QUEUED)
                    && !b.attr.contains(BufferAttr::PENDING_RELEASE)
            })
            .map(|(id, _)| id)
            .collect();
        let packets: Vec<(HfiPort, HfiBuffer)> = ids
            .iter()
            .filter_map(|id| self.get(*id))
            .map(|b| {
                let mut hfi = b.to_hfi(self.domain);
                hfi.flags |= HfiBufferFlags::RELEASE.bits();
                (hfi_port, hfi)
            })
            .collect();

        sender.buffers(&packets)?;

        for id in ids {
            if let Some(buf) = self.get_mut(id) {
                buf.attr.insert(BufferAttr::PENDING_RELEASE);
            }
        }
        Ok(())
    }

    /// Frees the internal buffer at `device_addr` the firmware released.
    pub fn on_release_done(
        &mut self,
        buffer_type: BufferType,
        device_addr: u64,
        allocator: &mut dyn VidcMemoryAllocator,
    ) -> Result<(), BufferError> {
        let id = self
            .find(buffer_type, |b| b.device_addr == device_addr)
            .ok_or(BufferError::UnknownAddress(device_addr))?;
        if let Some(buf) = self.remove(id) {
            free_memory(allocator, buf);
        }
        debug!("{:?}: buffer {:#x} released", buffer_type, device_addr);

        let pool = self.pool_mut(buffer_type);
        if pool.members.is_empty() {
            pool.reset();
        }
        Ok(())
    }

    /// Hands back to the firmware the read-only buffers it no longer references, once too many
    /// of them accumulated. `dpb_list` holds the addresses the firmware last reported as
    /// references.
    pub fn release_nonref(
        &mut self,
        dpb_list: &[u64],
        sender: &mut CommandSender,
    ) -> Result<(), BufferError> {
        if self.read_only.len() <= MAX_DPB_COUNT {
            return Ok(());
        }
        let nonref: Vec<BufferId> = self
            .read_only
            .iter()
            .copied()
            .filter(|id| {
                self.get(*id)
                    .map(|b| !dpb_list.contains(&b.device_addr))
                    .unwrap_or(false)
            })
            .collect();
        let output_min = self.pool(BufferType::Output).min_count as usize;
        if nonref.len() <= output_min {
            return Ok(());
        }

        let hfi_port = Port::Output.hfi_port(self.domain);
        let packets: Vec<(HfiPort, HfiBuffer)> = nonref
            .iter()
            .filter_map(|id| self.get(*id))
            .map(|b| {
                let mut hfi = b.to_hfi(self.domain);
                hfi.data_size = 0;
                hfi.flags = HfiBufferFlags::RELEASE.bits();
                (hfi_port, hfi)
            })
            .collect();

        sender.buffers(&packets)?;

        for id in nonref {
            self.move_to(id, Membership::Release);
            if let Some(buf) = self.get_mut(id) {
                buf.attr.insert(BufferAttr::PENDING_RELEASE);
                debug!("ro buffer {:#x} released", buf.device_addr);
            }
        }
        Ok(())
    }

    /// Drops the release-list entry the firmware acknowledged.
    pub fn on_output_release_done(&mut self, device_addr: u64) -> Result<(), BufferError> {
        let id = self
            .release
            .iter()
            .copied()
            .find(|id| self.get(*id).map(|b| b.device_addr) == Some(device_addr))
            .ok_or(BufferError::UnknownAddress(device_addr))?;
        self.remove(id);
        Ok(())
    }

    /// Completes every client buffer of `port` still owned by the firmware or deferred, with no
    /// data. Read-only entries are left alone.
    pub fn flush(&mut self, port: Port, error: bool) -> Vec<BufferDone> {
        let types = match port {
            Port::Input => [BufferType::InputMeta, BufferType::Input],
            Port::Output => [BufferType::OutputMeta, BufferType::Output],
        };
        let mut done = Vec::new();
        for buffer_type in types {
            let pending: Vec<BufferId> = self
                .buffers(buffer_type)
                .filter(|(_, b)| {
                    b.attr
                        .intersects(BufferAttr::QUEUED | BufferAttr::DEFERRED)
                        && !b.attr.contains(BufferAttr::BUFFER_DONE)
                })
                .map(|(id, _)| id)
                .collect();
            for id in pending {
                let Some(mut buf) = self.remove(id) else {
                    continue;
                };
                buf.data_size = 0;
                buf.attr.insert(BufferAttr::BUFFER_DONE);
                if error {
                    buf.flags |= BufferFlags::ERROR;
                }
                debug!("{:?}: flushed buffer {}", buffer_type, buf.index);
                done.push(BufferDone::from(&buf));
            }
        }
        done
    }

    /// Frees every internal buffer and forgets every remaining buffer.
    pub fn destroy_all(&mut self, allocator: &mut dyn VidcMemoryAllocator) {
        let ids: Vec<BufferId> = (0..self.arena.len())
            .map(BufferId)
            .filter(|id| self.get(*id).is_some())
            .collect();
        for id in ids {
            if let Some(buf) = self.remove(id) {
                if !buf.buffer_type.is_internal() && buf.membership == Membership::Pool {
                    debug!("{:?}: dropping buffer {}", buf.buffer_type, buf.index);
                }
                free_memory(allocator, buf);
            }
        }
        for pool in self.pools.values_mut() {
            pool.reset();
        }
    }
}

fn free_memory(allocator: &mut dyn VidcMemoryAllocator, buf: Buffer) {
    let Some(memory) = buf.memory else {
        return;
    };
    if let Err(e) = allocator.unmap(&memory) {
        error!("failed to unmap {:#x}: errno {}", buf.device_addr, e);
    }
    allocator.free(memory);
}
