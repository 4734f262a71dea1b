// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate contains the host-side session control engine of a video codec accelerator driven
//! through the HFI (host-firmware interface) protocol.
//!
//! The engine is platform-independent and relies on a handful of traits being implemented to
//! talk to the firmware, allocate memory, and report events to clients. Porting it to a new
//! platform only requires implementing these traits, while the session logic stays the same.
//!
//! # Traits to implement by the platform
//!
//! * The firmware message queue must implement [`HfiTransport`] so the engine can post commands.
//!   Messages coming back from the firmware are passed to [`Core::handle_response`] by the
//!   platform's response worker.
//! * Memory for the buffers used internally by the firmware is obtained through
//!   [`VidcMemoryAllocator`].
//! * Buffer completions, end of stream, resolution changes and errors are reported through
//!   [`VidcEventQueue`].
//!
//! # Anatomy of a session
//!
//! A [`session::Session`] is opened for a (domain, codec) pair. It carries a capability table
//! ([`capability`]) describing its configuration, a buffer manager ([`buffer`]) tracking every
//! buffer exchanged with the firmware, and a state machine ([`state`]) deciding which client
//! requests are allowed. Client requests go through [`Core`], firmware responses are routed to
//! the right session by the dispatcher in [`response`].

pub mod buffer;
pub mod capability;
pub mod engine;
pub mod error;
pub mod io;
pub mod protocol;
pub mod response;
pub mod session;
pub mod state;

pub use engine::Core;
pub use engine::CoreConfig;
pub use error::VidcError;

use buffer::BufferDone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Encoder,
    Decoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    Hevc,
    Vp9,
    Av1,
}

/// Memory region a buffer is allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    NonSecure,
    SecurePixel,
    SecureNonPixel,
    SecureBitstream,
}

/// Memory obtained from a [`VidcMemoryAllocator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryHandle {
    /// Allocator-defined identifier of the memory.
    pub id: u64,
    pub size: u32,
    pub region: RegionKind,
}

/// Trait for posting messages to the firmware.
pub trait HfiTransport {
    /// Posts `message`, a complete HFI message, to the firmware command queue.
    fn post(&mut self, message: &[u8]) -> Result<(), i32>;

    /// Resets the connection with the firmware after it stopped responding. Messages posted
    /// afterwards start a new connection.
    fn reset(&mut self) -> Result<(), i32> {
        Ok(())
    }
}

/// Trait for allocating the memory of internal buffers and making it visible to the firmware.
///
/// If internal buffers are not needed, `()` can be passed in place of an implementor of this
/// trait. It will return `ENOMEM` to each allocation attempt.
pub trait VidcMemoryAllocator {
    /// Allocates `size` bytes from `region`.
    fn alloc(&mut self, size: u32, region: RegionKind) -> Result<MemoryHandle, i32>;
    /// Maps `handle` for the firmware and returns its device address.
    fn map(&mut self, handle: &MemoryHandle) -> Result<u64, i32>;
    fn unmap(&mut self, handle: &MemoryHandle) -> Result<(), i32>;
    fn free(&mut self, handle: MemoryHandle);
}

impl VidcMemoryAllocator for () {
    fn alloc(&mut self, _: u32, _: RegionKind) -> Result<MemoryHandle, i32> {
        Err(libc::ENOMEM)
    }

    fn map(&mut self, _: &MemoryHandle) -> Result<u64, i32> {
        Err(libc::ENOTTY)
    }

    fn unmap(&mut self, _: &MemoryHandle) -> Result<(), i32> {
        Err(libc::ENOTTY)
    }

    fn free(&mut self, _: MemoryHandle) {}
}

/// Events reported to the clients of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VidcEvent {
    /// A client buffer is returned.
    BufferDone { session_id: u32, buffer: BufferDone },
    /// The last buffer of a drain has been returned.
    Eos { session_id: u32 },
    /// The decoder found a new stream configuration and paused until the client reconfigures its
    /// output.
    SettingsChanged {
        session_id: u32,
        width: u32,
        height: u32,
        min_output_count: u32,
    },
    FenceSignalled { session_id: u32, fence_id: u64 },
    FenceDestroyed { session_id: u32, fence_id: u64 },
    Error { session_id: u32, errno: i32 },
}

/// Trait for sending session events to clients.
pub trait VidcEventQueue {
    fn send_event(&mut self, event: VidcEvent);

    /// Sends `errno` as an error event for `session_id`.
    fn send_error(&mut self, session_id: u32, errno: i32) {
        self.send_event(VidcEvent::Error { session_id, errno });
    }
}
