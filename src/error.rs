// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Crate-wide error taxonomy.
//!
//! Every module reports its own error type, which converts into [`VidcError`] at the session and
//! core boundaries. [`VidcError::errno`] gives the `libc` error code to report to clients.

use thiserror::Error;

use crate::buffer::BufferError;
use crate::capability::CapabilityError;
use crate::protocol::PacketError;
use crate::state::StateError;

#[derive(Debug, Error)]
pub enum VidcError {
    /// Invalid static configuration, e.g. a cyclic capability graph.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The firmware sent something that violates the protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The firmware reported an error for the session.
    #[error("session error {0:#x}")]
    Session(u32),
    /// The firmware did not answer in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The request was rejected locally without changing any state.
    #[error("{0}")]
    LocalValidation(String),
    /// A collaborator (transport, allocator) failed with the given errno.
    #[error("collaborator failure: errno {0}")]
    Collaborator(i32),
}

impl VidcError {
    pub fn errno(&self) -> i32 {
        match self {
            VidcError::Configuration(_) => libc::EINVAL,
            VidcError::ProtocolViolation(_) => libc::EPROTO,
            VidcError::Session(_) => libc::EIO,
            VidcError::Timeout(_) => libc::ETIMEDOUT,
            VidcError::LocalValidation(_) => libc::EBUSY,
            VidcError::Collaborator(errno) => *errno,
        }
    }
}

impl From<CapabilityError> for VidcError {
    fn from(e: CapabilityError) -> Self {
        match e {
            CapabilityError::Cycle(_) | CapabilityError::UnknownParent { .. } => {
                VidcError::Configuration(e.to_string())
            }
            CapabilityError::NotDynamic(_)
            | CapabilityError::Unsupported(_)
            | CapabilityError::InvalidValue { .. } => VidcError::LocalValidation(e.to_string()),
            CapabilityError::MissingParent { .. } | CapabilityError::FenceCount(_) => {
                VidcError::ProtocolViolation(e.to_string())
            }
        }
    }
}

impl From<StateError> for VidcError {
    fn from(e: StateError) -> Self {
        VidcError::LocalValidation(e.to_string())
    }
}

impl From<PacketError> for VidcError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::Transport(errno) => VidcError::Collaborator(errno),
            _ => VidcError::ProtocolViolation(e.to_string()),
        }
    }
}

impl From<BufferError> for VidcError {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::Alloc(errno) => VidcError::Collaborator(errno),
            BufferError::NotStreaming(_) | BufferError::InvalidState(_) | BufferError::NotFound => {
                VidcError::LocalValidation(e.to_string())
            }
            BufferError::Packet(e) => e.into(),
            BufferError::UnknownAddress(_) | BufferError::MetaMismatch(_) => {
                VidcError::ProtocolViolation(e.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, VidcError>;
