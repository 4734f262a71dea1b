// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Traits and implementations for reading HFI objects from firmware responses and writing them
//! into command packets.
//!
//! The HFI queues carry little-endian data, but there is no guarantee that the host uses the same
//! endianness. The [`HfiType`] trait needs to be implemented for all types transiting through the
//! queues in order to ensure they are converted from/to the correct representation if needed.
//!
//! Objects can be read from any type implementing [`std::io::Read`] (typically a `&[u8]` cursor
//! over a response packet) and written into any type implementing [`std::io::Write`] (typically
//! the `Vec<u8>` of a command being built). The [`ReadFromQueue`] and [`WriteToQueue`] sealed
//! extension traits ensure that transiting data is always in little-endian representation by
//! using [`HfiType`] to wrap it into [`LeWrapper`].

use std::io::Result as IoResult;
use std::mem::MaybeUninit;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

#[cfg(target_endian = "little")]
mod le;
#[cfg(target_endian = "little")]
pub use le::*;

#[cfg(target_endian = "big")]
mod be;
#[cfg(target_endian = "big")]
pub use be::*;

/// Seals for [`ReadFromQueue`] and [`WriteToQueue`] so no new implementations can be created
/// outside of this crate.
mod private {
    pub trait RSealed {}
    impl<R> RSealed for R where R: std::io::Read {}

    pub trait WSealed {}
    impl<W> WSealed for W where W: std::io::Write {}
}

/// Extension trait for reading objects out of a firmware response, converting them from
/// little-endian to the native endianness of the system.
pub trait ReadFromQueue: private::RSealed {
    fn read_obj<T: HfiType>(&mut self) -> IoResult<T>;
}

impl<R> ReadFromQueue for R
where
    R: std::io::Read,
{
    fn read_obj<T: HfiType>(&mut self) -> IoResult<T> {
        // `read_exact` cannot be called with uninitialized memory. Since `T` implements
        // `FromBytes`, its zeroed form is valid and initialized.
        let mut obj: MaybeUninit<LeWrapper<T>> = std::mem::MaybeUninit::zeroed();
        // Safe because the slice boundaries cover `obj`, and the slice doesn't outlive it.
        let slice = unsafe {
            std::slice::from_raw_parts_mut(obj.as_mut_ptr() as *mut u8, std::mem::size_of::<T>())
        };

        self.read_exact(slice)?;

        // Safe because obj can be initialized from an array of bytes.
        Ok(unsafe { obj.assume_init() }.into_native())
    }
}

/// Extension trait for writing objects into a command packet after converting them to
/// little-endian representation.
pub trait WriteToQueue: private::WSealed {
    fn write_obj<T: HfiType>(&mut self, obj: T) -> IoResult<()>;
}

impl<W> WriteToQueue for W
where
    W: std::io::Write,
{
    fn write_obj<T: HfiType>(&mut self, obj: T) -> IoResult<()> {
        self.write_all(obj.to_le().as_bytes())
    }
}

/// Private wrapper for all types that can be sent/received over the HFI queues. Wrapped objects
/// are guaranteed to use little-endian representation.
///
/// [`Self::into_native`] can be used to retrieve the object in its native ordering.
#[repr(transparent)]
pub struct LeWrapper<T: HfiType>(T);

impl<T: HfiType> LeWrapper<T> {
    /// Convert the wrapped object back to native ordering and return it.
    pub fn into_native(self) -> T {
        T::from_le(self)
    }
}

unsafe impl<T: HfiType> FromZeroes for LeWrapper<T> {
    fn only_derive_is_allowed_to_implement_this_trait() {}
}

unsafe impl<T: HfiType> FromBytes for LeWrapper<T> {
    fn only_derive_is_allowed_to_implement_this_trait() {}
}

unsafe impl<T: HfiType> AsBytes for LeWrapper<T> {
    fn only_derive_is_allowed_to_implement_this_trait()
    where
        Self: Sized,
    {
    }
}
