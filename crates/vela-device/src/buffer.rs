// Device Buffers — handle-addressed device memory
//
// A RawBuffer is one allocation of 32-bit elements in the device runtime's
// memory (a CUDA allocation, or the emulator's cells). Every element type
// travels as raw 32-bit words; `DeviceScalar` converts at the edges.
//
// DeviceBuffer<T> is the owning handle. Creating one charges the device's
// memory counters; dropping it releases the handle. Launches already
// submitted keep the allocation alive until they retire: the emulator holds
// a reference in the queued command, and the CUDA driver frees in stream
// order.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use vela_core::{Error, Result};

use crate::device::Device;
use crate::runtime::Memory;

/// Element type tag of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    F32,
    I32,
}

/// Scalar types a device buffer can hold.
pub trait DeviceScalar: Copy + Send + Sync + fmt::Debug + 'static {
    const KIND: ElemKind;
    fn to_bits(self) -> u32;
    fn from_bits(bits: u32) -> Self;
}

impl DeviceScalar for f32 {
    const KIND: ElemKind = ElemKind::F32;

    #[inline(always)]
    fn to_bits(self) -> u32 {
        f32::to_bits(self)
    }

    #[inline(always)]
    fn from_bits(bits: u32) -> Self {
        f32::from_bits(bits)
    }
}

impl DeviceScalar for i32 {
    const KIND: ElemKind = ElemKind::I32;

    #[inline(always)]
    fn to_bits(self) -> u32 {
        self as u32
    }

    #[inline(always)]
    fn from_bits(bits: u32) -> Self {
        bits as i32
    }
}

/// One allocation as the runtime sees it.
pub struct RawBuffer {
    id: u64,
    device_id: u64,
    kind: ElemKind,
    len: usize,
    memory: Memory,
}

impl RawBuffer {
    pub(crate) fn new(id: u64, device_id: u64, kind: ElemKind, len: usize, memory: Memory) -> Self {
        RawBuffer {
            id,
            device_id,
            kind,
            len,
            memory,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ElemKind {
        self.kind
    }

    pub(crate) fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn memory(&self) -> &Memory {
        &self.memory
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawBuffer(#{}, {:?} x {})", self.id, self.kind, self.len)
    }
}

/// An owning handle to a device allocation of `T`.
pub struct DeviceBuffer<T: DeviceScalar> {
    raw: Arc<RawBuffer>,
    device: Device,
    _marker: PhantomData<T>,
}

impl<T: DeviceScalar> DeviceBuffer<T> {
    pub(crate) fn new(raw: Arc<RawBuffer>, device: Device) -> Self {
        DeviceBuffer {
            raw,
            device,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn id(&self) -> u64 {
        self.raw.id()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn raw(&self) -> &Arc<RawBuffer> {
        &self.raw
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<u32>()
    }

    /// Blocking read of the whole buffer; waits for every command queued
    /// before it.
    pub fn read(&self) -> Result<Vec<T>> {
        self.read_range(0, self.len())
    }

    pub fn read_range(&self, offset: usize, len: usize) -> Result<Vec<T>> {
        self.check_range(offset, len)?;
        let bits = self.device.runtime().read(&self.raw, offset, len)?;
        Ok(bits.into_iter().map(T::from_bits).collect())
    }

    pub fn read_at(&self, position: usize) -> Result<T> {
        let v = self.read_range(position, 1)?;
        v.into_iter().next().ok_or(Error::IndexOutOfBounds {
            dim: 0,
            index: position,
            size: self.len(),
        })
    }

    /// Host-to-device copy into `offset..offset + data.len()`, ordered after
    /// every launch submitted before it.
    pub fn write_at(&self, offset: usize, data: &[T]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let bits = data.iter().map(|v| v.to_bits()).collect();
        self.device.runtime().write(&self.raw, offset, bits)
    }

    pub fn write(&self, data: &[T]) -> Result<()> {
        if data.len() != self.len() {
            return Err(Error::msg(format!(
                "device write of {} elements into a buffer of {}",
                data.len(),
                self.len()
            )));
        }
        self.write_at(0, data)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.len() {
            return Err(Error::IndexOutOfBounds {
                dim: 0,
                index: offset + len.max(1) - 1,
                size: self.len(),
            });
        }
        Ok(())
    }
}

impl<T: DeviceScalar> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.device.release_raw(&self.raw);
    }
}

impl<T: DeviceScalar> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceBuffer<{:?}>(#{}, len={})", T::KIND, self.id(), self.len())
    }
}
