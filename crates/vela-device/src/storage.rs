// DeviceStorage — one tensor's device allocation plus its shape descriptors
//
// Each storage owns three buffers: the f32 data and two i32 descriptor
// buffers holding its dims and contiguous strides, which kernels that walk
// an operand's shape read directly. Dropping the storage releases all three.
// Device storage is never aliased by views, so it is always contiguous over
// `shape`.

use std::fmt;

use vela_core::{BackendStorage, Result, Shape};

use crate::buffer::DeviceBuffer;
use crate::device::Device;

pub struct DeviceStorage {
    data: DeviceBuffer<f32>,
    dims: DeviceBuffer<i32>,
    strides: DeviceBuffer<i32>,
    shape: Shape,
}

impl DeviceStorage {
    fn with_data(device: &Device, data: DeviceBuffer<f32>, shape: &Shape) -> Result<Self> {
        let dims = device.index_buffer(shape.dims())?;
        let strides = device.index_buffer(&shape.stride_contiguous())?;
        Ok(DeviceStorage {
            data,
            dims,
            strides,
            shape: shape.clone(),
        })
    }

    pub fn zeros(device: &Device, shape: &Shape) -> Result<Self> {
        let data = device.create_buffer(shape.elem_count())?;
        Self::with_data(device, data, shape)
    }

    /// `data` must hold exactly `shape.elem_count()` values.
    pub fn from_slice(device: &Device, data: &[f32], shape: &Shape) -> Result<Self> {
        let data = device.buffer_from_slice(data)?;
        Self::with_data(device, data, shape)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn device(&self) -> &Device {
        self.data.device()
    }

    pub fn data(&self) -> &DeviceBuffer<f32> {
        &self.data
    }

    pub fn dims(&self) -> &DeviceBuffer<i32> {
        &self.dims
    }

    pub fn strides(&self) -> &DeviceBuffer<i32> {
        &self.strides
    }

    /// Blocking copy of the contents to the host.
    pub fn to_host(&self) -> Result<Vec<f32>> {
        self.data.read()
    }
}

impl BackendStorage for DeviceStorage {
    fn len(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for DeviceStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceStorage({}, {:?})", self.shape, self.data)
    }
}
