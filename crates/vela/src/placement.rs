// Placement — a tensor on either backend, chosen at runtime
//
// `Tensor<B>` fixes its backend at compile time. Code that only learns at
// runtime where data should live holds an `AnyTensor` instead and moves it
// with `to(None)` (host) or `to(Some(&device))`.
//
// A move copies the data and yields a fresh untracked leaf; moving to where
// the tensor already is returns a handle to the same storage. Data coming
// back from a device lands on `CpuDevice::default()` unless the caller hands
// over its own host device (`to_host_on`, `into_host_on`), which keeps that
// device's `HostConfig` for everything computed afterwards.

use tracing::trace;

use vela_core::{Result, Shape};
use vela_cpu::{CpuDevice, CpuTensor};
use vela_device::{Device, DeviceBackend, DeviceTensor};

/// A tensor on the host or on a device.
#[derive(Debug, Clone)]
pub enum AnyTensor {
    Host(CpuTensor),
    Device(DeviceTensor),
}

impl AnyTensor {
    /// Move to the host (`None`) or to `device`. Data leaving a device goes
    /// to a default-configured host; see [`AnyTensor::to_host_on`].
    pub fn to(&self, device: Option<&Device>) -> Result<AnyTensor> {
        match (self, device) {
            (_, None) => self.to_host_on(&CpuDevice::default()),
            (AnyTensor::Device(t), Some(d)) if t.device().same_device(d) => {
                Ok(AnyTensor::Device(t.clone()))
            }
            (AnyTensor::Host(t), Some(d)) => {
                trace!(shape = %t.shape(), device = ?d, "host -> device");
                Ok(AnyTensor::Device(t.to_backend::<DeviceBackend>(d)?))
            }
            (AnyTensor::Device(t), Some(d)) => {
                trace!(shape = %t.shape(), from = ?t.device(), to = ?d, "device -> device");
                Ok(AnyTensor::Device(t.to_backend::<DeviceBackend>(d)?))
            }
        }
    }

    /// Move to the host onto `host`. A tensor already on the host stays
    /// where it is, with its own host device.
    pub fn to_host_on(&self, host: &CpuDevice) -> Result<AnyTensor> {
        match self {
            AnyTensor::Host(t) => Ok(AnyTensor::Host(t.clone())),
            AnyTensor::Device(t) => {
                trace!(shape = %t.shape(), device = ?t.device(), "device -> host");
                Ok(AnyTensor::Host(t.to_backend(host)?))
            }
        }
    }

    pub fn shape(&self) -> &Shape {
        match self {
            AnyTensor::Host(t) => t.shape(),
            AnyTensor::Device(t) => t.shape(),
        }
    }

    pub fn dims(&self) -> &[usize] {
        self.shape().dims()
    }

    /// The device holding the data; `None` on the host.
    pub fn device(&self) -> Option<&Device> {
        match self {
            AnyTensor::Host(_) => None,
            AnyTensor::Device(t) => Some(t.device()),
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, AnyTensor::Host(_))
    }

    /// Row-major copy of the elements on the host.
    pub fn data(&self) -> Result<Vec<f32>> {
        match self {
            AnyTensor::Host(t) => t.data(),
            AnyTensor::Device(t) => t.data(),
        }
    }

    pub fn as_host(&self) -> Option<&CpuTensor> {
        match self {
            AnyTensor::Host(t) => Some(t),
            AnyTensor::Device(_) => None,
        }
    }

    pub fn as_device(&self) -> Option<&DeviceTensor> {
        match self {
            AnyTensor::Host(_) => None,
            AnyTensor::Device(t) => Some(t),
        }
    }

    /// The host tensor, moving the data off the device if needed.
    pub fn into_host(self) -> Result<CpuTensor> {
        self.into_host_on(&CpuDevice::default())
    }

    /// As [`AnyTensor::into_host`], landing device data on `host`.
    pub fn into_host_on(self, host: &CpuDevice) -> Result<CpuTensor> {
        match self {
            AnyTensor::Host(t) => Ok(t),
            AnyTensor::Device(t) => t.to_backend(host),
        }
    }
}

impl From<CpuTensor> for AnyTensor {
    fn from(t: CpuTensor) -> Self {
        AnyTensor::Host(t)
    }
}

impl From<DeviceTensor> for AnyTensor {
    fn from(t: DeviceTensor) -> Self {
        AnyTensor::Device(t)
    }
}
