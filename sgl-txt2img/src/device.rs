use candle_core::{DType, Device};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda(usize),
    Cpu,
}

impl DeviceKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Cuda(_) => "cuda",
            DeviceKind::Cpu => "cpu",
        }
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, DeviceKind::Cuda(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    BFloat16,
    Float32,
}

impl Precision {
    pub fn name(&self) -> &'static str {
        match self {
            Precision::BFloat16 => "bfloat16",
            Precision::Float32 => "float32",
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Precision::BFloat16 => DType::BF16,
            Precision::Float32 => DType::F32,
        }
    }

    pub fn is_reduced(&self) -> bool {
        !matches!(self, Precision::Float32)
    }
}

/// Where the pipelines live and at which precision their weights are held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTarget {
    pub kind: DeviceKind,
    pub precision: Precision,
}

impl DeviceTarget {
    pub fn cuda(ordinal: usize) -> Self {
        DeviceTarget {
            kind: DeviceKind::Cuda(ordinal),
            precision: Precision::BFloat16,
        }
    }

    /// The safe configuration every failure path falls back to.
    pub fn cpu() -> Self {
        DeviceTarget {
            kind: DeviceKind::Cpu,
            precision: Precision::Float32,
        }
    }

    /// Prefer the first CUDA device with bf16 weights; otherwise CPU with f32.
    pub fn detect() -> Self {
        if cuda_available() {
            DeviceTarget::cuda(0)
        } else {
            DeviceTarget::cpu()
        }
    }

    pub fn device(&self) -> candle_core::Result<Device> {
        match self.kind {
            DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal),
            DeviceKind::Cpu => Ok(Device::Cpu),
        }
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }
}

impl Default for DeviceTarget {
    fn default() -> Self {
        DeviceTarget::cpu()
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.name(), self.precision.name())
    }
}

/// Whether a CUDA device can actually be opened, not just compiled in.
pub fn cuda_available() -> bool {
    candle_core::utils::cuda_is_available() && Device::new_cuda(0).is_ok()
}
