//! Reference-counted element storage with host and device mirrors.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tarn_kernels::{ArgData, OutData};

use crate::dtype::{DType, Element};
use crate::liveness::LiveToken;
use crate::Device;

/// Typed host-side element vector.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

/// Apply `$body` to the inner vector of any variant, producing a value.
macro_rules! with_vec {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            HostData::F32($v) => $body,
            HostData::F64($v) => $body,
            HostData::I32($v) => $body,
            HostData::I64($v) => $body,
        }
    };
}

impl HostData {
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        Self::full(dtype, numel, 0.0)
    }

    pub fn full(dtype: DType, numel: usize, value: f64) -> Self {
        match dtype {
            DType::F32 => HostData::F32(vec![value as f32; numel]),
            DType::F64 => HostData::F64(vec![value; numel]),
            DType::I32 => HostData::I32(vec![value as i32; numel]),
            DType::I64 => HostData::I64(vec![value as i64; numel]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            HostData::F32(_) => DType::F32,
            HostData::F64(_) => DType::F64,
            HostData::I32(_) => DType::I32,
            HostData::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        with_vec!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` widened to `f64`.
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        with_vec!(self, v => v.get(i).map(|x| x.to_f64()))
    }

    /// Overwrite element `i`, converting from `f64`. Returns false when out of range.
    pub fn set_f64(&mut self, i: usize, value: f64) -> bool {
        with_vec!(self, v => match v.get_mut(i) {
            Some(slot) => {
                *slot = Element::from_f64(value);
                true
            }
            None => false,
        })
    }

    /// Convert every element to `dtype`.
    pub fn cast(&self, dtype: DType) -> HostData {
        if self.dtype() == dtype {
            return self.clone();
        }
        fn conv<S: Element, T: Element>(v: &[S]) -> Vec<T> {
            v.iter().map(|&x| T::from_f64(x.to_f64())).collect()
        }
        match dtype {
            DType::F32 => HostData::F32(with_vec!(self, v => conv(v))),
            DType::F64 => HostData::F64(with_vec!(self, v => conv(v))),
            DType::I32 => HostData::I32(with_vec!(self, v => conv(v))),
            DType::I64 => HostData::I64(with_vec!(self, v => conv(v))),
        }
    }

    /// Copy out as `T`, converting when the dtype differs.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        match T::host_slice(self) {
            Some(s) => s.to_vec(),
            None => with_vec!(self, v => v.iter().map(|&x| T::from_f64(x.to_f64())).collect()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        with_vec!(self, v => bytemuck::cast_slice::<_, u8>(v.as_slice()).to_vec())
    }

    /// Decode device bytes. Copies, so alignment of `bytes` does not matter.
    pub fn from_bytes(dtype: DType, bytes: &[u8]) -> HostData {
        match dtype {
            DType::F32 => HostData::F32(bytemuck::pod_collect_to_vec(bytes)),
            DType::F64 => HostData::F64(bytemuck::pod_collect_to_vec(bytes)),
            DType::I32 => HostData::I32(bytemuck::pod_collect_to_vec(bytes)),
            DType::I64 => HostData::I64(bytemuck::pod_collect_to_vec(bytes)),
        }
    }

    pub(crate) fn as_arg(&self) -> ArgData<'_> {
        match self {
            HostData::F32(v) => ArgData::F32(v),
            HostData::F64(v) => ArgData::F64(v),
            HostData::I32(v) => ArgData::I32(v),
            HostData::I64(v) => ArgData::I64(v),
        }
    }

    pub(crate) fn as_out(&mut self) -> OutData<'_> {
        match self {
            HostData::F32(v) => OutData::F32(v),
            HostData::F64(v) => OutData::F64(v),
            HostData::I32(v) => OutData::I32(v),
            HostData::I64(v) => OutData::I64(v),
        }
    }
}

#[derive(Debug, Default)]
struct Mirrors {
    host: Option<HostData>,
    /// Raw bytes resident on accelerator `.0`.
    device: Option<(usize, Vec<u8>)>,
}

struct BufferInner {
    dtype: DType,
    numel: usize,
    home: Device,
    mirrors: RwLock<Mirrors>,
    _live: LiveToken,
}

/// Shared element storage. Cloning shares the allocation.
///
/// At least one mirror is always present. Writing through the host mirror
/// invalidates the device mirror.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Storage whose authoritative copy is on the host.
    pub fn from_host(data: HostData, home: Device) -> Self {
        Self::with_mirrors(
            data.dtype(),
            data.len(),
            home,
            Mirrors {
                host: Some(data),
                device: None,
            },
        )
    }

    /// Storage produced on accelerator `index`, with no host copy yet.
    pub fn from_device(index: usize, data: &HostData) -> Self {
        Self::with_mirrors(
            data.dtype(),
            data.len(),
            Device::Accel(index),
            Mirrors {
                host: None,
                device: Some((index, data.to_bytes())),
            },
        )
    }

    fn with_mirrors(dtype: DType, numel: usize, home: Device, mirrors: Mirrors) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                dtype,
                numel,
                home,
                mirrors: RwLock::new(mirrors),
                _live: LiveToken::buffer(),
            }),
        }
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn numel(&self) -> usize {
        self.inner.numel
    }

    pub fn nbytes(&self) -> usize {
        self.inner.dtype.storage_bytes(self.inner.numel)
    }

    /// Device the buffer was created for.
    pub fn home(&self) -> Device {
        self.inner.home
    }

    pub fn has_host_mirror(&self) -> bool {
        self.inner.mirrors.read().host.is_some()
    }

    /// Accelerator holding a device mirror, if any.
    pub fn device_mirror(&self) -> Option<usize> {
        self.inner.mirrors.read().device.as_ref().map(|(i, _)| *i)
    }

    /// Whether both handles share the same allocation.
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Make a host mirror present. Returns the number of bytes copied
    /// from the device (0 if the host copy was already valid).
    pub(crate) fn download(&self) -> usize {
        if self.has_host_mirror() {
            return 0;
        }
        let mut guard = self.inner.mirrors.write();
        let m = &mut *guard;
        if m.host.is_some() {
            return 0;
        }
        match &m.device {
            Some((_, bytes)) => {
                let n = bytes.len();
                m.host = Some(HostData::from_bytes(self.inner.dtype, bytes));
                n
            }
            None => 0,
        }
    }

    /// Make a device mirror present on accelerator `index`. Returns the
    /// number of bytes copied to the device.
    pub(crate) fn upload(&self, index: usize) -> usize {
        if self.device_mirror() == Some(index) {
            return 0;
        }
        let mut guard = self.inner.mirrors.write();
        let m = &mut *guard;
        if let Some((i, _)) = &m.device {
            if *i == index {
                return 0;
            }
        }
        if m.host.is_none() {
            // moving between accelerators goes through the host
            if let Some((_, bytes)) = &m.device {
                m.host = Some(HostData::from_bytes(self.inner.dtype, bytes));
            }
        }
        let bytes = match &m.host {
            Some(h) => h.to_bytes(),
            None => return 0,
        };
        let n = bytes.len();
        m.device = Some((index, bytes));
        n
    }

    /// Read the host mirror, decoding the device mirror if needed.
    pub fn read<R>(&self, f: impl FnOnce(&HostData) -> R) -> R {
        self.download();
        let m = self.inner.mirrors.read();
        match &m.host {
            Some(h) => f(h),
            None => f(&HostData::zeros(self.inner.dtype, self.inner.numel)),
        }
    }

    /// Read the copy resident on accelerator `index`, falling back to the
    /// host copy when the device mirror lives elsewhere.
    pub(crate) fn read_device(&self, index: usize) -> HostData {
        {
            let m = self.inner.mirrors.read();
            if let Some((i, bytes)) = &m.device {
                if *i == index {
                    return HostData::from_bytes(self.inner.dtype, bytes);
                }
            }
        }
        self.read(HostData::clone)
    }

    /// Mutate the host mirror. Any device mirror is dropped.
    pub fn write<R>(&self, f: impl FnOnce(&mut HostData) -> R) -> R {
        self.download();
        let mut m = self.inner.mirrors.write();
        m.device = None;
        let dtype = self.inner.dtype;
        let numel = self.inner.numel;
        f(m.host.get_or_insert_with(|| HostData::zeros(dtype, numel)))
    }

    /// Copy the elements out as `T`.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        self.read(|h| h.to_vec())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("dtype", &self.inner.dtype)
            .field("numel", &self.inner.numel)
            .field("home", &self.inner.home)
            .field("host", &self.has_host_mirror())
            .field("device", &self.device_mirror())
            .finish()
    }
}
