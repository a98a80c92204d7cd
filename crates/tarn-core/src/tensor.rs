use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::oneshot;

use crate::array::IntoArray;
use crate::buffer::{Buffer, HostData};
use crate::dtype::Element;
use crate::node::{Node, NodeRef, Op};
use crate::{DType, Device, Engine, Result, Shape, TarnError};

/// A lazy tensor handle.
///
/// Holds the engine and a shared, immutable graph node. Operations record
/// new nodes; nothing runs until [`sync`](Tensor::sync),
/// [`fetch`](Tensor::fetch) or a host read asks for the values.
#[derive(Clone)]
pub struct Tensor {
    engine: Engine,
    node: NodeRef,
}

impl Tensor {
    pub(crate) fn from_parts(engine: Engine, node: Arc<Node>) -> Self {
        Self {
            engine,
            node: NodeRef::new(node),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        self.node.shape()
    }

    pub fn dtype(&self) -> DType {
        self.node.dtype()
    }

    pub fn device(&self) -> Device {
        self.node.device()
    }

    pub fn ndim(&self) -> usize {
        self.node.shape().ndim()
    }

    pub fn numel(&self) -> usize {
        self.node.shape().numel()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn node(&self) -> &Arc<Node> {
        self.node.arc()
    }

    pub fn op(&self) -> &Op {
        self.node.op()
    }

    /// Input tensors of the recorded operation.
    pub fn inputs(&self) -> Vec<Tensor> {
        self.node
            .inputs()
            .iter()
            .map(|n| Tensor::from_parts(self.engine.clone(), Arc::clone(n)))
            .collect()
    }

    pub fn is_stop_grad(&self) -> bool {
        self.node.is_stop_grad()
    }

    pub fn is_materialized(&self) -> bool {
        self.node.is_materialized()
    }

    /// Whether both handles share one node.
    pub fn same_node(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(self.node.arc(), other.node.arc())
    }

    // =========================================================================
    // Materialization
    // =========================================================================

    /// Materialize, blocking until the buffer is ready.
    pub fn sync(&self) -> Result<Buffer> {
        self.engine.materialize(self.node.arc())
    }

    /// Schedule materialization and return at once. `callback` runs on the
    /// engine's callback stream, after callbacks of earlier fetches.
    pub fn fetch<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Buffer>) + Send + 'static,
    {
        self.engine.fetch(self.node.clone(), callback)
    }

    /// Await materialization from async code.
    pub async fn materialize(&self) -> Result<Buffer> {
        let (tx, rx) = oneshot::channel();
        self.fetch(move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| TarnError::EngineShutdown)?
    }

    /// Host buffer after materialization, downloaded if device-resident.
    fn host_buffer(&self) -> Result<Buffer> {
        let buffer = self.sync()?;
        self.engine.shared().download(&buffer);
        Ok(buffer)
    }

    /// Strong host view. Keeps the node alive.
    pub fn data(&self) -> Result<DataView> {
        let buffer = self.host_buffer()?;
        Ok(DataView {
            node: self.node.clone(),
            buffer,
        })
    }

    /// Host view that does not keep the node alive.
    pub fn weak_data(&self) -> Result<WeakDataView> {
        self.host_buffer()?;
        Ok(WeakDataView {
            node: Arc::downgrade(self.node.arc()),
        })
    }

    /// Values as `T`, converted from the tensor dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.host_buffer()?.to_vec())
    }

    /// The single value of a one-element tensor.
    pub fn item<T: Element>(&self) -> Result<T> {
        if self.numel() != 1 {
            return Err(TarnError::ShapeMismatch {
                expected: Vec::new(),
                got: self.shape().dims().to_vec(),
            });
        }
        let buffer = self.host_buffer()?;
        Ok(buffer.read(|h| T::from_f64(h.get_f64(0).unwrap_or_default())))
    }

    // =========================================================================
    // Rebinding
    // =========================================================================

    /// Point this handle at a new leaf holding `values`, cast to the current
    /// dtype. Other handles keep the old node.
    pub fn set_data(&mut self, values: impl IntoArray) -> Result<()> {
        let array = values.into_array()?;
        if array.shape.numel() != self.numel() {
            return Err(TarnError::ShapeMismatch {
                expected: self.shape().dims().to_vec(),
                got: array.shape.dims().to_vec(),
            });
        }
        self.rebind(array.data.cast(self.dtype()));
        Ok(())
    }

    /// Point this handle at a new leaf holding a copy of `other`'s values.
    pub fn assign(&mut self, other: &Tensor) -> Result<()> {
        if other.shape() != self.shape() {
            return Err(TarnError::ShapeMismatch {
                expected: self.shape().dims().to_vec(),
                got: other.shape().dims().to_vec(),
            });
        }
        let data = other.host_buffer()?.read(|h| h.cast(self.dtype()));
        self.rebind(data);
        Ok(())
    }

    fn rebind(&mut self, data: HostData) {
        let buffer = Buffer::from_host(data, self.device());
        self.node = NodeRef::new(Node::leaf(buffer, self.shape().clone(), self.device(), self.is_stop_grad()));
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(op={}, shape={:?}, dtype={}, device={}, materialized={})",
            self.op().name(),
            self.shape(),
            self.dtype(),
            self.device(),
            self.is_materialized(),
        )
    }
}

/// Host view of a materialized tensor.
///
/// Holds the node strongly, so the buffer outlives the tensor handle that
/// produced it. Writes go through the buffer's write lock and drop any
/// device copy; a written node keeps its buffer for good.
pub struct DataView {
    node: NodeRef,
    buffer: Buffer,
}

impl DataView {
    pub fn shape(&self) -> &Shape {
        self.node.shape()
    }

    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    fn offset(&self, index: &[usize]) -> Result<usize> {
        let shape = self.node.shape();
        if index.len() != shape.ndim() {
            return Err(TarnError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: index.to_vec(),
            });
        }
        let strides = shape.contiguous_strides();
        let mut offset = 0;
        for (axis, (&i, &d)) in index.iter().zip(shape.dims()).enumerate() {
            if i >= d {
                return Err(TarnError::InvalidShape(format!(
                    "index {i} out of bounds for axis {axis} of size {d}"
                )));
            }
            offset += i * strides[axis];
        }
        Ok(offset)
    }

    pub fn get<T: Element>(&self, index: &[usize]) -> Result<T> {
        let offset = self.offset(index)?;
        Ok(self.buffer.read(|h| T::from_f64(h.get_f64(offset).unwrap_or_default())))
    }

    pub fn set<T: Element>(&self, index: &[usize], value: T) -> Result<()> {
        let offset = self.offset(index)?;
        self.node.pin();
        self.buffer.write(|h| h.set_f64(offset, value.to_f64()));
        Ok(())
    }

    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        self.buffer.to_vec()
    }

    pub fn read<R>(&self, f: impl FnOnce(&HostData) -> R) -> R {
        self.buffer.read(f)
    }

    /// Mutate the elements in place. `T` must match the dtype.
    pub fn update<T: Element, R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let mismatch = TarnError::DTypeMismatch {
            expected: self.dtype(),
            got: T::DTYPE,
        };
        if T::DTYPE != self.dtype() {
            return Err(mismatch);
        }
        self.node.pin();
        self.buffer.write(|h| T::host_slice_mut(h).map(f).ok_or(mismatch))
    }

    pub fn downgrade(&self) -> WeakDataView {
        WeakDataView {
            node: Arc::downgrade(self.node.arc()),
        }
    }
}

impl fmt::Debug for DataView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataView")
            .field("node", &self.node.id())
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// Host view that does not extend the tensor's lifetime.
#[derive(Debug, Clone)]
pub struct WeakDataView {
    node: Weak<Node>,
}

impl WeakDataView {
    pub fn is_alive(&self) -> bool {
        self.node.strong_count() > 0
    }

    /// Strong view, if the node is still alive.
    pub fn upgrade(&self) -> Option<DataView> {
        let node = NodeRef::new(self.node.upgrade()?);
        let buffer = node.buffer()?;
        Some(DataView { node, buffer })
    }
}
