//! Immutable graph nodes and their materialization state.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::buffer::Buffer;
use crate::liveness::LiveToken;
use crate::{DType, Device, Result, Shape, TarnError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    Sqrt,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

/// A user-supplied element kernel. At least one fragment is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelSource {
    pub name: String,
    pub host: Option<String>,
    pub device: Option<String>,
}

impl KernelSource {
    /// A kernel with one fragment used on every device.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: Some(source.into()),
            device: None,
        }
    }

    pub fn with_device(mut self, source: impl Into<String>) -> Self {
        self.device = Some(source.into());
        self
    }

    /// Fragment to run on `device`: the device fragment on accelerators
    /// when present, otherwise the host fragment.
    pub fn fragment_for(&self, device: Device) -> Option<&str> {
        let (first, second) = match device {
            Device::Accel(_) => (&self.device, &self.host),
            Device::Cpu => (&self.host, &self.device),
        };
        first.as_deref().or(second.as_deref())
    }
}

/// Operation recorded by a node. Target shapes and dtypes are the node's own.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Data supplied at construction.
    Leaf,
    /// Every element set to a constant.
    Fill(f64),
    Unary(UnaryOp),
    /// Broadcasting binary arithmetic.
    Binary(BinaryOp),
    /// Broadcasting comparison, 1 where true and 0 elsewhere.
    Compare(CompareOp),
    /// Sum of all elements into a scalar.
    Sum,
    /// Sum over broadcast axes down to the node shape.
    ReduceTo,
    BroadcastTo,
    /// Same buffer, new shape.
    Reshape,
    /// Same buffer, no gradient.
    Detach,
    /// Swap the last two axes.
    Transpose,
    Matmul,
    Cast,
    Custom(Arc<KernelSource>),
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Leaf => "leaf",
            Op::Fill(_) => "fill",
            Op::Unary(UnaryOp::Neg) => "neg",
            Op::Unary(UnaryOp::Exp) => "exp",
            Op::Unary(UnaryOp::Log) => "log",
            Op::Unary(UnaryOp::Sqrt) => "sqrt",
            Op::Unary(UnaryOp::Abs) => "abs",
            Op::Binary(BinaryOp::Add) => "add",
            Op::Binary(BinaryOp::Sub) => "sub",
            Op::Binary(BinaryOp::Mul) => "mul",
            Op::Binary(BinaryOp::Div) => "div",
            Op::Binary(BinaryOp::Maximum) => "maximum",
            Op::Binary(BinaryOp::Minimum) => "minimum",
            Op::Compare(_) => "compare",
            Op::Sum => "sum",
            Op::ReduceTo => "reduce_to",
            Op::BroadcastTo => "broadcast_to",
            Op::Reshape => "reshape",
            Op::Detach => "detach",
            Op::Transpose => "transpose",
            Op::Matmul => "matmul",
            Op::Cast => "cast",
            Op::Custom(_) => "custom",
        }
    }

    /// Ops whose result is the input buffer itself.
    pub fn shares_input_buffer(&self) -> bool {
        matches!(self, Op::Reshape | Op::Detach)
    }
}

#[derive(Debug)]
pub(crate) enum NodeState {
    Empty,
    Scheduled,
    Ready(Buffer),
    Failed(TarnError),
    /// Was ready; the buffer was dropped and is recomputed on demand.
    Released,
}

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

/// One recorded operation. Everything except the result cell is fixed at
/// construction.
///
/// A computed node's buffer is dropped once no [`Tensor`](crate::Tensor)
/// or view refers to it and every consumer is ready. The node itself stays
/// in the graph and recomputes the buffer if it is asked for again.
pub struct Node {
    id: u64,
    op: Op,
    inputs: Vec<Arc<Node>>,
    shape: Shape,
    dtype: DType,
    device: Device,
    stop_grad: bool,
    state: Mutex<NodeState>,
    ready: Condvar,
    /// Tensor handles and views.
    handles: AtomicUsize,
    /// Consumers that still need this node's buffer.
    consumers: AtomicUsize,
    /// Whether this node is counted in its inputs' `consumers`.
    holds_inputs: AtomicBool,
    /// Written through a host view; never released.
    pinned: AtomicBool,
    _live: LiveToken,
}

impl Node {
    pub(crate) fn leaf(buffer: Buffer, shape: Shape, device: Device, stop_grad: bool) -> Arc<Self> {
        let dtype = buffer.dtype();
        Arc::new(Self::build(Op::Leaf, Vec::new(), shape, dtype, device, stop_grad, NodeState::Ready(buffer)))
    }

    pub(crate) fn computed(
        op: Op,
        inputs: Vec<Arc<Node>>,
        shape: Shape,
        dtype: DType,
        device: Device,
        stop_grad: bool,
    ) -> Arc<Self> {
        for input in &inputs {
            input.consumers.fetch_add(1, Ordering::AcqRel);
        }
        let node = Self::build(op, inputs, shape, dtype, device, stop_grad, NodeState::Empty);
        node.holds_inputs.store(true, Ordering::Release);
        Arc::new(node)
    }

    fn build(
        op: Op,
        inputs: Vec<Arc<Node>>,
        shape: Shape,
        dtype: DType,
        device: Device,
        stop_grad: bool,
        state: NodeState,
    ) -> Self {
        Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            op,
            inputs,
            shape,
            dtype,
            device,
            stop_grad,
            state: Mutex::new(state),
            ready: Condvar::new(),
            handles: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
            holds_inputs: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
            _live: LiveToken::node(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn inputs(&self) -> &[Arc<Node>] {
        &self.inputs
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.op, Op::Leaf)
    }

    /// Whether gradients stop at this node.
    pub fn is_stop_grad(&self) -> bool {
        self.stop_grad
    }

    pub fn is_materialized(&self) -> bool {
        matches!(*self.state.lock(), NodeState::Ready(_))
    }

    /// Materialized buffer, if ready.
    pub fn buffer(&self) -> Option<Buffer> {
        match &*self.state.lock() {
            NodeState::Ready(b) => Some(b.clone()),
            _ => None,
        }
    }

    /// Result if the node already finished, successfully or not.
    pub(crate) fn try_result(&self) -> Option<Result<Buffer>> {
        match &*self.state.lock() {
            NodeState::Ready(b) => Some(Ok(b.clone())),
            NodeState::Failed(e) => Some(Err(e.clone())),
            _ => None,
        }
    }

    /// Move `Empty | Released -> Scheduled`. Returns false if someone else
    /// owns the work.
    pub(crate) fn claim(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, NodeState::Empty | NodeState::Released) {
            *state = NodeState::Scheduled;
            true
        } else {
            false
        }
    }

    /// Needs to run before its buffer can be read.
    pub(crate) fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), NodeState::Empty | NodeState::Released)
    }

    pub(crate) fn is_released(&self) -> bool {
        matches!(*self.state.lock(), NodeState::Released)
    }

    pub(crate) fn complete(&self, result: Result<Buffer>) {
        let held = {
            let mut state = self.state.lock();
            *state = match result {
                Ok(b) => NodeState::Ready(b),
                Err(e) => NodeState::Failed(e),
            };
            self.ready.notify_all();
            self.holds_inputs.swap(false, Ordering::AcqRel)
        };
        if held {
            for input in &self.inputs {
                input.consumer_done();
            }
        }
    }

    fn consumer_done(&self) {
        if self.consumers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.release_if_unused();
        }
    }

    /// Drop the buffer of a ready computed node nobody can still observe.
    fn release_if_unused(&self) {
        if self.is_leaf() || self.pinned.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        if !matches!(*state, NodeState::Ready(_))
            || self.handles.load(Ordering::Acquire) != 0
            || self.consumers.load(Ordering::Acquire) != 0
        {
            return;
        }
        *state = NodeState::Released;
        // recomputing needs the inputs again
        if !self.holds_inputs.swap(true, Ordering::AcqRel) {
            for input in &self.inputs {
                input.consumers.fetch_add(1, Ordering::AcqRel);
            }
        }
        tracing::trace!(node = self.id, op = self.op.name(), "released buffer");
    }

    /// Keep the buffer for good, along with any buffer it shares.
    pub(crate) fn pin(&self) {
        let mut node = self;
        loop {
            node.pinned.store(true, Ordering::Release);
            match node.inputs.first() {
                Some(input) if node.op.shares_input_buffer() => node = input,
                _ => break,
            }
        }
    }

    /// Block until the node is ready or failed.
    pub(crate) fn wait(&self) -> Result<Buffer> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                NodeState::Ready(b) => return Ok(b.clone()),
                NodeState::Failed(e) => return Err(e.clone()),
                NodeState::Empty | NodeState::Scheduled | NodeState::Released => self.ready.wait(&mut state),
            }
        }
    }
}

impl Drop for Node {
    // inputs are unlinked with a worklist so a long chain never recurses
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.inputs);
        if *self.holds_inputs.get_mut() {
            for input in &stack {
                input.consumer_done();
            }
        }
        while let Some(node) = stack.pop() {
            if let Ok(mut node) = Arc::try_unwrap(node) {
                let inputs = std::mem::take(&mut node.inputs);
                if std::mem::replace(node.holds_inputs.get_mut(), false) {
                    for input in &inputs {
                        input.consumer_done();
                    }
                }
                stack.extend(inputs);
            }
        }
    }
}

/// Counted user reference to a node, held by tensors and host views.
pub(crate) struct NodeRef(Arc<Node>);

impl NodeRef {
    pub(crate) fn new(node: Arc<Node>) -> Self {
        node.handles.fetch_add(1, Ordering::AcqRel);
        Self(node)
    }

    pub(crate) fn arc(&self) -> &Arc<Node> {
        &self.0
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.0))
    }
}

impl Deref for NodeRef {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.0
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        if self.0.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.release_if_unused();
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("op", &self.op.name())
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("inputs", &self.inputs.iter().map(|n| n.id).collect::<Vec<_>>())
            .finish()
    }
}
