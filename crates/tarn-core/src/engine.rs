//! Execution engine: plans pending graphs, dispatches nodes onto the host and
//! accelerator streams, and keeps transfer/compute statistics.
//!
//! ```text
//! caller:      [plan+submit][inline host nodes ....][wait root]
//! copy[i]:          [UPLOAD x1][UPLOAD x2][UPLOAD x3]
//! compute[i]:                  [COMPUTE 1][COMPUTE 2][COMPUTE 3]
//! callback:                               [cb 1]     [cb 2]     [cb 3]
//! ```
//!
//! Submission happens in topological order under one scheduler lock, so every
//! stream queue is consistent with a single global order and a task only
//! ever waits on work submitted before it.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::f64::consts::TAU;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::array::IntoArray;
use crate::buffer::{Buffer, HostData};
use crate::node::{KernelSource, Node, NodeRef, Op};
use crate::scope::{self, Scope};
use crate::stream::{Job, Signal, Stream};
use crate::{exec, DType, Device, EngineConfig, Result, Shape, TarnError, Tensor};

/// Minimum registry length before dead entries are swept.
const REGISTRY_SWEEP: usize = 256;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct Counters {
    transfers: AtomicU64,
    bytes: AtomicU64,
    transfer_ns: AtomicU64,
    compute_ns: AtomicU64,
    wait_ns: AtomicU64,
    kernels: AtomicU64,
}

fn add_time(counter: &AtomicU64, elapsed: Duration) {
    counter.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
}

/// State reachable from stream jobs. Jobs never hold the engine itself.
pub(crate) struct Shared {
    config: EngineConfig,
    counters: Counters,
}

impl Shared {
    fn record_transfer(&self, bytes: usize, elapsed: Duration) {
        self.counters.transfers.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        add_time(&self.counters.transfer_ns, elapsed);
    }

    /// Copy `buffer` to accelerator `index` over the simulated link.
    fn upload(&self, buffer: &Buffer, index: usize) {
        if buffer.device_mirror() == Some(index) {
            return;
        }
        let start = Instant::now();
        let bytes = buffer.upload(index);
        if bytes > 0 {
            thread::sleep(self.config.link_latency());
            self.record_transfer(bytes, start.elapsed());
            tracing::trace!(bytes, accel = index, "upload");
        }
    }

    /// Make the host mirror of `buffer` valid, paying the link latency when
    /// the data only lives on a device.
    pub(crate) fn download(&self, buffer: &Buffer) {
        if buffer.has_host_mirror() {
            return;
        }
        let start = Instant::now();
        let bytes = buffer.download();
        if bytes > 0 {
            thread::sleep(self.config.link_latency());
            self.record_transfer(bytes, start.elapsed());
            tracing::trace!(bytes, "download");
        }
    }
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineStats {
    pub transfers: u64,
    pub bytes_transferred: u64,
    pub transfer_time: Duration,
    pub compute_time: Duration,
    /// Time callers spent blocked on results.
    pub wait_time: Duration,
    pub kernels_run: u64,
}

impl EngineStats {
    /// `1 - wait / (transfer + compute)`, clamped at 0.
    pub fn overlap_efficiency(&self) -> f64 {
        let busy = (self.transfer_time + self.compute_time).as_secs_f64();
        if busy <= 0.0 {
            return 0.0;
        }
        (1.0 - self.wait_time.as_secs_f64() / busy).max(0.0)
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Engine: {} kernels, {} transfers ({} bytes), transfer {:.3}s, compute {:.3}s, wait {:.3}s, overlap {:.1}%",
            self.kernels_run,
            self.transfers,
            self.bytes_transferred,
            self.transfer_time.as_secs_f64(),
            self.compute_time.as_secs_f64(),
            self.wait_time.as_secs_f64(),
            self.overlap_efficiency() * 100.0,
        )
    }
}

struct Streams {
    host: Stream,
    copy: Vec<Stream>,
    compute: Vec<Stream>,
    callback: Stream,
}

impl Streams {
    fn spawn(accelerators: usize) -> Result<Self> {
        let mut copy = Vec::with_capacity(accelerators);
        let mut compute = Vec::with_capacity(accelerators);
        for i in 0..accelerators {
            copy.push(Stream::spawn(format!("copy{i}"))?);
            compute.push(Stream::spawn(format!("compute{i}"))?);
        }
        Ok(Self {
            host: Stream::spawn("host")?,
            copy,
            compute,
            callback: Stream::spawn("callback")?,
        })
    }

    fn all(&self) -> impl Iterator<Item = &Stream> {
        self.copy
            .iter()
            .chain(self.compute.iter())
            .chain(std::iter::once(&self.host))
            .chain(std::iter::once(&self.callback))
    }
}

struct Registry {
    nodes: Vec<Weak<Node>>,
    next_sweep: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            next_sweep: REGISTRY_SWEEP,
        }
    }
}

impl Registry {
    // the threshold doubles with the live count so sweeps stay amortized O(1)
    fn sweep(&mut self) {
        self.nodes.retain(|w| w.strong_count() > 0);
        self.next_sweep = REGISTRY_SWEEP.max(2 * self.nodes.len());
    }
}

struct EngineInner {
    id: u64,
    shared: Arc<Shared>,
    streams: Streams,
    sched: Mutex<()>,
    registry: Mutex<Registry>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        tracing::info!(engine = self.id, "engine shutting down");
    }
}

/// Handle to an execution engine. Cloning is cheap; the streams shut down
/// when the last handle (including those held by tensors) is dropped.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let streams = Streams::spawn(config.accelerators)?;
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            engine = id,
            accelerators = config.accelerators,
            default_device = %config.default_device,
            eager = config.eager,
            "engine started"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                id,
                shared: Arc::new(Shared {
                    config,
                    counters: Counters::default(),
                }),
                streams,
                sched: Mutex::new(()),
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    /// Defaults overridden by `TARN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(EngineConfig::from_env()?)
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.shared.config
    }

    pub fn accelerators(&self) -> usize {
        self.inner.shared.config.accelerators
    }

    /// Whether two handles refer to the same engine.
    pub fn same_engine(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Placement for tensors created through the engine itself. Other
    /// devices are reached through a [`Scope`].
    pub fn current_device(&self) -> Device {
        self.inner.shared.config.default_device
    }

    /// Enter a placement scope. Fails if `device` is not configured.
    pub fn scope(&self, device: Device) -> Result<Scope> {
        self.inner.shared.config.check_device(device)?;
        Ok(Scope::enter(self.clone(), device))
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Leaf tensor from host values on the current device.
    pub fn array(&self, values: impl IntoArray) -> Result<Tensor> {
        self.array_on(values, self.current_device())
    }

    pub fn zeros(&self, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        self.full(shape, 0.0, dtype)
    }

    pub fn ones(&self, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        self.full(shape, 1.0, dtype)
    }

    pub fn full(&self, shape: impl Into<Shape>, value: f64, dtype: DType) -> Result<Tensor> {
        self.full_on(shape.into(), value, dtype, self.current_device())
    }

    /// Rank-0 tensor.
    pub fn scalar(&self, value: f64, dtype: DType) -> Result<Tensor> {
        self.full(Shape::scalar(), value, dtype)
    }

    /// Standard-normal samples.
    pub fn randn(&self, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        let shape = shape.into();
        check_dims(&shape)?;
        if !dtype.is_float() {
            return Err(TarnError::UnsupportedDType { op: "randn", dtype });
        }
        let numel = shape.numel();
        let mut rng = rand::thread_rng();
        let mut samples = Vec::with_capacity(numel);
        // Box-Muller
        for _ in 0..(numel + 1) / 2 {
            let u1: f64 = rng.gen_range(1e-7..1.0);
            let u2: f64 = rng.gen_range(0.0..TAU);
            let r = (-2.0 * u1.ln()).sqrt();
            samples.push(r * u2.cos());
            samples.push(r * u2.sin());
        }
        samples.truncate(numel);
        let data = HostData::F64(samples).cast(dtype);
        Ok(self.leaf(data, shape, self.current_device()))
    }

    /// Tensor computed by a user kernel on the current device.
    pub fn code(
        &self,
        shape: impl Into<Shape>,
        dtype: DType,
        inputs: &[&Tensor],
        source: KernelSource,
    ) -> Result<Tensor> {
        self.code_on(shape.into(), dtype, inputs, source, self.current_device())
    }

    pub(crate) fn array_on(&self, values: impl IntoArray, device: Device) -> Result<Tensor> {
        let array = values.into_array()?;
        check_dims(&array.shape)?;
        Ok(self.leaf(array.data, array.shape, device))
    }

    pub(crate) fn full_on(&self, shape: Shape, value: f64, dtype: DType, device: Device) -> Result<Tensor> {
        check_dims(&shape)?;
        self.record(Op::Fill(value), Vec::new(), shape, dtype, device)
    }

    pub(crate) fn code_on(
        &self,
        shape: Shape,
        dtype: DType,
        inputs: &[&Tensor],
        source: KernelSource,
        device: Device,
    ) -> Result<Tensor> {
        check_dims(&shape)?;
        if source.host.is_none() && source.device.is_none() {
            return Err(TarnError::InvalidKernel(format!(
                "kernel '{}' has no host or device fragment",
                source.name
            )));
        }
        for input in inputs {
            self.check_same_engine(input)?;
        }
        let nodes = inputs.iter().map(|t| Arc::clone(t.node())).collect();
        self.record(Op::Custom(Arc::new(source)), nodes, shape, dtype, device)
    }

    pub(crate) fn check_same_engine(&self, tensor: &Tensor) -> Result<()> {
        if self.same_engine(tensor.engine()) {
            Ok(())
        } else {
            Err(TarnError::InvalidKernel("tensors belong to different engines".into()))
        }
    }

    /// Wrap host data as a materialized leaf.
    pub(crate) fn leaf(&self, data: HostData, shape: Shape, device: Device) -> Tensor {
        let buffer = Buffer::from_host(data, device);
        let node = Node::leaf(buffer, shape, device, !scope::is_grad_enabled());
        Tensor::from_parts(self.clone(), node)
    }

    /// Record a computed node. In eager mode it is materialized at once.
    pub(crate) fn record(
        &self,
        op: Op,
        inputs: Vec<Arc<Node>>,
        shape: Shape,
        dtype: DType,
        device: Device,
    ) -> Result<Tensor> {
        let stop_grad = matches!(op, Op::Detach) || !scope::is_grad_enabled();
        let node = Node::computed(op, inputs, shape, dtype, device, stop_grad);
        self.register(&node);
        let tensor = Tensor::from_parts(self.clone(), node);
        if self.inner.shared.config.eager {
            tensor.sync()?;
        }
        Ok(tensor)
    }

    fn register(&self, node: &Arc<Node>) {
        let mut reg = self.inner.registry.lock();
        reg.nodes.push(Arc::downgrade(node));
        if reg.nodes.len() >= reg.next_sweep {
            reg.sweep();
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Materialize `node`, running host nodes on the calling thread.
    pub(crate) fn materialize(&self, node: &Arc<Node>) -> Result<Buffer> {
        if let Some(result) = node.try_result() {
            return result;
        }
        let inline = self.submit(node, true)?;
        for n in &inline {
            execute(&self.inner.shared, n);
        }
        let start = Instant::now();
        let result = node.wait();
        add_time(&self.inner.shared.counters.wait_ns, start.elapsed());
        result
    }

    /// Schedule `node` and hand its result to `callback` on the callback
    /// stream. Callbacks run in submission order.
    pub(crate) fn fetch<F>(&self, node: NodeRef, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Buffer>) + Send + 'static,
    {
        self.submit(node.arc(), false)?;
        self.inner.streams.callback.submit(Box::new(move || {
            let result = node.wait();
            drop(node);
            callback(result);
        }))
    }

    /// Materialize every live node that has not finished yet. With
    /// `device_sync`, also wait until every stream is idle.
    pub fn sync_all(&self, device_sync: bool) -> Result<()> {
        // released intermediates already ran and stay released
        let pending: Vec<NodeRef> = {
            let mut reg = self.inner.registry.lock();
            reg.sweep();
            reg.nodes
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|n| n.try_result().is_none() && !n.is_released())
                .map(NodeRef::new)
                .collect()
        };
        tracing::debug!(pending = pending.len(), device_sync, "sync_all");

        let mut first_err = None;
        for node in &pending {
            if let Err(e) = self.materialize(node.arc()) {
                first_err.get_or_insert(e);
            }
        }
        drop(pending);

        if device_sync {
            self.drain_streams();
        }
        first_err.map_or(Ok(()), Err)
    }

    fn drain_streams(&self) {
        // callbacks may queue more work, so repeat until everything is idle
        loop {
            for stream in self.inner.streams.all() {
                stream.drain();
            }
            let busy = self
                .inner
                .streams
                .all()
                .any(|s| !s.is_current() && s.queued() > 0);
            if !busy {
                break;
            }
        }
    }

    /// Claim every pending node under `root` and queue it on its stream.
    /// With `inline_host`, host nodes are returned for the caller to run.
    fn submit(&self, root: &Arc<Node>, inline_host: bool) -> Result<Vec<Arc<Node>>> {
        let _sched = self.inner.sched.lock();
        let order = plan(root);
        if order.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(root = root.id(), nodes = order.len(), inline_host, "submit");

        let streams = &self.inner.streams;
        let mut inline = Vec::new();
        let mut uploads: HashMap<(u64, usize), Arc<Signal>> = HashMap::new();

        for node in order {
            if !node.claim() {
                continue;
            }
            match node.device() {
                Device::Cpu if inline_host => inline.push(node),
                Device::Cpu => {
                    let job = self.node_job(Arc::clone(&node), Vec::new());
                    self.queue(&streams.host, &node, job)?;
                }
                Device::Accel(i) => {
                    let mut waits = Vec::new();
                    if !node.op().shares_input_buffer() {
                        for input in node.inputs() {
                            if resident_on(input, i) {
                                continue;
                            }
                            let signal = match uploads.entry((input.id(), i)) {
                                Entry::Occupied(e) => Arc::clone(e.get()),
                                Entry::Vacant(e) => {
                                    let signal = Arc::new(Signal::default());
                                    let job = self.upload_job(Arc::clone(input), i, Arc::clone(&signal));
                                    self.queue(&streams.copy[i], &node, job)?;
                                    Arc::clone(e.insert(signal))
                                }
                            };
                            waits.push(signal);
                        }
                    }
                    let job = self.node_job(Arc::clone(&node), waits);
                    self.queue(&streams.compute[i], &node, job)?;
                }
            }
        }
        Ok(inline)
    }

    /// Submit `job`; on failure `node` is failed so nobody waits on it forever.
    fn queue(&self, stream: &Stream, node: &Arc<Node>, job: Job) -> Result<()> {
        stream.submit(job).map_err(|e| {
            tracing::warn!(stream = stream.name(), node = node.id(), "stream closed");
            node.complete(Err(e.clone()));
            e
        })
    }

    fn node_job(&self, node: Arc<Node>, waits: Vec<Arc<Signal>>) -> Job {
        let shared = Arc::clone(&self.inner.shared);
        Box::new(move || {
            for signal in &waits {
                signal.wait();
            }
            execute(&shared, &node);
        })
    }

    fn upload_job(&self, input: Arc<Node>, index: usize, signal: Arc<Signal>) -> Job {
        let shared = Arc::clone(&self.inner.shared);
        Box::new(move || {
            // a failed input surfaces through the consumer's own wait
            if let Ok(buffer) = input.wait() {
                shared.upload(&buffer, index);
            }
            signal.set();
        })
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.shared.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        EngineStats {
            transfers: load(&c.transfers),
            bytes_transferred: load(&c.bytes),
            transfer_time: Duration::from_nanos(load(&c.transfer_ns)),
            compute_time: Duration::from_nanos(load(&c.compute_ns)),
            wait_time: Duration::from_nanos(load(&c.wait_ns)),
            kernels_run: load(&c.kernels),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.inner.shared.counters;
        for counter in [&c.transfers, &c.bytes, &c.transfer_ns, &c.compute_ns, &c.wait_ns, &c.kernels] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("config", &self.inner.shared.config)
            .finish()
    }
}

fn check_dims(shape: &Shape) -> Result<()> {
    if shape.is_valid() {
        Ok(())
    } else {
        Err(TarnError::InvalidShape(format!(
            "dimensions must be positive, got {:?}",
            shape.dims()
        )))
    }
}

/// Pending nodes under `root`, inputs before consumers.
fn plan(root: &Arc<Node>) -> Vec<Arc<Node>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(Arc::clone(root), false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) || !node.is_pending() {
            continue;
        }
        stack.push((Arc::clone(&node), true));
        for input in node.inputs().iter().rev() {
            stack.push((Arc::clone(input), false));
        }
    }
    order
}

/// Whether `node`'s result is, or will be produced, on accelerator `index`.
fn resident_on(node: &Node, index: usize) -> bool {
    if let Some(buffer) = node.buffer() {
        return buffer.device_mirror() == Some(index);
    }
    match node.op() {
        Op::Leaf => false,
        Op::Reshape | Op::Detach => node.inputs().first().is_some_and(|n| resident_on(n, index)),
        _ => node.device() == Device::Accel(index),
    }
}

fn execute(shared: &Shared, node: &Node) {
    let result = run_node(shared, node);
    if let Err(e) = &result {
        tracing::debug!(node = node.id(), op = node.op().name(), error = %e, "node failed");
    }
    node.complete(result);
}

fn run_node(shared: &Shared, node: &Node) -> Result<Buffer> {
    let inputs = node
        .inputs()
        .iter()
        .map(|n| n.wait())
        .collect::<Result<Vec<_>>>()?;
    if node.op().shares_input_buffer() {
        return inputs
            .into_iter()
            .next()
            .ok_or_else(|| TarnError::InvalidKernel(format!("{} without input", node.op().name())));
    }

    let data: Vec<HostData> = match node.device() {
        Device::Cpu => inputs
            .iter()
            .map(|b| {
                shared.download(b);
                b.read(HostData::clone)
            })
            .collect(),
        Device::Accel(i) => inputs.iter().map(|b| b.read_device(i)).collect(),
    };

    tracing::trace!(node = node.id(), op = node.op().name(), device = %node.device(), "run");
    let start = Instant::now();
    let out = panic::catch_unwind(AssertUnwindSafe(|| exec::compute(node, &data))).unwrap_or_else(|_| {
        Err(TarnError::KernelExecution {
            kernel: node.op().name().to_string(),
            message: "kernel panicked".into(),
        })
    })?;
    add_time(&shared.counters.compute_ns, start.elapsed());
    shared.counters.kernels.fetch_add(1, Ordering::Relaxed);

    Ok(match node.device() {
        Device::Cpu => Buffer::from_host(out, Device::Cpu),
        Device::Accel(i) => Buffer::from_device(i, &out),
    })
}
