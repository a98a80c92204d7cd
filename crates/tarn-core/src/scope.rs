//! Placement scopes and the thread-local gradient switch.
//!
//! A [`Scope`] is an explicit placement: tensors created through it live on
//! its device. Engine-level constructors always use the configured default
//! device, so placement never leaks between threads or engines.

use std::cell::Cell;

use crate::array::IntoArray;
use crate::node::KernelSource;
use crate::{DType, Device, Engine, Result, Shape, Tensor};

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Placement guard for one device. Nested scopes come from
/// [`Scope::scope`]; the enclosing scope keeps its own device.
#[derive(Clone)]
pub struct Scope {
    engine: Engine,
    device: Device,
}

impl Scope {
    pub(crate) fn enter(engine: Engine, device: Device) -> Self {
        tracing::trace!(engine = engine.id(), %device, "enter scope");
        Self { engine, device }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Nested scope on `device`. Fails if `device` is not configured.
    pub fn scope(&self, device: Device) -> Result<Scope> {
        self.engine.scope(device)
    }

    pub fn array(&self, values: impl IntoArray) -> Result<Tensor> {
        self.engine.array_on(values, self.device)
    }

    pub fn zeros(&self, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        self.full(shape, 0.0, dtype)
    }

    pub fn ones(&self, shape: impl Into<Shape>, dtype: DType) -> Result<Tensor> {
        self.full(shape, 1.0, dtype)
    }

    pub fn full(&self, shape: impl Into<Shape>, value: f64, dtype: DType) -> Result<Tensor> {
        self.engine.full_on(shape.into(), value, dtype, self.device)
    }

    pub fn scalar(&self, value: f64, dtype: DType) -> Result<Tensor> {
        self.full(Shape::scalar(), value, dtype)
    }

    /// User kernel evaluated on this scope's device.
    pub fn code(&self, shape: impl Into<Shape>, dtype: DType, inputs: &[&Tensor], source: KernelSource) -> Result<Tensor> {
        self.engine.code_on(shape.into(), dtype, inputs, source, self.device)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").field("device", &self.device).finish()
    }
}

/// Check if gradient tracking is enabled on this thread.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

fn set_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|g| {
        let prev = g.get();
        g.set(enabled);
        prev
    })
}

/// RAII guard: nodes created while it lives are stop-gradient.
///
/// ```ignore
/// let _guard = NoGradGuard::new();
/// let y = x.mul(&x)?; // y.is_stop_grad()
/// ```
pub struct NoGradGuard {
    prev: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        let prev = set_grad_enabled(false);
        Self { prev }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}
