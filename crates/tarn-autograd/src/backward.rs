//! Backward pass: build gradient tensors for chosen inputs.

use std::collections::HashMap;

use tarn_core::{Result, Tensor};

use crate::grad_fn::vjp;
use crate::graph::reverse_topological;

/// Gradient of `output` with respect to `input`.
///
/// A non-scalar output is differentiated as the sum of its elements.
pub fn grad(output: &Tensor, input: &Tensor) -> Result<Tensor> {
    let mut grads = grad_many(output, &[input])?;
    Ok(grads.remove(0))
}

/// Gradients of `output` with respect to each of `inputs`, in order.
///
/// Inputs that `output` does not depend on through a differentiable path
/// get a zeros tensor of their own shape.
pub fn grad_many(output: &Tensor, inputs: &[&Tensor]) -> Result<Vec<Tensor>> {
    let mut grads: HashMap<u64, Tensor> = HashMap::new();

    if output.dtype().is_float() {
        grads.insert(output.node().id(), output.ones_like()?);
        let order = reverse_topological(output);
        tracing::debug!(nodes = order.len(), "backward");

        for tensor in &order {
            if tensor.is_stop_grad() {
                continue;
            }
            let Some(g) = grads.get(&tensor.node().id()).cloned() else {
                continue;
            };
            let input_grads = vjp(tensor, &g)?;
            for (input, maybe_grad) in tensor.inputs().iter().zip(input_grads) {
                let Some(ig) = maybe_grad else { continue };
                if !input.dtype().is_float() {
                    continue;
                }
                let ig = if ig.dtype() == input.dtype() {
                    ig
                } else {
                    ig.cast(input.dtype())?
                };
                accumulate(&mut grads, input, ig)?;
            }
        }
    } else {
        tracing::warn!(dtype = %output.dtype(), "output is not floating point; gradients are zero");
    }

    inputs
        .iter()
        .enumerate()
        .map(|(i, input)| match grads.remove(&input.node().id()) {
            Some(g) => Ok(g),
            None => {
                tracing::warn!(input = i, shape = ?input.shape().dims(), "input not reached from output; gradient is zero");
                input.zeros_like()
            }
        })
        .collect()
}

fn accumulate(grads: &mut HashMap<u64, Tensor>, input: &Tensor, g: Tensor) -> Result<()> {
    let id = input.node().id();
    let total = match grads.remove(&id) {
        Some(existing) => existing.add(&g)?,
        None => g,
    };
    grads.insert(id, total);
    Ok(())
}
