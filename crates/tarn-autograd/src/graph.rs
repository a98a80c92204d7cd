use std::collections::HashSet;

use tarn_core::Tensor;

/// Tensors reachable from `root`, consumers before their inputs.
///
/// Inputs of stop-gradient nodes are not visited: nothing flows past them.
pub fn reverse_topological(root: &Tensor) -> Vec<Tensor> {
    let mut post_order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root.clone(), false)];

    while let Some((tensor, expanded)) = stack.pop() {
        if expanded {
            post_order.push(tensor);
            continue;
        }
        if !visited.insert(tensor.node().id()) {
            continue;
        }
        stack.push((tensor.clone(), true));
        if tensor.is_stop_grad() {
            continue;
        }
        for input in tensor.inputs().into_iter().rev() {
            stack.push((input, false));
        }
    }

    post_order.reverse();
    post_order
}
