// Autograd — reverse-mode differentiation over recorded operations
//
// A tensor takes part in differentiation once it carries an
// `AutogradContext`. Leaves get one from `with_grad()`; outputs of `*_grad`
// calls get one whenever any input requires gradients. A context holds:
//
//   requires_grad   whether gradients flow into this tensor
//   grad            the accumulated gradient (None until backward reaches it)
//   node            for non-leaves: the operation, its inputs, and any state
//                   the operation saved for backward
//
// backward():
//
//   1. Topologically sort every tracked tensor reachable from the root
//      (leaves first, root last).
//   2. Seed the root with the given gradient (ones by default).
//   3. Walk the order in reverse. Each tensor's pending gradient is added
//      into its context's `grad`; if it has a node, the operation's backward
//      rule maps that gradient to its inputs, which accumulate it as pending.
//
// Because a tensor is visited only after all of its consumers, the gradient
// it passes on already contains every contribution (c = a·a gives 2·a·g).
//
// Unless `retain_graph` is set, nodes are dropped as they are visited, which
// releases the forward tensors they kept alive. The tensors themselves stay
// tracked leaves afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::op::{Operation, TensorId};
use crate::tensor::Tensor;

/// One recorded operation application.
pub(crate) struct GraphNode<B: Backend> {
    pub(crate) op: Operation,
    pub(crate) inputs: Vec<Tensor<B>>,
    pub(crate) saved: Vec<Tensor<B>>,
}

impl<B: Backend> Clone for GraphNode<B> {
    fn clone(&self) -> Self {
        GraphNode {
            op: self.op.clone(),
            inputs: self.inputs.clone(),
            saved: self.saved.clone(),
        }
    }
}

/// Per-tensor autograd state.
pub struct AutogradContext<B: Backend> {
    requires_grad: bool,
    grad: RwLock<Option<Tensor<B>>>,
    node: RwLock<Option<GraphNode<B>>>,
}

impl<B: Backend> AutogradContext<B> {
    pub(crate) fn leaf() -> Self {
        AutogradContext {
            requires_grad: true,
            grad: RwLock::new(None),
            node: RwLock::new(None),
        }
    }

    pub(crate) fn with_node(node: GraphNode<B>) -> Self {
        AutogradContext {
            requires_grad: true,
            grad: RwLock::new(None),
            node: RwLock::new(Some(node)),
        }
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// The operation that produced this tensor, if it is not a leaf.
    pub fn operation(&self) -> Result<Option<Operation>> {
        let node = self.node.read().map_err(|_| Error::LockPoisoned("autograd node"))?;
        Ok(node.as_ref().map(|n| n.op.clone()))
    }

    pub fn grad(&self) -> Result<Option<Tensor<B>>> {
        let grad = self.grad.read().map_err(|_| Error::LockPoisoned("gradient"))?;
        Ok(grad.clone())
    }

    pub(crate) fn set_node(&self, node: GraphNode<B>) -> Result<()> {
        let mut slot = self.node.write().map_err(|_| Error::LockPoisoned("autograd node"))?;
        *slot = Some(node);
        Ok(())
    }

    pub(crate) fn clear_grad(&self) -> Result<()> {
        let mut grad = self.grad.write().map_err(|_| Error::LockPoisoned("gradient"))?;
        *grad = None;
        Ok(())
    }

    /// Add `incoming` into the stored gradient. The first store takes a
    /// copy: backward rules pass gradients through as views (identity
    /// reductions, the caller's seed), and a stored gradient must own its
    /// storage so in-place updates to it touch nothing else.
    fn accumulate(&self, incoming: Tensor<B>) -> Result<()> {
        let mut grad = self.grad.write().map_err(|_| Error::LockPoisoned("gradient"))?;
        let next = match grad.take() {
            Some(existing) => existing.binary(crate::backend::BinaryOp::Add, &incoming)?,
            None => incoming.deep_clone()?,
        };
        *grad = Some(next);
        Ok(())
    }

    fn inputs(&self) -> Result<Vec<Tensor<B>>> {
        let node = self.node.read().map_err(|_| Error::LockPoisoned("autograd node"))?;
        Ok(node.as_ref().map(|n| n.inputs.clone()).unwrap_or_default())
    }

    fn node_for_backward(&self, retain: bool) -> Result<Option<GraphNode<B>>> {
        let mut node = self.node.write().map_err(|_| Error::LockPoisoned("autograd node"))?;
        Ok(if retain { node.clone() } else { node.take() })
    }
}

/// Options for a backward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardOptions {
    /// Keep the recorded graph so backward can run through it again.
    pub retain_graph: bool,
}

impl BackwardOptions {
    pub fn retain_graph(mut self, retain: bool) -> Self {
        self.retain_graph = retain;
        self
    }
}

/// Attach a graph node to `out` if any input requires gradients.
pub(crate) fn record<B: Backend>(
    out: Tensor<B>,
    op: Operation,
    inputs: &[&Tensor<B>],
    saved: Vec<Tensor<B>>,
) -> Result<Tensor<B>> {
    if !inputs.iter().any(|t| t.requires_grad()) {
        return Ok(out);
    }
    tracing::trace!(op = op.name(), output = ?out.id(), "record graph node");
    let node = GraphNode {
        op,
        inputs: inputs.iter().map(|t| (*t).clone()).collect(),
        saved,
    };
    match out.autograd_context() {
        Some(ctx) => ctx.set_node(node)?,
        None => out.set_autograd_context(Some(Arc::new(AutogradContext::with_node(node)))),
    }
    Ok(out)
}

/// Tracked tensors reachable from `root`, leaves first, root last.
fn build_topo<B: Backend>(root: &Tensor<B>) -> Result<Vec<Tensor<B>>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    // (tensor, children already pushed)
    let mut stack = vec![(root.clone(), false)];

    while let Some((tensor, expanded)) = stack.pop() {
        if expanded {
            order.push(tensor);
            continue;
        }
        if !visited.insert(tensor.id()) {
            continue;
        }
        let inputs = match tensor.autograd_context() {
            Some(ctx) => ctx.inputs()?,
            None => continue,
        };
        stack.push((tensor, true));
        for input in inputs.into_iter().rev() {
            if !visited.contains(&input.id()) {
                stack.push((input, false));
            }
        }
    }
    Ok(order)
}

#[tracing::instrument(level = "debug", skip_all, fields(root = ?root.id()))]
pub(crate) fn run_backward<B: Backend>(
    root: &Tensor<B>,
    seed: Tensor<B>,
    options: BackwardOptions,
) -> Result<()> {
    if root.autograd_context().is_none() {
        return Err(Error::NoAutogradContext);
    }
    if seed.shape() != root.shape() {
        return Err(Error::ShapeMismatch {
            expected: root.shape().clone(),
            got: seed.shape().clone(),
        });
    }

    let order = build_topo(root)?;
    tracing::debug!(nodes = order.len(), "backward pass");

    let mut pending: HashMap<TensorId, Tensor<B>> = HashMap::new();
    pending.insert(root.id(), seed);

    for tensor in order.iter().rev() {
        let Some(grad) = pending.remove(&tensor.id()) else {
            continue;
        };
        let Some(ctx) = tensor.autograd_context() else {
            continue;
        };

        if let Some(node) = ctx.node_for_backward(options.retain_graph)? {
            let inputs: Vec<&Tensor<B>> = node.inputs.iter().collect();
            let input_grads = node.op.backward(&grad, &inputs, &node.saved)?;
            for (input, input_grad) in node.inputs.iter().zip(input_grads) {
                if !input.requires_grad() {
                    continue;
                }
                let merged = match pending.remove(&input.id()) {
                    Some(existing) => existing.binary(crate::backend::BinaryOp::Add, &input_grad)?,
                    None => input_grad,
                };
                pending.insert(input.id(), merged);
            }
        }

        ctx.accumulate(grad)?;
    }
    Ok(())
}
