use std::rc::Rc;

use crate::autofunc::{Gradient, RGradient, RValue, RVariable, RVector, Value, Variable, Vector};
use crate::errors::{Result, RnnError};

/// A unit of a recurrent network that maps (input, state) pairs to
/// (output, state) pairs for a batch of lanes at once.
pub trait Block {
    fn block_type(&self) -> &str;

    /// Number of values in every state of this block.
    fn state_size(&self) -> usize;

    /// Initial state for new sequences. May be trainable.
    fn start_state(&self) -> Rc<dyn Value>;

    fn start_state_r(&self, rv: &RVector) -> Rc<dyn RValue>;

    /// The result stays valid as long as neither the input nor the block
    /// changes.
    fn batch(&self, input: &BlockInput) -> Box<dyn BlockOutput>;

    /// `rv` tells the block how its own parameters move with R.
    fn batch_r(&self, rv: &RVector, input: &BlockRInput) -> Box<dyn BlockROutput>;

    /// Learnable parameters, in a fixed order.
    fn parameters(&self) -> Result<Vec<Rc<Variable>>> {
        Err(RnnError::unsupported(self.block_type(), "parameters"))
    }

    /// Typed encoding of this block, see [`crate::serializer`].
    fn serialize(&self) -> Result<Vec<u8>> {
        Err(RnnError::unsupported(self.block_type(), "serialization"))
    }
}

/// Gradient of some downstream quantity with respect to a block's outputs and
/// output states. A `None` half is entirely zero.
#[derive(Debug, Clone, Default)]
pub struct UpstreamGradient {
    pub states: Option<Vec<Vector>>,
    pub outputs: Option<Vec<Vector>>,
}

/// Like [`UpstreamGradient`] with the derivatives of each half with respect
/// to R. An ordinary half is `None` exactly when its R half is.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRGradient {
    pub states: Option<Vec<Vector>>,
    pub outputs: Option<Vec<Vector>>,
    pub r_states: Option<Vec<Vector>>,
    pub r_outputs: Option<Vec<Vector>>,
}

impl UpstreamRGradient {
    pub(crate) fn check_pairing(&self) {
        assert_eq!(
            self.states.is_some(),
            self.r_states.is_some(),
            "state upstream and its R derivative must both be present or absent"
        );
        assert_eq!(
            self.outputs.is_some(),
            self.r_outputs.is_some(),
            "output upstream and its R derivative must both be present or absent"
        );
    }
}

/// A batch of inputs and incoming states, one of each per active lane.
#[derive(Debug, Clone, Default)]
pub struct BlockInput {
    pub inputs: Vec<Rc<Variable>>,
    pub states: Vec<Rc<Variable>>,
}

impl BlockInput {
    pub fn new(inputs: Vec<Rc<Variable>>, states: Vec<Rc<Variable>>) -> Self {
        assert_eq!(
            inputs.len(),
            states.len(),
            "block input has {} inputs but {} states",
            inputs.len(),
            states.len()
        );
        Self { inputs, states }
    }

    pub fn push(&mut self, input: Rc<Variable>, state: Rc<Variable>) {
        self.inputs.push(input);
        self.states.push(state);
    }

    pub fn lanes(&self) -> usize {
        self.inputs.len()
    }
}

/// A [`BlockInput`] whose entries carry R derivatives.
#[derive(Debug, Clone, Default)]
pub struct BlockRInput {
    pub inputs: Vec<RVariable>,
    pub states: Vec<RVariable>,
}

impl BlockRInput {
    pub fn new(inputs: Vec<RVariable>, states: Vec<RVariable>) -> Self {
        assert_eq!(
            inputs.len(),
            states.len(),
            "block input has {} inputs but {} states",
            inputs.len(),
            states.len()
        );
        Self { inputs, states }
    }

    pub fn push(&mut self, input: RVariable, state: RVariable) {
        self.inputs.push(input);
        self.states.push(state);
    }

    pub fn lanes(&self) -> usize {
        self.inputs.len()
    }
}

/// Outputs and new states of one block application.
pub trait BlockOutput {
    fn states(&self) -> &[Vector];

    fn outputs(&self) -> &[Vector];

    /// Adds the effect of `upstream` into `g`: the block's parameters and the
    /// input/state variables that have entries.
    fn gradient(&self, upstream: &UpstreamGradient, g: &mut Gradient);
}

pub trait BlockROutput {
    fn states(&self) -> &[Vector];

    fn outputs(&self) -> &[Vector];

    fn r_states(&self) -> &[Vector];

    fn r_outputs(&self) -> &[Vector];

    /// Propagates the ordinary and R upstreams in a single pass.
    fn r_gradient(&self, upstream: &UpstreamRGradient, rg: &mut RGradient, g: &mut Gradient);
}
