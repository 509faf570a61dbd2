use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::trace;

use crate::autofunc::{Gradient, RGradient, RValue, RVariable, RVector, Value, Variable, Vector};
use crate::block::{
    Block, BlockInput, BlockOutput, BlockRInput, BlockROutput, UpstreamGradient,
    UpstreamRGradient,
};
use crate::errors::Result;
use crate::seq_func::{RResultSeqs, ResultSeqs, SeqFunc, check_upstream_shape};
use crate::serializer;

/// A [`SeqFunc`] that runs a [`Block`] as an RNN over each input sequence.
#[derive(Clone)]
pub struct BlockSeqFunc {
    pub block: Rc<dyn Block>,
}

impl BlockSeqFunc {
    pub fn new(block: Rc<dyn Block>) -> Self {
        Self { block }
    }

    /// Decodes the block written by [`SeqFunc::serialize`].
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let block = serializer::deserialize_with_type(data)?.into_block()?;
        Ok(Self { block })
    }

    /// The forward pass of [`SeqFunc::batch_seqs`] with its concrete output,
    /// which also reports which lanes ran at each timestep.
    pub fn unroll(&self, seqs: &[Vec<Rc<dyn Value>>]) -> BlockSeqFuncOutput {
        let start_state = self.block.start_state();
        let start_vec = start_state.output();
        let mut packed_out = vec![Vec::new(); seqs.len()];
        let mut steps: Vec<Step> = Vec::new();

        for t in 0.. {
            let mut slots = Vec::new();
            let mut lane_to_out = BTreeMap::new();
            let mut input = BlockInput::default();
            for (lane, seq) in seqs.iter().enumerate() {
                let Some(value) = seq.get(t) else {
                    continue;
                };
                let in_state = match steps.last() {
                    Some(prev) => prev.outputs.states()[prev.lane_to_out[&lane]].clone(),
                    None => start_vec.clone(),
                };
                let slot = LaneSlot {
                    lane,
                    input: value.clone(),
                    input_var: Variable::new(value.output()),
                    state_var: Variable::new(in_state),
                };
                lane_to_out.insert(lane, slots.len());
                input.push(slot.input_var.clone(), slot.state_var.clone());
                slots.push(slot);
            }
            if slots.is_empty() {
                break;
            }

            let outputs = self.block.batch(&input);
            for (pos, slot) in slots.iter().enumerate() {
                packed_out[slot.lane].push(outputs.outputs()[pos].clone());
            }
            steps.push(Step {
                slots,
                lane_to_out,
                outputs,
            });
        }

        trace!(lanes = seqs.len(), timesteps = steps.len(), "unrolled block");
        BlockSeqFuncOutput {
            start_state,
            steps,
            packed_out,
        }
    }
}

impl SeqFunc for BlockSeqFunc {
    fn seq_func_type(&self) -> &str {
        "BlockSeqFunc"
    }

    fn batch_seqs(&self, seqs: &[Vec<Rc<dyn Value>>]) -> Box<dyn ResultSeqs> {
        Box::new(self.unroll(seqs))
    }

    fn batch_seqs_r(&self, rv: &RVector, seqs: &[Vec<Rc<dyn RValue>>]) -> Box<dyn RResultSeqs> {
        let start_state = self.block.start_state_r(rv);
        let start_vec = start_state.output();
        let start_r_vec = start_state.r_output();
        let mut packed_out = vec![Vec::new(); seqs.len()];
        let mut r_packed_out = vec![Vec::new(); seqs.len()];
        let mut steps: Vec<RStep> = Vec::new();

        for t in 0.. {
            let mut slots = Vec::new();
            let mut lane_to_out = BTreeMap::new();
            let mut input = BlockRInput::default();
            for (lane, seq) in seqs.iter().enumerate() {
                let Some(value) = seq.get(t) else {
                    continue;
                };
                let (in_state, in_r_state) = match steps.last() {
                    Some(prev) => {
                        let pos = prev.lane_to_out[&lane];
                        (
                            prev.outputs.states()[pos].clone(),
                            prev.outputs.r_states()[pos].clone(),
                        )
                    }
                    None => (start_vec.clone(), start_r_vec.clone()),
                };
                let slot = RLaneSlot {
                    lane,
                    input: value.clone(),
                    input_var: RVariable::with_r_output(
                        Variable::new(value.output()),
                        value.r_output(),
                    ),
                    state_var: RVariable::with_r_output(Variable::new(in_state), in_r_state),
                };
                lane_to_out.insert(lane, slots.len());
                input.push(slot.input_var.clone(), slot.state_var.clone());
                slots.push(slot);
            }
            if slots.is_empty() {
                break;
            }

            let outputs = self.block.batch_r(rv, &input);
            for (pos, slot) in slots.iter().enumerate() {
                packed_out[slot.lane].push(outputs.outputs()[pos].clone());
                r_packed_out[slot.lane].push(outputs.r_outputs()[pos].clone());
            }
            steps.push(RStep {
                slots,
                lane_to_out,
                outputs,
            });
        }

        trace!(lanes = seqs.len(), timesteps = steps.len(), "unrolled block with R");
        Box::new(BlockSeqFuncROutput {
            start_state,
            steps,
            packed_out,
            r_packed_out,
        })
    }

    fn parameters(&self) -> Result<Vec<Rc<Variable>>> {
        self.block.parameters()
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        serializer::serialize_with_type(serializer::BLOCK_SEQ_FUNC, self.block.serialize()?)
    }
}

/// One active lane at one timestep.
struct LaneSlot {
    lane: usize,
    input: Rc<dyn Value>,
    input_var: Rc<Variable>,
    state_var: Rc<Variable>,
}

struct Step {
    /// Ordered by position within the block batch.
    slots: Vec<LaneSlot>,
    lane_to_out: BTreeMap<usize, usize>,
    outputs: Box<dyn BlockOutput>,
}

pub struct BlockSeqFuncOutput {
    start_state: Rc<dyn Value>,
    steps: Vec<Step>,
    packed_out: Vec<Vec<Vector>>,
}

impl BlockSeqFuncOutput {
    /// Number of timesteps the longest lane ran for.
    pub fn timesteps(&self) -> usize {
        self.steps.len()
    }

    /// Lanes that were active at timestep `t`, in batch order.
    pub fn active_lanes(&self, t: usize) -> Vec<usize> {
        self.steps
            .get(t)
            .map(|s| s.lane_to_out.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl ResultSeqs for BlockSeqFuncOutput {
    fn output_seqs(&self) -> &[Vec<Vector>] {
        &self.packed_out
    }

    fn gradient(&self, upstream: &[Vec<Vector>], g: &mut Gradient) {
        check_upstream_shape(&self.packed_out, upstream);

        let mut state_upstreams: Vec<Option<Vector>> = vec![None; self.packed_out.len()];
        for (t, step) in self.steps.iter().enumerate().rev() {
            let mut outputs = Vec::with_capacity(step.slots.len());
            let mut states = Vec::with_capacity(step.slots.len());
            let mut needs_input = Vec::with_capacity(step.slots.len());
            for slot in &step.slots {
                let state_len = slot.state_var.len();
                outputs.push(upstream[slot.lane][t].clone());
                states.push(
                    state_upstreams[slot.lane]
                        .take()
                        .unwrap_or_else(|| Vector::zeros(state_len)),
                );
                g.insert(slot.state_var.id(), Vector::zeros(state_len));
                let needs = !slot.input.constant(g);
                if needs {
                    g.insert(slot.input_var.id(), Vector::zeros(slot.input_var.len()));
                }
                needs_input.push(needs);
            }

            let step_upstream = UpstreamGradient {
                states: Some(states),
                outputs: Some(outputs),
            };
            step.outputs.gradient(&step_upstream, g);

            for (slot, needs) in step.slots.iter().zip(needs_input) {
                let state_grad = g
                    .remove(slot.state_var.id())
                    .expect("state gradient entry must survive the block");
                state_upstreams[slot.lane] = Some(state_grad);
                if needs {
                    let input_grad = g
                        .remove(slot.input_var.id())
                        .expect("input gradient entry must survive the block");
                    slot.input.propagate_gradient(&input_grad, g);
                }
            }
        }

        for upstream in state_upstreams.iter().flatten() {
            self.start_state.propagate_gradient(upstream, g);
        }
    }
}

struct RLaneSlot {
    lane: usize,
    input: Rc<dyn RValue>,
    input_var: RVariable,
    state_var: RVariable,
}

struct RStep {
    slots: Vec<RLaneSlot>,
    lane_to_out: BTreeMap<usize, usize>,
    outputs: Box<dyn BlockROutput>,
}

pub struct BlockSeqFuncROutput {
    start_state: Rc<dyn RValue>,
    steps: Vec<RStep>,
    packed_out: Vec<Vec<Vector>>,
    r_packed_out: Vec<Vec<Vector>>,
}

impl RResultSeqs for BlockSeqFuncROutput {
    fn output_seqs(&self) -> &[Vec<Vector>] {
        &self.packed_out
    }

    fn r_output_seqs(&self) -> &[Vec<Vector>] {
        &self.r_packed_out
    }

    fn r_gradient(
        &self,
        upstream: &[Vec<Vector>],
        upstream_r: &[Vec<Vector>],
        rg: &mut RGradient,
        g: &mut Gradient,
    ) {
        check_upstream_shape(&self.packed_out, upstream);
        check_upstream_shape(&self.packed_out, upstream_r);

        let lanes = self.packed_out.len();
        let mut state_upstreams: Vec<Option<(Vector, Vector)>> = vec![None; lanes];
        for (t, step) in self.steps.iter().enumerate().rev() {
            let n = step.slots.len();
            let mut step_upstream = UpstreamRGradient {
                states: Some(Vec::with_capacity(n)),
                outputs: Some(Vec::with_capacity(n)),
                r_states: Some(Vec::with_capacity(n)),
                r_outputs: Some(Vec::with_capacity(n)),
            };
            let mut needs_input = Vec::with_capacity(n);
            for slot in &step.slots {
                let state_id = slot.state_var.variable.id();
                let state_len = slot.state_var.variable.len();
                let (s, s_r) = state_upstreams[slot.lane]
                    .take()
                    .unwrap_or_else(|| (Vector::zeros(state_len), Vector::zeros(state_len)));
                push(&mut step_upstream.outputs, upstream[slot.lane][t].clone());
                push(&mut step_upstream.r_outputs, upstream_r[slot.lane][t].clone());
                push(&mut step_upstream.states, s);
                push(&mut step_upstream.r_states, s_r);

                g.insert(state_id, Vector::zeros(state_len));
                rg.insert(state_id, Vector::zeros(state_len));
                let needs = !slot.input.constant(rg, g);
                if needs {
                    let v = &slot.input_var.variable;
                    g.insert(v.id(), Vector::zeros(v.len()));
                    rg.insert(v.id(), Vector::zeros(v.len()));
                }
                needs_input.push(needs);
            }

            step.outputs.r_gradient(&step_upstream, rg, g);

            for (slot, needs) in step.slots.iter().zip(needs_input) {
                let state_id = slot.state_var.variable.id();
                let grad = g
                    .remove(state_id)
                    .expect("state gradient entry must survive the block");
                let r_grad = rg
                    .remove(state_id)
                    .expect("state R-gradient entry must survive the block");
                state_upstreams[slot.lane] = Some((grad, r_grad));
                if needs {
                    let id = slot.input_var.variable.id();
                    let up = g.remove(id).expect("input gradient entry must survive the block");
                    let up_r = rg
                        .remove(id)
                        .expect("input R-gradient entry must survive the block");
                    slot.input.propagate_r_gradient(&up, &up_r, rg, g);
                }
            }
        }

        for (up, up_r) in state_upstreams.iter().flatten() {
            self.start_state.propagate_r_gradient(up, up_r, rg, g);
        }
    }
}

fn push(half: &mut Option<Vec<Vector>>, v: Vector) {
    if let Some(list) = half {
        list.push(v);
    }
}
