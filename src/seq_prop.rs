//! Truncated back-propagation through time.
//!
//! A session is fed one timestep at a time and keeps a bounded window of
//! records, so a stream can be trained online without unrolling all of it.

use std::collections::VecDeque;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::autofunc::{Gradient, RGradient, RValue, RVariable, RVector, Value, Variable, Vector};
use crate::block::{Block, BlockInput, BlockOutput, BlockRInput, BlockROutput, UpstreamGradient, UpstreamRGradient};
use crate::cost::CostFunc;
use crate::errors::{Result, RnnError};

/// A training sequence: inputs and the desired output for each input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(with = "vector_seq")]
    pub inputs: Vec<Vector>,
    #[serde(with = "vector_seq")]
    pub outputs: Vec<Vector>,
}

/// Stores a sequence of vectors as plain nested arrays, e.g. `[[0.1], [0.2]]`.
mod vector_seq {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::autofunc::Vector;

    pub fn serialize<S: Serializer>(seq: &[Vector], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(seq.iter().map(|v| v.to_vec()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vector>, D::Error> {
        let raw = Vec::<Vec<f64>>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(Vector::from).collect())
    }
}

impl Sample {
    pub fn new(inputs: Vec<Vector>, outputs: Vec<Vector>) -> Self {
        assert_eq!(
            inputs.len(),
            outputs.len(),
            "sample has {} inputs but {} outputs",
            inputs.len(),
            outputs.len()
        );
        Self { inputs, outputs }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Drops the first timestep, or returns `None` if nothing would remain.
    fn without_first(mut self) -> Option<Self> {
        if self.inputs.len() <= 1 {
            return None;
        }
        self.inputs.remove(0);
        self.outputs.remove(0);
        Some(self)
    }
}

/// What one timestep leaves behind for the backward pass.
struct Record<O: ?Sized, S: ?Sized, V> {
    /// Only set on the first record of the stream.
    start_state: Option<Rc<S>>,
    output: Box<O>,
    in_states: Vec<V>,
    targets: Vec<Vector>,
    /// Whether each lane has another timestep after this one.
    continues: Vec<bool>,
}

type PropRecord = Record<dyn BlockOutput, dyn Value, Rc<Variable>>;
type RPropRecord = Record<dyn BlockROutput, dyn RValue, RVariable>;

/// Window bounds of one back-propagation call.
struct Window {
    low: usize,
    low_head: usize,
    to_start_state: bool,
}

fn window<O: ?Sized, S: ?Sized, V>(
    memory: &VecDeque<Record<O, S, V>>,
    head_size: usize,
    tail_size: usize,
) -> Result<Window> {
    let count = memory.len();
    let requested = head_size + tail_size;
    let low = count.saturating_sub(requested);
    let to_start_state = memory[low].start_state.is_some();
    if requested > count && !to_start_state {
        return Err(RnnError::HistoryDiscarded {
            requested,
            retained: count,
        });
    }
    Ok(Window {
        low,
        low_head: count.saturating_sub(head_size),
        to_start_state,
    })
}

/// Truncated BPTT session for the plain forward pass.
pub struct SeqProp {
    pub block: Rc<dyn Block>,
    pub cost: Rc<dyn CostFunc>,
    memory: VecDeque<PropRecord>,
}

impl SeqProp {
    pub fn new(block: Rc<dyn Block>, cost: Rc<dyn CostFunc>) -> Self {
        Self {
            block,
            cost,
            memory: VecDeque::new(),
        }
    }

    /// Evaluates the block on the first timestep of every sequence and
    /// returns the sequences with that timestep removed; exhausted sequences
    /// are dropped.
    ///
    /// Only the first call may receive empty sequences. Afterwards the
    /// sequences must be exactly the ones returned by the previous call.
    pub fn time_step(&mut self, seqs: Vec<Sample>) -> Vec<Sample> {
        let seqs = if self.memory.is_empty() {
            remove_empty(seqs)
        } else {
            seqs
        };
        if seqs.is_empty() {
            return Vec::new();
        }

        let states = match self.memory.back() {
            Some(last) => filter_continued(&last.continues, last.output.states()),
            None => vec![self.block.start_state().output(); seqs.len()],
        };
        assert_eq!(states.len(), seqs.len(), "incorrect number of input sequences");

        let mut input = BlockInput::default();
        for (seq, state) in seqs.iter().zip(states) {
            input.push(Variable::new(seq.inputs[0].clone()), Variable::new(state));
        }
        let output = self.block.batch(&input);
        let start_state = self.memory.is_empty().then(|| self.block.start_state());
        self.memory.push_back(Record {
            start_state,
            output,
            in_states: input.states,
            targets: seqs.iter().map(|s| s.outputs[0].clone()).collect(),
            continues: seqs.iter().map(|s| s.len() > 1).collect(),
        });
        debug!(lanes = seqs.len(), memory = self.memory.len(), "session timestep");

        seqs.into_iter().filter_map(Sample::without_first).collect()
    }

    /// Timesteps currently held, i.e. the furthest back BPTT can reach.
    pub fn memory_count(&self) -> usize {
        self.memory.len()
    }

    /// Block outputs of the newest record, one per lane.
    pub fn last_outputs(&self) -> Option<&[Vector]> {
        self.memory.back().map(|r| r.output.outputs())
    }

    /// Keeps only the newest `n` records. Truncating to zero resets the
    /// session.
    pub fn truncate(&mut self, n: usize) {
        let remove = self.memory.len().saturating_sub(n);
        if remove == 0 {
            return;
        }
        self.memory.drain(..remove);
        debug!(removed = remove, memory = self.memory.len(), "session truncated");
    }

    /// Back-propagates output gradients from the newest `head_size` records
    /// and state gradients through `tail_size` further records.
    pub fn back_propagate(&self, g: &mut Gradient, head_size: usize, tail_size: usize) -> Result<()> {
        if head_size == 0 || self.memory.is_empty() {
            return Ok(());
        }
        let win = window(&self.memory, head_size, tail_size)?;
        let state_size = self.block.state_size();

        let mut upstream = UpstreamGradient::default();
        for i in (win.low..self.memory.len()).rev() {
            let mem = &self.memory[i];

            upstream.outputs = (i >= win.low_head).then(|| {
                mem.output
                    .outputs()
                    .iter()
                    .zip(&mem.targets)
                    .map(|(actual, target)| self.cost.deriv(target, actual))
                    .collect()
            });

            let wants_states = i > win.low || win.to_start_state;
            if wants_states {
                for state in &mem.in_states {
                    g.insert(state.id(), Vector::zeros(state_size));
                }
            }

            mem.output.gradient(&upstream, g);

            if wants_states {
                let grads: Vec<Vector> = mem
                    .in_states
                    .iter()
                    .map(|s| g.remove(s.id()).expect("state gradient entry must survive the block"))
                    .collect();
                upstream.states = Some(match i.checked_sub(1) {
                    Some(prev) => inject_discontinued(&self.memory[prev].continues, grads, state_size),
                    None => grads,
                });
            }
        }

        if win.to_start_state {
            if let (Some(start), Some(states)) = (&self.memory[0].start_state, &upstream.states) {
                for s in states {
                    start.propagate_gradient(s, g);
                }
            }
        }
        Ok(())
    }
}

/// Truncated BPTT session with R-operator support.
pub struct SeqRProp {
    pub block: Rc<dyn Block>,
    pub cost: Rc<dyn CostFunc>,
    memory: VecDeque<RPropRecord>,
}

impl SeqRProp {
    pub fn new(block: Rc<dyn Block>, cost: Rc<dyn CostFunc>) -> Self {
        Self {
            block,
            cost,
            memory: VecDeque::new(),
        }
    }

    pub fn time_step(&mut self, rv: &RVector, seqs: Vec<Sample>) -> Vec<Sample> {
        let seqs = if self.memory.is_empty() {
            remove_empty(seqs)
        } else {
            seqs
        };
        if seqs.is_empty() {
            return Vec::new();
        }

        let (states, r_states) = match self.memory.back() {
            Some(last) => (
                filter_continued(&last.continues, last.output.states()),
                filter_continued(&last.continues, last.output.r_states()),
            ),
            None => {
                let start = self.block.start_state_r(rv);
                (vec![start.output(); seqs.len()], vec![start.r_output(); seqs.len()])
            }
        };
        assert_eq!(states.len(), seqs.len(), "incorrect number of input sequences");

        let mut input = BlockRInput::default();
        for ((seq, state), r_state) in seqs.iter().zip(states).zip(r_states) {
            let in_len = seq.inputs[0].len();
            input.push(
                RVariable::with_r_output(Variable::new(seq.inputs[0].clone()), Vector::zeros(in_len)),
                RVariable::with_r_output(Variable::new(state), r_state),
            );
        }
        let output = self.block.batch_r(rv, &input);
        let start_state = self.memory.is_empty().then(|| self.block.start_state_r(rv));
        self.memory.push_back(Record {
            start_state,
            output,
            in_states: input.states,
            targets: seqs.iter().map(|s| s.outputs[0].clone()).collect(),
            continues: seqs.iter().map(|s| s.len() > 1).collect(),
        });
        debug!(lanes = seqs.len(), memory = self.memory.len(), "R session timestep");

        seqs.into_iter().filter_map(Sample::without_first).collect()
    }

    pub fn memory_count(&self) -> usize {
        self.memory.len()
    }

    pub fn last_outputs(&self) -> Option<&[Vector]> {
        self.memory.back().map(|r| r.output.outputs())
    }

    pub fn truncate(&mut self, n: usize) {
        let remove = self.memory.len().saturating_sub(n);
        if remove == 0 {
            return;
        }
        self.memory.drain(..remove);
        debug!(removed = remove, memory = self.memory.len(), "R session truncated");
    }

    pub fn back_propagate(
        &self,
        g: &mut Gradient,
        rg: &mut RGradient,
        head_size: usize,
        tail_size: usize,
    ) -> Result<()> {
        if head_size == 0 || self.memory.is_empty() {
            return Ok(());
        }
        let win = window(&self.memory, head_size, tail_size)?;
        let state_size = self.block.state_size();

        let mut upstream = UpstreamRGradient::default();
        for i in (win.low..self.memory.len()).rev() {
            let mem = &self.memory[i];

            if i >= win.low_head {
                let (d, rd): (Vec<Vector>, Vec<Vector>) = mem
                    .output
                    .outputs()
                    .iter()
                    .zip(mem.output.r_outputs())
                    .zip(&mem.targets)
                    .map(|((actual, r_actual), target)| self.cost.r_deriv(target, actual, r_actual))
                    .unzip();
                upstream.outputs = Some(d);
                upstream.r_outputs = Some(rd);
            } else {
                upstream.outputs = None;
                upstream.r_outputs = None;
            }

            let wants_states = i > win.low || win.to_start_state;
            if wants_states {
                for state in &mem.in_states {
                    g.insert(state.variable.id(), Vector::zeros(state_size));
                    rg.insert(state.variable.id(), Vector::zeros(state_size));
                }
            }

            mem.output.r_gradient(&upstream, rg, g);

            if wants_states {
                let mut grads = Vec::with_capacity(mem.in_states.len());
                let mut r_grads = Vec::with_capacity(mem.in_states.len());
                for state in &mem.in_states {
                    let id = state.variable.id();
                    grads.push(g.remove(id).expect("state gradient entry must survive the block"));
                    r_grads.push(rg.remove(id).expect("state R-gradient entry must survive the block"));
                }
                match i.checked_sub(1) {
                    Some(prev) => {
                        let continues = &self.memory[prev].continues;
                        upstream.states = Some(inject_discontinued(continues, grads, state_size));
                        upstream.r_states = Some(inject_discontinued(continues, r_grads, state_size));
                    }
                    None => {
                        upstream.states = Some(grads);
                        upstream.r_states = Some(r_grads);
                    }
                }
            }
        }

        if win.to_start_state {
            if let (Some(start), Some(states), Some(r_states)) =
                (&self.memory[0].start_state, &upstream.states, &upstream.r_states)
            {
                for (s, s_r) in states.iter().zip(r_states) {
                    start.propagate_r_gradient(s, s_r, rg, g);
                }
            }
        }
        Ok(())
    }
}

fn remove_empty(seqs: Vec<Sample>) -> Vec<Sample> {
    seqs.into_iter().filter(|s| !s.is_empty()).collect()
}

/// Keeps the entries of lanes that go on to another timestep.
fn filter_continued(continues: &[bool], values: &[Vector]) -> Vec<Vector> {
    continues
        .iter()
        .zip(values)
        .filter(|(c, _)| **c)
        .map(|(_, v)| v.clone())
        .collect()
}

/// Inverse of [`filter_continued`]: spreads `values` over the lanes that
/// continued and fills the others with zeros, keeping lanes aligned.
fn inject_discontinued(continues: &[bool], values: Vec<Vector>, len: usize) -> Vec<Vector> {
    let mut values = values.into_iter();
    let res: Vec<Vector> = continues
        .iter()
        .map(|&c| {
            if c {
                values.next().expect("one gradient per continuing lane")
            } else {
                Vector::zeros(len)
            }
        })
        .collect();
    assert!(values.next().is_none(), "more state gradients than continuing lanes");
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_inject_discontinued_pads_finished_lanes() {
        let res = inject_discontinued(&[true, false, true], vec![array![1.0], array![2.0]], 1);
        assert_eq!(res, vec![array![1.0], array![0.0], array![2.0]]);
    }

    #[test]
    fn test_filter_continued() {
        let res = filter_continued(&[false, true], &[array![1.0], array![2.0]]);
        assert_eq!(res, vec![array![2.0]]);
    }

    #[test]
    fn test_sample_without_first() {
        let s = Sample::new(vec![array![1.0], array![2.0]], vec![array![0.0], array![1.0]]);
        let rest = s.without_first().unwrap();
        assert_eq!(rest.inputs, vec![array![2.0]]);
        assert!(rest.without_first().is_none());
    }
}
