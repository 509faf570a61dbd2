use std::rc::Rc;

use ndarray::{Array2, Axis, s};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::autofunc::{Gradient, RGradient, RValue, RVariable, RVector, Value, VarId, Variable, Vector};
use crate::block::{
    Block, BlockInput, BlockOutput, BlockRInput, BlockROutput, UpstreamGradient,
    UpstreamRGradient,
};
use crate::errors::{Result, RnnError};
use crate::model_config::BlockConfig;
use crate::serializer;

/// A single tanh layer used as a recurrent block.
///
/// Each lane's input and state are packed as `[input; state]`, multiplied by
/// the weight matrix, offset by the biases and squashed with tanh. The result
/// is unpacked as `[output; state]`.
#[derive(Debug)]
pub struct DenseBlock {
    input_size: usize,
    output_size: usize,
    state_size: usize,

    /// Row-major `(output_size + state_size) x (input_size + state_size)`.
    weights: Rc<Variable>,
    biases: Rc<Variable>,
    start_state: Option<Rc<Variable>>,
}

#[derive(Serialize, Deserialize)]
struct DenseBlockData {
    input_size: usize,
    output_size: usize,
    state_size: usize,
    weights: Vec<f64>,
    biases: Vec<f64>,
    start_state: Option<Vec<f64>>,
}

impl DenseBlock {
    pub fn new(input_size: usize, state_size: usize, output_size: usize) -> Self {
        Self::from_rng(&mut rand::rng(), input_size, state_size, output_size)
    }

    /// Initializes weights with std = sqrt(1 / fan_in) and zero biases.
    pub fn from_rng<R: Rng + ?Sized>(
        rng: &mut R,
        input_size: usize,
        state_size: usize,
        output_size: usize,
    ) -> Self {
        let rows = output_size + state_size;
        let cols = input_size + state_size;
        let std = (1.0 / cols.max(1) as f64).sqrt();
        let normal = Normal::new(0.0, std).unwrap();

        DenseBlock {
            input_size,
            output_size,
            state_size,
            weights: Variable::new(Vector::from_shape_fn(rows * cols, |_| normal.sample(&mut *rng))),
            biases: Variable::zeros(rows),
            start_state: None,
        }
    }

    pub fn from_config(config: &BlockConfig) -> Self {
        let block = Self::new(config.input_size, config.state_size, config.output_size);
        if config.trainable_start_state {
            block.with_trainable_start_state()
        } else {
            block
        }
    }

    /// Makes the start state a learnable parameter, initialized to zero.
    pub fn with_trainable_start_state(mut self) -> Self {
        self.start_state = Some(Variable::zeros(self.state_size));
        self
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn weights(&self) -> &Rc<Variable> {
        &self.weights
    }

    pub fn biases(&self) -> &Rc<Variable> {
        &self.biases
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let data: DenseBlockData = serializer::decode(data)?;
        let rows = data.output_size + data.state_size;
        let cols = data.input_size + data.state_size;
        if data.weights.len() != rows * cols || data.biases.len() != rows {
            return Err(RnnError::Deserialization {
                message: format!(
                    "DenseBlock expected {} weights and {} biases, got {} and {}",
                    rows * cols,
                    rows,
                    data.weights.len(),
                    data.biases.len()
                ),
            });
        }
        let start_state = match data.start_state {
            Some(s) if s.len() != data.state_size => {
                return Err(RnnError::Deserialization {
                    message: format!(
                        "DenseBlock start state has length {}, expected {}",
                        s.len(),
                        data.state_size
                    ),
                });
            }
            Some(s) => Some(Variable::new(Vector::from(s))),
            None => None,
        };
        Ok(DenseBlock {
            input_size: data.input_size,
            output_size: data.output_size,
            state_size: data.state_size,
            weights: Variable::new(Vector::from(data.weights)),
            biases: Variable::new(Vector::from(data.biases)),
            start_state,
        })
    }

    fn rows(&self) -> usize {
        self.output_size + self.state_size
    }

    fn cols(&self) -> usize {
        self.input_size + self.state_size
    }

    fn as_matrix(&self, flat: &Vector) -> Array2<f64> {
        Array2::from_shape_vec((self.rows(), self.cols()), flat.to_vec())
            .expect("weight vector must match the block's shape")
    }

    fn pack_lanes(&self, inputs: &[Vector], states: &[Vector]) -> Array2<f64> {
        let mut packed = Array2::zeros((inputs.len(), self.cols()));
        for (lane, (input, state)) in inputs.iter().zip(states).enumerate() {
            assert_eq!(input.len(), self.input_size, "input has the wrong length");
            assert_eq!(state.len(), self.state_size, "state has the wrong length");
            let mut row = packed.row_mut(lane);
            row.slice_mut(s![..self.input_size]).assign(input);
            row.slice_mut(s![self.input_size..]).assign(state);
        }
        packed
    }

    fn shapes(&self) -> Shapes {
        Shapes {
            input_size: self.input_size,
            output_size: self.output_size,
            state_size: self.state_size,
        }
    }
}

impl Block for DenseBlock {
    fn block_type(&self) -> &str {
        "DenseBlock"
    }

    fn state_size(&self) -> usize {
        self.state_size
    }

    fn start_state(&self) -> Rc<dyn Value> {
        match &self.start_state {
            Some(var) => var.clone(),
            None => Variable::zeros(self.state_size),
        }
    }

    fn start_state_r(&self, rv: &RVector) -> Rc<dyn RValue> {
        match &self.start_state {
            Some(var) => Rc::new(RVariable::new(var.clone(), rv)),
            None => Rc::new(RVariable::with_r_output(
                Variable::zeros(self.state_size),
                Vector::zeros(self.state_size),
            )),
        }
    }

    fn batch(&self, input: &BlockInput) -> Box<dyn BlockOutput> {
        let inputs: Vec<Vector> = input.inputs.iter().map(|v| v.output()).collect();
        let states: Vec<Vector> = input.states.iter().map(|v| v.output()).collect();
        let u = self.pack_lanes(&inputs, &states);
        let w = self.as_matrix(&self.weights.vector());
        let h = (u.dot(&w.t()) + &*self.biases.vector()).mapv(f64::tanh);

        let shapes = self.shapes();
        let (outputs, new_states) = shapes.unpack(&h);
        Box::new(DenseBlockOutput {
            shapes,
            weights_id: self.weights.id(),
            biases_id: self.biases.id(),
            input_ids: input.inputs.iter().map(|v| v.id()).collect(),
            state_ids: input.states.iter().map(|v| v.id()).collect(),
            w,
            u,
            h,
            outputs,
            states: new_states,
        })
    }

    fn batch_r(&self, rv: &RVector, input: &BlockRInput) -> Box<dyn BlockROutput> {
        let inputs: Vec<Vector> = input.inputs.iter().map(|v| v.output()).collect();
        let states: Vec<Vector> = input.states.iter().map(|v| v.output()).collect();
        let r_inputs: Vec<Vector> = input.inputs.iter().map(|v| v.r_output()).collect();
        let r_states: Vec<Vector> = input.states.iter().map(|v| v.r_output()).collect();

        let u = self.pack_lanes(&inputs, &states);
        let ru = self.pack_lanes(&r_inputs, &r_states);
        let w = self.as_matrix(&self.weights.vector());
        let rw = self.as_matrix(&rv.direction_for(&self.weights));
        let rb = rv.direction_for(&self.biases);

        let h = (u.dot(&w.t()) + &*self.biases.vector()).mapv(f64::tanh);
        let rz = ru.dot(&w.t()) + u.dot(&rw.t()) + &rb;
        let rh = h.mapv(|x| 1.0 - x * x) * &rz;

        let shapes = self.shapes();
        let (outputs, new_states) = shapes.unpack(&h);
        let (r_outputs, new_r_states) = shapes.unpack(&rh);
        Box::new(DenseBlockROutput {
            shapes,
            weights_id: self.weights.id(),
            biases_id: self.biases.id(),
            input_ids: input.inputs.iter().map(|v| v.variable.id()).collect(),
            state_ids: input.states.iter().map(|v| v.variable.id()).collect(),
            w,
            rw,
            u,
            ru,
            h,
            rh,
            outputs,
            states: new_states,
            r_outputs,
            r_states: new_r_states,
        })
    }

    fn parameters(&self) -> Result<Vec<Rc<Variable>>> {
        let mut params = vec![self.weights.clone(), self.biases.clone()];
        if let Some(start) = &self.start_state {
            params.push(start.clone());
        }
        Ok(params)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let data = DenseBlockData {
            input_size: self.input_size,
            output_size: self.output_size,
            state_size: self.state_size,
            weights: self.weights.vector().to_vec(),
            biases: self.biases.vector().to_vec(),
            start_state: self.start_state.as_ref().map(|s| s.vector().to_vec()),
        };
        serializer::serialize_with_type(serializer::DENSE_BLOCK, serializer::encode(&data)?)
    }
}

#[derive(Debug, Clone, Copy)]
struct Shapes {
    input_size: usize,
    output_size: usize,
    state_size: usize,
}

impl Shapes {
    /// Splits each row of a `[output; state]` matrix.
    fn unpack(&self, packed: &Array2<f64>) -> (Vec<Vector>, Vec<Vector>) {
        packed
            .rows()
            .into_iter()
            .map(|row| {
                (
                    row.slice(s![..self.output_size]).to_owned(),
                    row.slice(s![self.output_size..]).to_owned(),
                )
            })
            .unzip()
    }

    fn join_upstream(
        &self,
        lanes: usize,
        states: Option<&Vec<Vector>>,
        outputs: Option<&Vec<Vector>>,
    ) -> Array2<f64> {
        let mut joined = Array2::zeros((lanes, self.output_size + self.state_size));
        if let Some(outputs) = outputs {
            assert_eq!(outputs.len(), lanes, "output upstream has the wrong lane count");
            for (lane, out) in outputs.iter().enumerate() {
                assert_eq!(
                    out.len(),
                    self.output_size,
                    "output upstream should have len {} but has len {}",
                    self.output_size,
                    out.len()
                );
                joined
                    .row_mut(lane)
                    .slice_mut(s![..self.output_size])
                    .assign(out);
            }
        }
        if let Some(states) = states {
            assert_eq!(states.len(), lanes, "state upstream has the wrong lane count");
            for (lane, state) in states.iter().enumerate() {
                assert_eq!(
                    state.len(),
                    self.state_size,
                    "state upstream should have len {} but has len {}",
                    self.state_size,
                    state.len()
                );
                joined
                    .row_mut(lane)
                    .slice_mut(s![self.output_size..])
                    .assign(state);
            }
        }
        joined
    }

    /// Sends the packed input gradient `du` to each lane's input and state.
    fn scatter(&self, du: &Array2<f64>, input_ids: &[VarId], state_ids: &[VarId], g: &mut Gradient) {
        for (lane, row) in du.rows().into_iter().enumerate() {
            if g.contains(input_ids[lane]) {
                g.accumulate(input_ids[lane], &row.slice(s![..self.input_size]).to_owned());
            }
            if g.contains(state_ids[lane]) {
                g.accumulate(state_ids[lane], &row.slice(s![self.input_size..]).to_owned());
            }
        }
    }
}

fn flatten(m: Array2<f64>) -> Vector {
    m.iter().copied().collect()
}

struct DenseBlockOutput {
    shapes: Shapes,
    weights_id: VarId,
    biases_id: VarId,
    input_ids: Vec<VarId>,
    state_ids: Vec<VarId>,
    w: Array2<f64>,
    u: Array2<f64>,
    h: Array2<f64>,
    outputs: Vec<Vector>,
    states: Vec<Vector>,
}

impl BlockOutput for DenseBlockOutput {
    fn states(&self) -> &[Vector] {
        &self.states
    }

    fn outputs(&self) -> &[Vector] {
        &self.outputs
    }

    fn gradient(&self, upstream: &UpstreamGradient, g: &mut Gradient) {
        let lanes = self.outputs.len();
        let dh = self
            .shapes
            .join_upstream(lanes, upstream.states.as_ref(), upstream.outputs.as_ref());
        let dz = dh * self.h.mapv(|x| 1.0 - x * x);

        if g.contains(self.weights_id) {
            g.accumulate(self.weights_id, &flatten(dz.t().dot(&self.u)));
        }
        if g.contains(self.biases_id) {
            g.accumulate(self.biases_id, &dz.sum_axis(Axis(0)));
        }

        let du = dz.dot(&self.w);
        self.shapes.scatter(&du, &self.input_ids, &self.state_ids, g);
    }
}

struct DenseBlockROutput {
    shapes: Shapes,
    weights_id: VarId,
    biases_id: VarId,
    input_ids: Vec<VarId>,
    state_ids: Vec<VarId>,
    w: Array2<f64>,
    rw: Array2<f64>,
    u: Array2<f64>,
    ru: Array2<f64>,
    h: Array2<f64>,
    rh: Array2<f64>,
    outputs: Vec<Vector>,
    states: Vec<Vector>,
    r_outputs: Vec<Vector>,
    r_states: Vec<Vector>,
}

impl BlockROutput for DenseBlockROutput {
    fn states(&self) -> &[Vector] {
        &self.states
    }

    fn outputs(&self) -> &[Vector] {
        &self.outputs
    }

    fn r_states(&self) -> &[Vector] {
        &self.r_states
    }

    fn r_outputs(&self) -> &[Vector] {
        &self.r_outputs
    }

    fn r_gradient(&self, upstream: &UpstreamRGradient, rg: &mut RGradient, g: &mut Gradient) {
        upstream.check_pairing();
        let lanes = self.outputs.len();
        let dh = self
            .shapes
            .join_upstream(lanes, upstream.states.as_ref(), upstream.outputs.as_ref());
        let rdh = self
            .shapes
            .join_upstream(lanes, upstream.r_states.as_ref(), upstream.r_outputs.as_ref());

        // d tanh(z) = 1 - h^2, and R(1 - h^2) = -2 h R(h).
        let dtanh = self.h.mapv(|x| 1.0 - x * x);
        let dz = &dh * &dtanh;
        let rdz = &rdh * &dtanh - &(&self.h * &self.rh * &dh * 2.0);

        if g.contains(self.weights_id) {
            g.accumulate(self.weights_id, &flatten(dz.t().dot(&self.u)));
        }
        if rg.contains(self.weights_id) {
            let rdw = rdz.t().dot(&self.u) + dz.t().dot(&self.ru);
            rg.accumulate(self.weights_id, &flatten(rdw));
        }
        if g.contains(self.biases_id) {
            g.accumulate(self.biases_id, &dz.sum_axis(Axis(0)));
        }
        if rg.contains(self.biases_id) {
            rg.accumulate(self.biases_id, &rdz.sum_axis(Axis(0)));
        }

        let du = dz.dot(&self.w);
        let rdu = rdz.dot(&self.w) + dz.dot(&self.rw);
        self.shapes.scatter(&du, &self.input_ids, &self.state_ids, g);
        self.shapes.scatter(&rdu, &self.input_ids, &self.state_ids, rg);
    }
}
