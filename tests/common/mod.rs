#![allow(dead_code)]

use std::rc::Rc;

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rnnprop::{
    Block, BlockInput, BlockOutput, BlockRInput, BlockROutput, DenseBlock, Gradient, RGradient,
    RValue, RVariable, RVector, UpstreamGradient, UpstreamRGradient, Value, Variable, Vector,
};

pub const EPSILON: f64 = 1e-5;

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn dense_block(seed: u64, input: usize, state: usize, output: usize) -> Rc<DenseBlock> {
    Rc::new(DenseBlock::from_rng(&mut rng(seed), input, state, output).with_trainable_start_state())
}

pub fn random_vector<R: Rng>(rng: &mut R, len: usize) -> Vector {
    Array1::from_shape_fn(len, |_| rng.random_range(-1.0..1.0))
}

/// One random sequence of `size`-long vectors per entry of `lens`.
pub fn random_seqs<R: Rng>(rng: &mut R, lens: &[usize], size: usize) -> Vec<Vec<Vector>> {
    lens.iter()
        .map(|&n| (0..n).map(|_| random_vector(rng, size)).collect())
        .collect()
}

/// Gives every parameter a random starting value, including start states
/// that are initialized to zero.
pub fn randomize(params: &[Rc<Variable>], seed: u64) {
    let mut rng = rng(seed);
    for p in params {
        let len = p.len();
        *p.vector_mut() = random_vector(&mut rng, len);
    }
}

pub fn random_direction(params: &[Rc<Variable>], seed: u64) -> RVector {
    let mut rng = rng(seed);
    let mut rv = RVector::new();
    for p in params {
        rv.insert(p.id(), random_vector(&mut rng, p.len()));
    }
    rv
}

/// Central finite differences of `f` with respect to every entry of `params`.
pub fn numeric_gradient(params: &[Rc<Variable>], f: impl Fn() -> f64) -> Vec<Vector> {
    params
        .iter()
        .map(|p| {
            let mut grad = Vector::zeros(p.len());
            for i in 0..p.len() {
                let orig = p.vector()[i];
                p.vector_mut()[i] = orig + EPSILON;
                let plus = f();
                p.vector_mut()[i] = orig - EPSILON;
                let minus = f();
                p.vector_mut()[i] = orig;
                grad[i] = (plus - minus) / (2.0 * EPSILON);
            }
            grad
        })
        .collect()
}

/// Central difference of `f` along `rv`, element by element.
pub fn directional<T>(params: &[Rc<Variable>], rv: &RVector, f: impl Fn() -> T) -> (T, T) {
    let shift = |scale: f64| {
        for p in params {
            if let Some(d) = rv.get(p.id()) {
                let step = d * scale;
                *p.vector_mut() += &step;
            }
        }
    };
    shift(EPSILON);
    let plus = f();
    shift(-2.0 * EPSILON);
    let minus = f();
    shift(EPSILON);
    (plus, minus)
}

pub fn diff_quotient(plus: &[Vector], minus: &[Vector]) -> Vec<Vector> {
    plus.iter()
        .zip(minus)
        .map(|(p, m)| (p - m) / (2.0 * EPSILON))
        .collect()
}

pub fn gradient_vectors(params: &[Rc<Variable>], g: &Gradient) -> Vec<Vector> {
    params
        .iter()
        .map(|p| g.get(p.id()).cloned().expect("parameter missing from gradient"))
        .collect()
}

pub fn assert_vectors_close(actual: &[Vector], expected: &[Vector], tol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert_eq!(a.len(), e.len());
        for (x, y) in a.iter().zip(e.iter()) {
            approx::assert_abs_diff_eq!(*x, *y, epsilon = tol);
        }
    }
}

/// A stateless block whose output is its input.
pub struct IdentityBlock;

struct IdentityOutput {
    inputs: Vec<Rc<Variable>>,
    outputs: Vec<Vector>,
    states: Vec<Vector>,
}

struct IdentityROutput {
    inputs: Vec<Rc<Variable>>,
    outputs: Vec<Vector>,
    r_outputs: Vec<Vector>,
    states: Vec<Vector>,
}

impl Block for IdentityBlock {
    fn block_type(&self) -> &str {
        "IdentityBlock"
    }

    fn state_size(&self) -> usize {
        0
    }

    fn start_state(&self) -> Rc<dyn Value> {
        Variable::zeros(0)
    }

    fn start_state_r(&self, _rv: &RVector) -> Rc<dyn RValue> {
        Rc::new(RVariable::with_r_output(Variable::zeros(0), Vector::zeros(0)))
    }

    fn batch(&self, input: &BlockInput) -> Box<dyn BlockOutput> {
        Box::new(IdentityOutput {
            inputs: input.inputs.clone(),
            outputs: input.inputs.iter().map(|v| v.output()).collect(),
            states: vec![Vector::zeros(0); input.lanes()],
        })
    }

    fn batch_r(&self, _rv: &RVector, input: &BlockRInput) -> Box<dyn BlockROutput> {
        Box::new(IdentityROutput {
            inputs: input.inputs.iter().map(|v| v.variable.clone()).collect(),
            outputs: input.inputs.iter().map(|v| v.output()).collect(),
            r_outputs: input.inputs.iter().map(|v| v.r_output()).collect(),
            states: vec![Vector::zeros(0); input.lanes()],
        })
    }
}

impl BlockOutput for IdentityOutput {
    fn states(&self) -> &[Vector] {
        &self.states
    }

    fn outputs(&self) -> &[Vector] {
        &self.outputs
    }

    fn gradient(&self, upstream: &UpstreamGradient, g: &mut Gradient) {
        if let Some(outputs) = &upstream.outputs {
            for (var, up) in self.inputs.iter().zip(outputs) {
                g.accumulate(var.id(), up);
            }
        }
    }
}

impl BlockROutput for IdentityROutput {
    fn states(&self) -> &[Vector] {
        &self.states
    }

    fn outputs(&self) -> &[Vector] {
        &self.outputs
    }

    fn r_states(&self) -> &[Vector] {
        &self.states
    }

    fn r_outputs(&self) -> &[Vector] {
        &self.r_outputs
    }

    fn r_gradient(&self, upstream: &UpstreamRGradient, rg: &mut RGradient, g: &mut Gradient) {
        if let (Some(outputs), Some(r_outputs)) = (&upstream.outputs, &upstream.r_outputs) {
            for ((var, up), up_r) in self.inputs.iter().zip(outputs).zip(r_outputs) {
                g.accumulate(var.id(), up);
                rg.accumulate(var.id(), up_r);
            }
        }
    }
}
