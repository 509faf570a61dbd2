use std::rc::Rc;

use crate::autofunc::{Gradient, RGradient, RValue, RVector, Value, Variable, Vector};
use crate::errors::{Result, RnnError};

/// A differentiable function from a batch of sequences to a batch of
/// sequences of the same lengths.
pub trait SeqFunc {
    fn seq_func_type(&self) -> &str;

    fn batch_seqs(&self, seqs: &[Vec<Rc<dyn Value>>]) -> Box<dyn ResultSeqs>;

    fn batch_seqs_r(&self, rv: &RVector, seqs: &[Vec<Rc<dyn RValue>>]) -> Box<dyn RResultSeqs>;

    fn parameters(&self) -> Result<Vec<Rc<Variable>>> {
        Err(RnnError::unsupported(self.seq_func_type(), "parameters"))
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Err(RnnError::unsupported(self.seq_func_type(), "serialization"))
    }
}

/// Output of [`SeqFunc::batch_seqs`].
pub trait ResultSeqs {
    fn output_seqs(&self) -> &[Vec<Vector>];

    /// `upstream` must have exactly the shape of [`ResultSeqs::output_seqs`].
    fn gradient(&self, upstream: &[Vec<Vector>], g: &mut Gradient);
}

/// Output of [`SeqFunc::batch_seqs_r`].
pub trait RResultSeqs {
    fn output_seqs(&self) -> &[Vec<Vector>];

    fn r_output_seqs(&self) -> &[Vec<Vector>];

    /// Pass an empty `g` when only the R-gradient is wanted; it is still used
    /// for intermediate entries and left as it was found.
    fn r_gradient(
        &self,
        upstream: &[Vec<Vector>],
        upstream_r: &[Vec<Vector>],
        rg: &mut RGradient,
        g: &mut Gradient,
    );
}

/// Wraps raw vectors as constant values, the usual way to feed data in.
pub fn constant_seqs(seqs: &[Vec<Vector>]) -> Vec<Vec<Rc<dyn Value>>> {
    seqs.iter()
        .map(|seq| {
            seq.iter()
                .map(|v| Variable::new(v.clone()) as Rc<dyn Value>)
                .collect()
        })
        .collect()
}

/// Like [`constant_seqs`] with zero R derivatives.
pub fn constant_r_seqs(seqs: &[Vec<Vector>]) -> Vec<Vec<Rc<dyn RValue>>> {
    seqs.iter()
        .map(|seq| {
            seq.iter()
                .map(|v| {
                    Rc::new(crate::autofunc::RVariable::with_r_output(
                        Variable::new(v.clone()),
                        Vector::zeros(v.len()),
                    )) as Rc<dyn RValue>
                })
                .collect()
        })
        .collect()
}

pub(crate) fn check_upstream_shape(packed: &[Vec<Vector>], upstream: &[Vec<Vector>]) {
    assert_eq!(
        packed.len(),
        upstream.len(),
        "incorrect upstream dimensions: {} lanes, expected {}",
        upstream.len(),
        packed.len()
    );
    for (lane, (out, up)) in packed.iter().zip(upstream).enumerate() {
        assert_eq!(
            out.len(),
            up.len(),
            "incorrect upstream dimensions: lane {} has {} timesteps, expected {}",
            lane,
            up.len(),
            out.len()
        );
    }
}
