use std::rc::Rc;

use ndarray::{concatenate, s, Axis};

use crate::autofunc::{Gradient, RGradient, RValue, RVariable, RVector, Value, Variable, Vector};
use crate::errors::{Result, RnnError};
use crate::seq_func::{RResultSeqs, ResultSeqs, SeqFunc};
use crate::serializer;

/// A bidirectional RNN built from three sequence functions.
///
/// `forward` sees each sequence as given and `backward` sees it reversed.
/// For a sequence of length N, `output` receives N joined timesteps, each the
/// forward output followed by the backward output aligned to the same time.
pub struct Bidirectional {
    pub forward: Box<dyn SeqFunc>,
    pub backward: Box<dyn SeqFunc>,
    pub output: Box<dyn SeqFunc>,
}

impl Bidirectional {
    pub fn new(
        forward: Box<dyn SeqFunc>,
        backward: Box<dyn SeqFunc>,
        output: Box<dyn SeqFunc>,
    ) -> Self {
        Self {
            forward,
            backward,
            output,
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let components = serializer::deserialize_slice(data)?;
        if components.len() != 3 {
            return Err(RnnError::ComponentCount {
                expected: 3,
                got: components.len(),
            });
        }
        let mut funcs = components
            .into_iter()
            .map(|c| c.into_seq_func())
            .collect::<Result<Vec<_>>>()?
            .into_iter();
        match (funcs.next(), funcs.next(), funcs.next()) {
            (Some(forward), Some(backward), Some(output)) => {
                Ok(Self::new(forward, backward, output))
            }
            _ => unreachable!("length checked above"),
        }
    }

    fn members(&self) -> [&dyn SeqFunc; 3] {
        [&*self.forward, &*self.backward, &*self.output]
    }
}

impl SeqFunc for Bidirectional {
    fn seq_func_type(&self) -> &str {
        "Bidirectional"
    }

    fn batch_seqs(&self, seqs: &[Vec<Rc<dyn Value>>]) -> Box<dyn ResultSeqs> {
        let forward_out = self.forward.batch_seqs(seqs);
        let backward_out = self.backward.batch_seqs(&reverse_seqs(seqs));

        let mut joined = Vec::with_capacity(seqs.len());
        let mut joined_values = Vec::with_capacity(seqs.len());
        for (forw_seq, back_seq) in forward_out
            .output_seqs()
            .iter()
            .zip(backward_out.output_seqs())
        {
            let vars: Vec<Rc<Variable>> = forw_seq
                .iter()
                .zip(back_seq.iter().rev())
                .map(|(f, b)| Variable::new(join(f, b)))
                .collect();
            joined_values.push(
                vars.iter()
                    .map(|v| v.clone() as Rc<dyn Value>)
                    .collect::<Vec<_>>(),
            );
            joined.push(vars);
        }

        let out = self.output.batch_seqs(&joined_values);
        Box::new(BidirectionalOutput {
            forward_out,
            backward_out,
            joined,
            out,
        })
    }

    fn batch_seqs_r(&self, rv: &RVector, seqs: &[Vec<Rc<dyn RValue>>]) -> Box<dyn RResultSeqs> {
        let forward_out = self.forward.batch_seqs_r(rv, seqs);
        let backward_out = self.backward.batch_seqs_r(rv, &reverse_seqs(seqs));

        let mut joined = Vec::with_capacity(seqs.len());
        let mut joined_values = Vec::with_capacity(seqs.len());
        let lanes = forward_out
            .output_seqs()
            .iter()
            .zip(forward_out.r_output_seqs())
            .zip(backward_out.output_seqs().iter().zip(backward_out.r_output_seqs()));
        for ((forw_seq, forw_r), (back_seq, back_r)) in lanes {
            let mut vars = Vec::with_capacity(forw_seq.len());
            let mut values = Vec::with_capacity(forw_seq.len());
            let back = back_seq.iter().rev().zip(back_r.iter().rev());
            for ((f, f_r), (b, b_r)) in forw_seq.iter().zip(forw_r).zip(back) {
                let var = Variable::new(join(f, b));
                values.push(
                    Rc::new(RVariable::with_r_output(var.clone(), join(f_r, b_r)))
                        as Rc<dyn RValue>,
                );
                vars.push(var);
            }
            joined.push(vars);
            joined_values.push(values);
        }

        let out = self.output.batch_seqs_r(rv, &joined_values);
        Box::new(BidirectionalROutput {
            forward_out,
            backward_out,
            joined,
            out,
        })
    }

    /// Parameters of all three members; fails if any member cannot report them.
    fn parameters(&self) -> Result<Vec<Rc<Variable>>> {
        let mut params = Vec::new();
        for member in self.members() {
            params.extend(member.parameters()?);
        }
        Ok(params)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let items = self
            .members()
            .iter()
            .map(|m| m.serialize())
            .collect::<Result<Vec<_>>>()?;
        serializer::serialize_with_type(serializer::BIDIRECTIONAL, serializer::serialize_slice(items)?)
    }
}

struct BidirectionalOutput {
    forward_out: Box<dyn ResultSeqs>,
    backward_out: Box<dyn ResultSeqs>,
    joined: Vec<Vec<Rc<Variable>>>,
    out: Box<dyn ResultSeqs>,
}

impl ResultSeqs for BidirectionalOutput {
    fn output_seqs(&self) -> &[Vec<Vector>] {
        self.out.output_seqs()
    }

    fn gradient(&self, upstream: &[Vec<Vector>], g: &mut Gradient) {
        for var in self.joined.iter().flatten() {
            g.insert(var.id(), Vector::zeros(var.len()));
        }

        self.out.gradient(upstream, g);

        let forw_len = seq_output_size(self.forward_out.output_seqs());
        let mut forw_upstream = Vec::with_capacity(self.joined.len());
        let mut back_upstream = Vec::with_capacity(self.joined.len());
        for joined_seq in &self.joined {
            let (forw, back) = split_joined(joined_seq, forw_len, g);
            forw_upstream.push(forw);
            back_upstream.push(back);
        }

        self.forward_out.gradient(&forw_upstream, g);
        self.backward_out.gradient(&back_upstream, g);
    }
}

struct BidirectionalROutput {
    forward_out: Box<dyn RResultSeqs>,
    backward_out: Box<dyn RResultSeqs>,
    joined: Vec<Vec<Rc<Variable>>>,
    out: Box<dyn RResultSeqs>,
}

impl RResultSeqs for BidirectionalROutput {
    fn output_seqs(&self) -> &[Vec<Vector>] {
        self.out.output_seqs()
    }

    fn r_output_seqs(&self) -> &[Vec<Vector>] {
        self.out.r_output_seqs()
    }

    fn r_gradient(
        &self,
        upstream: &[Vec<Vector>],
        upstream_r: &[Vec<Vector>],
        rg: &mut RGradient,
        g: &mut Gradient,
    ) {
        for var in self.joined.iter().flatten() {
            g.insert(var.id(), Vector::zeros(var.len()));
            rg.insert(var.id(), Vector::zeros(var.len()));
        }

        self.out.r_gradient(upstream, upstream_r, rg, g);

        let forw_len = seq_output_size(self.forward_out.output_seqs());
        let lanes = self.joined.len();
        let (mut forw_up, mut back_up) = (Vec::with_capacity(lanes), Vec::with_capacity(lanes));
        let (mut forw_up_r, mut back_up_r) = (Vec::with_capacity(lanes), Vec::with_capacity(lanes));
        for joined_seq in &self.joined {
            let (forw, back) = split_joined(joined_seq, forw_len, g);
            let (forw_r, back_r) = split_joined(joined_seq, forw_len, rg);
            forw_up.push(forw);
            back_up.push(back);
            forw_up_r.push(forw_r);
            back_up_r.push(back_r);
        }

        self.forward_out.r_gradient(&forw_up, &forw_up_r, rg, g);
        self.backward_out.r_gradient(&back_up, &back_up_r, rg, g);
    }
}

fn join(front: &Vector, back: &Vector) -> Vector {
    concatenate(Axis(0), &[front.view(), back.view()]).expect("1-D vectors always concatenate")
}

/// Removes each joined variable's entry from `g` and splits it at `forw_len`.
/// The backward half comes out reversed in time, matching the backward
/// member's own ordering.
fn split_joined(
    joined_seq: &[Rc<Variable>],
    forw_len: usize,
    g: &mut Gradient,
) -> (Vec<Vector>, Vec<Vector>) {
    let mut forw = Vec::with_capacity(joined_seq.len());
    let mut back = Vec::with_capacity(joined_seq.len());
    for var in joined_seq {
        let grad = g
            .remove(var.id())
            .expect("joined gradient entry must survive the output function");
        forw.push(grad.slice(s![..forw_len]).to_owned());
        back.push(grad.slice(s![forw_len..]).to_owned());
    }
    back.reverse();
    (forw, back)
}

fn seq_output_size(seqs: &[Vec<Vector>]) -> usize {
    seqs.iter()
        .find_map(|seq| seq.first().map(|v| v.len()))
        .unwrap_or(0)
}

fn reverse_seqs<T: Clone>(seqs: &[Vec<T>]) -> Vec<Vec<T>> {
    seqs.iter()
        .map(|seq| seq.iter().rev().cloned().collect())
        .collect()
}
