use std::rc::Rc;

use tracing::{debug, instrument};

use crate::autofunc::{Gradient, RGradient, RVector, Value, Variable};
use crate::block::Block;
use crate::cost::CostFunc;
use crate::errors::Result;
use crate::model_config::BpttConfig;
use crate::seq_func::SeqFunc;
use crate::seq_prop::{Sample, SeqProp, SeqRProp};

/// Computes gradients of a batch of samples with truncated BPTT.
///
/// Samples are streamed through a fresh session. Every `head_size` steps the
/// newest head is back-propagated with `tail_size` extra steps of context and
/// the session is truncated to the tail, or to the newest record when the
/// tail is empty so that lanes keep their states. With `tail_size` at least as long as
/// the longest sample this equals full back-propagation through time.
pub struct Bptt {
    pub block: Rc<dyn Block>,
    pub cost: Rc<dyn CostFunc>,
    pub head_size: usize,
    pub tail_size: usize,
}

impl Bptt {
    pub fn new(block: Rc<dyn Block>, cost: Rc<dyn CostFunc>, config: &BpttConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            block,
            cost,
            head_size: config.head_size,
            tail_size: config.tail_size,
        })
    }

    /// Records kept between windows. The newest record always survives so
    /// that the next timestep continues from its states instead of the start
    /// state.
    fn retained(&self) -> usize {
        self.tail_size.max(1)
    }

    /// Adds the cost gradient of `samples` into the entries already in `g`.
    #[instrument(skip_all, fields(samples = samples.len(), head = self.head_size, tail = self.tail_size))]
    pub fn gradient(&self, samples: &[Sample], g: &mut Gradient) -> Result<()> {
        let mut session = SeqProp::new(self.block.clone(), self.cost.clone());
        let mut seqs: Vec<Sample> = samples.iter().filter(|s| !s.is_empty()).cloned().collect();
        let mut since_backprop = 0;
        while !seqs.is_empty() {
            seqs = session.time_step(seqs);
            since_backprop += 1;
            if since_backprop == self.head_size {
                session.back_propagate(g, self.head_size, self.tail_size)?;
                session.truncate(self.retained());
                since_backprop = 0;
            }
        }
        if since_backprop > 0 {
            session.back_propagate(g, since_backprop, self.tail_size)?;
        }
        debug!(parameters = g.len(), "BPTT gradient done");
        Ok(())
    }

    /// Like [`Bptt::gradient`], also adding the R-gradient along `rv` into `rg`.
    #[instrument(skip_all, fields(samples = samples.len(), head = self.head_size, tail = self.tail_size))]
    pub fn r_gradient(
        &self,
        rv: &RVector,
        samples: &[Sample],
        g: &mut Gradient,
        rg: &mut RGradient,
    ) -> Result<()> {
        let mut session = SeqRProp::new(self.block.clone(), self.cost.clone());
        let mut seqs: Vec<Sample> = samples.iter().filter(|s| !s.is_empty()).cloned().collect();
        let mut since_backprop = 0;
        while !seqs.is_empty() {
            seqs = session.time_step(rv, seqs);
            since_backprop += 1;
            if since_backprop == self.head_size {
                session.back_propagate(g, rg, self.head_size, self.tail_size)?;
                session.truncate(self.retained());
                since_backprop = 0;
            }
        }
        if since_backprop > 0 {
            session.back_propagate(g, rg, since_backprop, self.tail_size)?;
        }
        Ok(())
    }
}

/// Sum of the per-timestep costs of `func` over every sample.
pub fn total_cost(func: &dyn SeqFunc, cost: &dyn CostFunc, samples: &[Sample]) -> f64 {
    let inputs: Vec<Vec<Rc<dyn Value>>> = samples
        .iter()
        .map(|s| {
            s.inputs
                .iter()
                .map(|x| Variable::new(x.clone()) as Rc<dyn Value>)
                .collect()
        })
        .collect();
    let result = func.batch_seqs(&inputs);
    result
        .output_seqs()
        .iter()
        .zip(samples)
        .flat_map(|(outs, sample)| outs.iter().zip(&sample.outputs))
        .map(|(actual, target)| cost.cost(target, actual))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense_block::DenseBlock;
    use crate::errors::RnnError;
    use crate::cost::SquaredError;

    #[test]
    fn test_zero_head_size_is_rejected() {
        let block: Rc<dyn Block> = Rc::new(DenseBlock::new(1, 2, 1));
        let config = BpttConfig {
            head_size: 0,
            tail_size: 1,
        };
        assert!(matches!(
            Bptt::new(block, Rc::new(SquaredError), &config),
            Err(RnnError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_empty_batch_leaves_gradient_untouched() {
        let block = Rc::new(DenseBlock::new(1, 2, 1));
        let mut g = Gradient::for_variables(&block.parameters().unwrap());
        let before = g.clone();
        let bptt = Bptt::new(block, Rc::new(SquaredError), &BpttConfig::default()).unwrap();
        bptt.gradient(&[Sample::new(vec![], vec![])], &mut g).unwrap();
        for id in before.ids() {
            assert_eq!(g.get(id), before.get(id));
        }
    }
}
