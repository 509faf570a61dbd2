mod common;

use std::rc::Rc;

use common::*;
use rnnprop::seq_func::{constant_r_seqs, constant_seqs};
use rnnprop::{
    Block, BlockSeqFunc, Bptt, BpttConfig, CostFunc, Gradient, RGradient, RnnError, Sample,
    SeqFunc, SeqProp, SeqRProp, SquaredError, Vector, total_cost,
};

fn samples(lens: &[usize], seed: u64) -> Vec<Sample> {
    let mut rng = rng(seed);
    let inputs = random_seqs(&mut rng, lens, 2);
    let outputs = random_seqs(&mut rng, lens, 2);
    inputs
        .into_iter()
        .zip(outputs)
        .map(|(i, o)| Sample::new(i, o))
        .collect()
}

fn setup(seed: u64) -> (Rc<dyn Block>, Vec<Rc<rnnprop::Variable>>) {
    let block = dense_block(seed, 2, 3, 2);
    let params = block.parameters().unwrap();
    randomize(&params, seed + 100);
    (block as Rc<dyn Block>, params)
}

/// Gradient of the whole batch from the unrolled sequence function.
fn full_gradient(block: &Rc<dyn Block>, params: &[Rc<rnnprop::Variable>], batch: &[Sample]) -> Gradient {
    let func = BlockSeqFunc::new(block.clone());
    let inputs: Vec<Vec<Vector>> = batch.iter().map(|s| s.inputs.clone()).collect();
    let out = func.batch_seqs(&constant_seqs(&inputs));
    let upstream: Vec<Vec<Vector>> = out
        .output_seqs()
        .iter()
        .zip(batch)
        .map(|(o, s)| o.iter().zip(&s.outputs).map(|(a, t)| SquaredError.deriv(t, a)).collect())
        .collect();
    let mut g = Gradient::for_variables(params);
    out.gradient(&upstream, &mut g);
    g
}

#[test]
fn test_session_outputs_match_unrolled_outputs() {
    let (block, _) = setup(1);
    let batch = samples(&[4, 2, 3], 2);
    let func = BlockSeqFunc::new(block.clone());
    let inputs: Vec<Vec<Vector>> = batch.iter().map(|s| s.inputs.clone()).collect();
    let expected = func.batch_seqs(&constant_seqs(&inputs)).output_seqs().to_vec();

    let mut session = SeqProp::new(block, Rc::new(SquaredError));
    let mut seqs = batch;
    let mut t = 0;
    while !seqs.is_empty() {
        let active: Vec<usize> = (0..expected.len()).filter(|&l| expected[l].len() > t).collect();
        seqs = session.time_step(seqs);
        let outs = session.last_outputs().unwrap();
        assert_eq!(outs.len(), active.len());
        for (out, lane) in outs.iter().zip(active) {
            assert_eq!(out, &expected[lane][t]);
        }
        t += 1;
    }
    assert_eq!(session.memory_count(), 4);
}

#[test]
fn test_full_window_matches_unrolled_gradient() {
    let (block, params) = setup(3);
    let batch = samples(&[5, 1, 3, 0], 4);

    let mut session = SeqProp::new(block.clone(), Rc::new(SquaredError));
    let mut seqs = batch.clone();
    while !seqs.is_empty() {
        seqs = session.time_step(seqs);
    }
    let mut g = Gradient::for_variables(&params);
    session.back_propagate(&mut g, session.memory_count(), 0).unwrap();

    let expected = full_gradient(&block, &params, &batch);
    assert_vectors_close(&gradient_vectors(&params, &g), &gradient_vectors(&params, &expected), 1e-10);
    assert_eq!(g.len(), params.len());
}

#[test]
fn test_bptt_with_long_tail_equals_full_backprop() {
    let (block, params) = setup(5);
    let batch = samples(&[7, 4, 6], 6);
    let config = BpttConfig {
        head_size: 2,
        tail_size: 10,
    };
    let bptt = Bptt::new(block.clone(), Rc::new(SquaredError), &config).unwrap();
    let mut g = Gradient::for_variables(&params);
    bptt.gradient(&batch, &mut g).unwrap();

    let expected = full_gradient(&block, &params, &batch);
    assert_vectors_close(&gradient_vectors(&params, &g), &gradient_vectors(&params, &expected), 1e-10);
}

#[test]
fn test_truncated_memory_gives_same_window_gradient() {
    let (block, params) = setup(7);
    let batch = samples(&[6, 6], 8);

    let mut full = SeqProp::new(block.clone(), Rc::new(SquaredError));
    let mut seqs = batch.clone();
    while !seqs.is_empty() {
        seqs = full.time_step(seqs);
    }
    let mut g_full = Gradient::for_variables(&params);
    full.back_propagate(&mut g_full, 3, 0).unwrap();

    let mut truncated = SeqProp::new(block, Rc::new(SquaredError));
    let mut seqs = batch;
    while !seqs.is_empty() {
        seqs = truncated.time_step(seqs);
        truncated.truncate(3);
    }
    assert_eq!(truncated.memory_count(), 3);
    let mut g_trunc = Gradient::for_variables(&params);
    truncated.back_propagate(&mut g_trunc, 3, 0).unwrap();

    assert_vectors_close(
        &gradient_vectors(&params, &g_trunc),
        &gradient_vectors(&params, &g_full),
        1e-12,
    );
}

#[test]
fn test_truncate_to_memory_size_is_a_no_op() {
    let (block, _) = setup(9);
    let mut session = SeqProp::new(block, Rc::new(SquaredError));
    session.truncate(0);
    assert_eq!(session.memory_count(), 0);

    let mut seqs = samples(&[3], 10);
    seqs = session.time_step(seqs);
    session.time_step(seqs);
    session.truncate(2);
    session.truncate(5);
    assert_eq!(session.memory_count(), 2);
    session.truncate(0);
    assert_eq!(session.memory_count(), 0);
}

#[test]
fn test_window_past_discarded_history_is_an_error() {
    let (block, params) = setup(11);
    let mut session = SeqProp::new(block, Rc::new(SquaredError));
    let mut seqs = samples(&[4, 4], 12);
    while !seqs.is_empty() {
        seqs = session.time_step(seqs);
    }
    session.truncate(2);

    let mut g = Gradient::for_variables(&params);
    let before = gradient_vectors(&params, &g);
    match session.back_propagate(&mut g, 2, 1) {
        Err(RnnError::HistoryDiscarded { requested, retained }) => {
            assert_eq!(requested, 3);
            assert_eq!(retained, 2);
        }
        other => panic!("expected HistoryDiscarded, got {:?}", other.err()),
    }
    assert_eq!(gradient_vectors(&params, &g), before);

    // A window that exactly covers what is left is fine.
    session.back_propagate(&mut g, 2, 0).unwrap();
}

#[test]
fn test_empty_sequences_are_skipped() {
    let (block, _) = setup(13);
    let mut session = SeqProp::new(block, Rc::new(SquaredError));
    let rest = session.time_step(samples(&[0, 2, 0], 14));
    assert_eq!(rest.len(), 1);
    assert_eq!(session.last_outputs().unwrap().len(), 1);
    assert!(session.time_step(rest).is_empty());
    assert_eq!(session.memory_count(), 2);
}

#[test]
fn test_r_session_matches_unrolled_r_gradient() {
    let (block, params) = setup(15);
    let batch = samples(&[4, 2, 5], 16);
    let rv = random_direction(&params, 17);

    let config = BpttConfig {
        head_size: 3,
        tail_size: 8,
    };
    let bptt = Bptt::new(block.clone(), Rc::new(SquaredError), &config).unwrap();
    let mut g = Gradient::for_variables(&params);
    let mut rg = RGradient::for_variables(&params);
    bptt.r_gradient(&rv, &batch, &mut g, &mut rg).unwrap();

    let func = BlockSeqFunc::new(block.clone());
    let inputs: Vec<Vec<Vector>> = batch.iter().map(|s| s.inputs.clone()).collect();
    let out = func.batch_seqs_r(&rv, &constant_r_seqs(&inputs));
    let mut upstream = Vec::new();
    let mut upstream_r = Vec::new();
    for ((o, o_r), s) in out.output_seqs().iter().zip(out.r_output_seqs()).zip(&batch) {
        let (d, rd): (Vec<Vector>, Vec<Vector>) = o
            .iter()
            .zip(o_r)
            .zip(&s.outputs)
            .map(|((a, a_r), t)| SquaredError.r_deriv(t, a, a_r))
            .unzip();
        upstream.push(d);
        upstream_r.push(rd);
    }
    let mut g_expected = Gradient::for_variables(&params);
    let mut rg_expected = RGradient::for_variables(&params);
    out.r_gradient(&upstream, &upstream_r, &mut rg_expected, &mut g_expected);

    assert_vectors_close(&gradient_vectors(&params, &g), &gradient_vectors(&params, &g_expected), 1e-10);
    assert_vectors_close(&gradient_vectors(&params, &rg), &gradient_vectors(&params, &rg_expected), 1e-10);
}

#[test]
fn test_r_session_window_error() {
    let (block, params) = setup(19);
    let rv = random_direction(&params, 20);
    let mut session = SeqRProp::new(block, Rc::new(SquaredError));
    let mut seqs = samples(&[3], 21);
    while !seqs.is_empty() {
        seqs = session.time_step(&rv, seqs);
    }
    session.truncate(1);
    let mut g = Gradient::for_variables(&params);
    let mut rg = RGradient::for_variables(&params);
    assert!(matches!(
        session.back_propagate(&mut g, &mut rg, 1, 1),
        Err(RnnError::HistoryDiscarded { .. })
    ));
    assert!(session.back_propagate(&mut g, &mut rg, 1, 0).is_ok());
}

#[test]
fn test_bptt_descends_total_cost() {
    let (block, params) = setup(23);
    let batch = samples(&[5, 3, 4], 24);
    let func = BlockSeqFunc::new(block.clone());
    let before = total_cost(&func, &SquaredError, &batch);

    let bptt = Bptt::new(block, Rc::new(SquaredError), &BpttConfig::default()).unwrap();
    let mut g = Gradient::for_variables(&params);
    bptt.gradient(&batch, &mut g).unwrap();
    g.scale(-1e-3);
    for p in &params {
        *p.vector_mut() += g.get(p.id()).unwrap();
    }

    let after = total_cost(&func, &SquaredError, &batch);
    assert!(after < before, "cost went from {} to {}", before, after);
}

#[test]
fn test_total_cost_sums_every_timestep() {
    let (block, _) = setup(25);
    let batch = samples(&[2, 3], 26);
    let func = BlockSeqFunc::new(block);
    let inputs: Vec<Vec<Vector>> = batch.iter().map(|s| s.inputs.clone()).collect();
    let out = func.batch_seqs(&constant_seqs(&inputs));
    let expected: f64 = out
        .output_seqs()
        .iter()
        .zip(&batch)
        .flat_map(|(o, s)| o.iter().zip(&s.outputs))
        .map(|(a, t)| SquaredError.cost(t, a))
        .sum();
    approx::assert_abs_diff_eq!(total_cost(&func, &SquaredError, &batch), expected, epsilon = 1e-12);
}

#[test]
fn test_empty_tail_carries_state_across_windows() {
    let (block, params) = setup(27);
    let batch = samples(&[4, 5], 28);

    let config = BpttConfig {
        head_size: 2,
        tail_size: 0,
    };
    let bptt = Bptt::new(block.clone(), Rc::new(SquaredError), &config).unwrap();
    let mut g = Gradient::for_variables(&params);
    bptt.gradient(&batch, &mut g).unwrap();

    // Same windows over a session that is never truncated.
    let mut session = SeqProp::new(block, Rc::new(SquaredError));
    let mut g_expected = Gradient::for_variables(&params);
    let mut seqs = batch;
    let mut since = 0;
    while !seqs.is_empty() {
        seqs = session.time_step(seqs);
        since += 1;
        if since == 2 {
            session.back_propagate(&mut g_expected, 2, 0).unwrap();
            since = 0;
        }
    }
    if since > 0 {
        session.back_propagate(&mut g_expected, since, 0).unwrap();
    }

    assert_vectors_close(
        &gradient_vectors(&params, &g),
        &gradient_vectors(&params, &g_expected),
        1e-10,
    );
}

#[test]
fn test_empty_tail_carries_r_state_across_windows() {
    let (block, params) = setup(29);
    let batch = samples(&[3, 5], 30);
    let rv = random_direction(&params, 31);

    let config = BpttConfig {
        head_size: 2,
        tail_size: 0,
    };
    let bptt = Bptt::new(block.clone(), Rc::new(SquaredError), &config).unwrap();
    let mut g = Gradient::for_variables(&params);
    let mut rg = RGradient::for_variables(&params);
    bptt.r_gradient(&rv, &batch, &mut g, &mut rg).unwrap();

    let mut session = SeqRProp::new(block, Rc::new(SquaredError));
    let mut g_expected = Gradient::for_variables(&params);
    let mut rg_expected = RGradient::for_variables(&params);
    let mut seqs = batch;
    let mut since = 0;
    while !seqs.is_empty() {
        seqs = session.time_step(&rv, seqs);
        since += 1;
        if since == 2 {
            session
                .back_propagate(&mut g_expected, &mut rg_expected, 2, 0)
                .unwrap();
            since = 0;
        }
    }
    if since > 0 {
        session
            .back_propagate(&mut g_expected, &mut rg_expected, since, 0)
            .unwrap();
    }

    assert_vectors_close(&gradient_vectors(&params, &g), &gradient_vectors(&params, &g_expected), 1e-10);
    assert_vectors_close(&gradient_vectors(&params, &rg), &gradient_vectors(&params, &rg_expected), 1e-10);
}

#[test]
fn test_reset_session_back_propagates_nothing() {
    let (block, params) = setup(33);
    let mut session = SeqProp::new(block, Rc::new(SquaredError));
    let mut seqs = samples(&[4, 3], 34);
    while !seqs.is_empty() {
        seqs = session.time_step(seqs);
    }
    session.truncate(0);
    assert_eq!(session.memory_count(), 0);

    let mut g = Gradient::for_variables(&params);
    let before = gradient_vectors(&params, &g);
    session.back_propagate(&mut g, 3, 2).unwrap();
    assert_eq!(gradient_vectors(&params, &g), before);
    assert_eq!(g.len(), params.len());
}

#[test]
fn test_reset_r_session_back_propagates_nothing() {
    let (block, params) = setup(35);
    let rv = random_direction(&params, 36);
    let mut session = SeqRProp::new(block, Rc::new(SquaredError));
    let mut seqs = samples(&[4, 3], 37);
    while !seqs.is_empty() {
        seqs = session.time_step(&rv, seqs);
    }
    session.truncate(0);

    let mut g = Gradient::for_variables(&params);
    let mut rg = RGradient::for_variables(&params);
    let before = gradient_vectors(&params, &g);
    session.back_propagate(&mut g, &mut rg, 3, 2).unwrap();
    assert_eq!(gradient_vectors(&params, &g), before);
    assert_eq!(gradient_vectors(&params, &rg), before);
}

#[test]
#[should_panic(expected = "incorrect number of input sequences")]
fn test_dropping_a_lane_between_timesteps_panics() {
    let (block, _) = setup(39);
    let mut session = SeqProp::new(block, Rc::new(SquaredError));
    let mut rest = session.time_step(samples(&[3, 3], 40));
    rest.pop();
    session.time_step(rest);
}

#[test]
#[should_panic(expected = "incorrect number of input sequences")]
fn test_dropping_a_lane_between_r_timesteps_panics() {
    let (block, params) = setup(41);
    let rv = random_direction(&params, 42);
    let mut session = SeqRProp::new(block, Rc::new(SquaredError));
    let mut rest = session.time_step(&rv, samples(&[3, 3], 43));
    rest.pop();
    session.time_step(&rv, rest);
}
