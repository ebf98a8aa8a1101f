mod common;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use common::{max_abs_diff, positive, sample, spec};
use power_attention::{
    linear_full, power_full, Attention, ChunkedAttention, Config, QuadraticAttention,
};

#[test]
fn first_chunk_equals_attention_over_that_chunk() -> Result<()> {
    let inputs = sample(&spec(32, 4, 2, 8, 8), 4)?;
    let chunk = 8;
    let out = power_full(
        &inputs.q,
        &inputs.k,
        &inputs.v,
        inputs.log_g.as_ref(),
        None,
        &Config {
            chunk_size: Some(chunk),
            ..Config::default()
        },
    )?;

    let head = |t: &Tensor| t.narrow(1, 0, chunk);
    let gate = inputs.log_g.as_ref().map(head).transpose()?;
    let local = QuadraticAttention::new().compute_attention(
        &head(&inputs.q)?,
        &head(&inputs.k)?,
        &head(&inputs.v)?,
        gate.as_ref(),
        &Config::default(),
    )?;
    assert!(max_abs_diff(&out.narrow(1, 0, chunk)?, &local)? < 1e-5);
    Ok(())
}

/// Identical dot products everywhere and one-hot values, so the last
/// query's output row is its normalised weight over every key.
fn last_row_weights(gate: f32) -> Result<Vec<f32>> {
    let device = Device::Cpu;
    let t = 16;
    let q = Tensor::full(0.5f32, (1, t, 1, 2), &device)?;
    let v = Tensor::eye(t, DType::F32, &device)?.reshape((1, t, 1, t))?;
    let log_g = Tensor::full(gate, (1, t, 1), &device)?;
    let out = ChunkedAttention::new().compute_attention(
        &q,
        &q,
        &v,
        Some(&log_g),
        &Config {
            chunk_size: Some(4),
            ..Config::default()
        },
    )?;
    Ok(out.narrow(1, t - 1, 1)?.flatten_all()?.to_vec1::<f32>()?)
}

#[test]
fn decaying_gate_favours_recent_keys() -> Result<()> {
    let weights = last_row_weights(-0.1)?;
    for pair in weights.windows(2) {
        assert!(pair[0] < pair[1], "{weights:?}");
    }
    let ratio = weights[15] / weights[14];
    assert!((ratio - 0.1f32.exp()).abs() < 1e-3, "ratio {ratio}");
    Ok(())
}

#[test]
fn zero_gate_weights_all_keys_equally() -> Result<()> {
    let weights = last_row_weights(0.0)?;
    assert!(weights.iter().all(|w| (w - 1.0 / 16.0).abs() < 1e-5), "{weights:?}");
    Ok(())
}

#[test]
fn zero_gate_equals_ungated() -> Result<()> {
    let inputs = sample(&spec(32, 2, 2, 4, 4), 9)?;
    let config = Config {
        chunk_size: Some(8),
        ..Config::default()
    };
    let zero = inputs.log_g.as_ref().context("gated inputs")?.zeros_like()?;
    let gated = power_full(&inputs.q, &inputs.k, &inputs.v, Some(&zero), None, &config)?;
    let ungated = power_full(&inputs.q, &inputs.k, &inputs.v, None, None, &config)?;
    assert!(max_abs_diff(&gated, &ungated)? < 1e-6);
    Ok(())
}

#[test]
fn degree_one_takes_linear_path() -> Result<()> {
    let inputs = positive(&sample(&spec(32, 4, 2, 4, 6), 12)?)?;
    let config = Config {
        deg: 1,
        chunk_size: Some(8),
        ..Config::default()
    };
    let via_power = power_full(&inputs.q, &inputs.k, &inputs.v, inputs.log_g.as_ref(), None, &config)?;
    let via_linear = linear_full(&inputs.q, &inputs.k, &inputs.v, inputs.log_g.as_ref(), &config)?;
    assert_eq!(max_abs_diff(&via_power, &via_linear)?, 0.0);

    let reference = QuadraticAttention::new().compute_attention(
        &inputs.q,
        &inputs.k,
        &inputs.v,
        inputs.log_g.as_ref(),
        &config,
    )?;
    assert!(max_abs_diff(&via_linear, &reference)? <= 5e-4);
    Ok(())
}

#[test]
fn inputs_survive_forward_and_backward() -> Result<()> {
    let inputs = sample(&spec(16, 2, 1, 4, 4), 6)?;
    let log_g = inputs.log_g.clone().context("gated inputs")?;
    let snapshot = |t: &Tensor| -> Result<(Vec<usize>, DType, bool, Vec<f32>)> {
        Ok((
            t.dims().to_vec(),
            t.dtype(),
            t.is_contiguous(),
            t.flatten_all()?.to_vec1::<f32>()?,
        ))
    };
    let before = [
        snapshot(&inputs.q)?,
        snapshot(&inputs.k)?,
        snapshot(&inputs.v)?,
        snapshot(&log_g)?,
    ];

    let q = Var::from_tensor(&inputs.q)?;
    let out = power_full(
        q.as_tensor(),
        &inputs.k,
        &inputs.v,
        Some(&log_g),
        None,
        &Config {
            chunk_size: Some(4),
            ..Config::default()
        },
    )?;
    out.sum_all()?.backward()?;

    let after = [
        snapshot(q.as_tensor())?,
        snapshot(&inputs.k)?,
        snapshot(&inputs.v)?,
        snapshot(&log_g)?,
    ];
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn normalized_output_backward_fails_loudly() -> Result<()> {
    let inputs = sample(&spec(8, 2, 2, 4, 4), 14)?;
    let q = Var::from_tensor(&inputs.q)?;
    let out = QuadraticAttention::new().compute_attention(
        q.as_tensor(),
        &inputs.k,
        &inputs.v,
        inputs.log_g.as_ref(),
        &Config {
            normalize_output: true,
            ..Config::default()
        },
    )?;
    let err = out.sum_all()?.backward().unwrap_err();
    assert!(err.to_string().contains("not implemented"), "{err}");
    Ok(())
}
