mod common;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use common::{sample, spec};
use power_attention::{power_full, Attention, AttentionError, ChunkedAttention, Config};

#[test]
fn indivisible_sequence_is_a_contract_violation() -> Result<()> {
    let mut input_spec = spec(1000, 1, 1, 2, 2);
    input_spec.batch = 1;
    input_spec.gating = false;
    let inputs = sample(&input_spec, 0)?;
    let config = Config {
        chunk_size: Some(128),
        ..Config::default()
    };
    let err = power_full(&inputs.q, &inputs.k, &inputs.v, None, None, &config).unwrap_err();
    assert!(err.is_contract_violation(), "{err}");
    assert!(matches!(
        err,
        AttentionError::ChunkLength {
            seq_len: 1000,
            chunk_size: 128
        }
    ));
    Ok(())
}

#[test]
fn initial_state_is_unimplemented() -> Result<()> {
    let inputs = sample(&spec(16, 2, 2, 4, 4), 0)?;
    let state = Tensor::zeros((2, 2, 10, 5), DType::F32, &Device::Cpu)?;
    let err = power_full(
        &inputs.q,
        &inputs.k,
        &inputs.v,
        inputs.log_g.as_ref(),
        Some(&state),
        &Config::default(),
    )
    .unwrap_err();
    assert!(err.is_unimplemented());
    assert!(!err.is_contract_violation());
    Ok(())
}

#[test]
fn non_integral_head_ratio() -> Result<()> {
    let q = Tensor::zeros((1, 8, 7, 4), DType::F32, &Device::Cpu)?;
    let kv = Tensor::zeros((1, 8, 3, 4), DType::F32, &Device::Cpu)?;
    let err = ChunkedAttention::new()
        .compute_attention(&q, &kv, &kv, None, &Config::default())
        .unwrap_err();
    assert!(matches!(
        err,
        AttentionError::HeadRatio {
            query_heads: 7,
            kv_heads: 3
        }
    ));
    Ok(())
}

#[test]
fn normalized_output_across_chunks_is_unimplemented() -> Result<()> {
    let inputs = sample(&spec(16, 2, 2, 4, 4), 1)?;
    let config = Config {
        chunk_size: Some(4),
        normalize_output: true,
        ..Config::default()
    };
    let err = power_full(&inputs.q, &inputs.k, &inputs.v, None, None, &config).unwrap_err();
    assert!(err.is_unimplemented(), "{err}");

    // A single chunk is the quadratic path and is supported.
    let single = Config {
        chunk_size: None,
        ..config
    };
    let out = power_full(&inputs.q, &inputs.k, &inputs.v, None, None, &single)?;
    assert_eq!(out.dims(), &[2, 16, 2, 4]);
    Ok(())
}

#[test]
fn invalid_config_reports_every_violation() -> Result<()> {
    let inputs = sample(&spec(16, 2, 2, 4, 4), 2)?;
    let config = Config {
        deg: 0,
        eps: -1.0,
        chunk_size: Some(0),
        ..Config::default()
    };
    let err = power_full(&inputs.q, &inputs.k, &inputs.v, None, None, &config).unwrap_err();
    match err {
        AttentionError::InvalidConfig(messages) => assert_eq!(messages.len(), 3),
        other => panic!("unexpected error {other}"),
    }
    Ok(())
}

#[test]
fn unsupported_dtype_and_gate_dtype() -> Result<()> {
    let device = Device::Cpu;
    let q = Tensor::zeros((1, 8, 2, 4), DType::F64, &device)?;
    let err = power_full(&q, &q, &q, None, None, &Config::default()).unwrap_err();
    assert!(matches!(err, AttentionError::UnsupportedDType { .. }));

    let q = Tensor::zeros((1, 8, 2, 4), DType::BF16, &device)?;
    let gate = Tensor::zeros((1, 8, 2), DType::BF16, &device)?;
    let err = power_full(&q, &q, &q, Some(&gate), None, &Config::default()).unwrap_err();
    assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
    Ok(())
}
