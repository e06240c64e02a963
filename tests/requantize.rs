// Requantization state management: multiplier derivation, bias
// rescaling across input-scale changes, and what does (and does not)
// trigger a weight repack.
use pretty_assertions::assert_eq;

use lowconv::{
    ConvConfig, ConvInput, ConvOutput, ConvShape, InputQuantization, OutputRepr,
    QuantizationParams, QuantizedConvEngine,
};

fn unit_shape() -> ConvShape {
    ConvShape {
        batch: 1,
        in_channels: 1,
        out_channels: 1,
        groups: 1,
        input_dims: vec![1, 1],
        kernel: vec![1, 1],
        stride: vec![1, 1],
        dilation: vec![1, 1],
        pad_begin: vec![0, 0],
        pad_end: vec![0, 0],
        output_dims: vec![1, 1],
    }
}

fn static_engine(
    in_scale: f32,
    w_scale: f32,
    out_scale: f32,
    out_zp: i32,
) -> QuantizedConvEngine {
    let cfg = ConvConfig {
        input_quantization: InputQuantization::Static(QuantizationParams {
            scale: in_scale,
            zero_point: 0,
        }),
        output: OutputRepr::Quantized(QuantizationParams { scale: out_scale, zero_point: out_zp }),
        ..ConvConfig::default()
    };
    let mut e = QuantizedConvEngine::new(unit_shape(), cfg).unwrap();
    e.set_weights_prequantized(
        &[1i8],
        &[QuantizationParams { scale: w_scale, zero_point: 0 }],
        None,
    )
    .unwrap();
    e
}

#[test]
fn unit_multiplier_exposes_accumulator() {
    // 1x1x1x1: input 3 times weight 2 with zero zero-points gives an
    // accumulator of 6; with all scales at 1 the output is 6 verbatim.
    let mut e = static_engine(1.0, 1.0, 1.0, 0);
    e.set_weights_prequantized(
        &[2i8],
        &[QuantizationParams { scale: 1.0, zero_point: 0 }],
        None,
    )
    .unwrap();
    let mut out = Vec::new();
    e.run_nhwc(ConvInput::Quantized(&[3]), ConvOutput::Quantized(&mut out))
        .unwrap();
    assert_eq!(out, vec![6]);
}

#[test]
fn multiplier_combines_three_scales() {
    // 0.5 * 0.25 / 1.0 = 0.125; an accumulator of 8 lands exactly on 1.
    let mut e = static_engine(0.5, 0.25, 1.0, 0);
    let mut out = Vec::new();
    e.run_nhwc(ConvInput::Quantized(&[8]), ConvOutput::Quantized(&mut out))
        .unwrap();
    assert_eq!(out, vec![1]);
    assert!((e.requantization_params()[0].real_multiplier - 0.125).abs() < 1e-9);
}

#[test]
fn output_scale_change_does_not_repack() {
    let mut e = static_engine(0.5, 0.25, 1.0, 0);
    let mut out = Vec::new();
    e.run_nhwc(ConvInput::Quantized(&[8]), ConvOutput::Quantized(&mut out))
        .unwrap();
    let gen_before = e.pack_generation();

    e.set_output_params(QuantizationParams { scale: 0.5, zero_point: 0 }).unwrap();
    e.run_nhwc(ConvInput::Quantized(&[8]), ConvOutput::Quantized(&mut out))
        .unwrap();
    // Same accumulator, half the output scale: twice the quantized value.
    assert_eq!(out, vec![2]);
    assert_eq!(e.pack_generation(), gen_before);
}

#[test]
fn setting_weights_bumps_generation() {
    let mut e = static_engine(0.5, 0.25, 1.0, 0);
    let g1 = e.pack_generation();
    e.set_weights_prequantized(
        &[2i8],
        &[QuantizationParams { scale: 0.25, zero_point: 0 }],
        None,
    )
    .unwrap();
    assert_eq!(e.pack_generation(), g1 + 1);
}

#[test]
fn fused_relu_equals_clamp_after_requantization() {
    let shape = ConvShape {
        batch: 1,
        in_channels: 2,
        out_channels: 4,
        groups: 1,
        input_dims: vec![4, 4],
        kernel: vec![3, 3],
        stride: vec![1, 1],
        dilation: vec![1, 1],
        pad_begin: vec![1, 1],
        pad_end: vec![1, 1],
        output_dims: vec![4, 4],
    };
    let in_p = QuantizationParams { scale: 0.1, zero_point: 128 };
    let out_p = QuantizationParams { scale: 0.2, zero_point: 100 };
    let wq: Vec<i8> = (0..4 * 2 * 9).map(|i| ((i * 7) % 120) as i8 - 60).collect();
    let input: Vec<u8> = (0..4 * 4 * 2).map(|i| (i * 13 % 256) as u8).collect();

    let build = |relu: bool| {
        let cfg = ConvConfig {
            input_quantization: InputQuantization::Static(in_p),
            output: OutputRepr::Quantized(out_p),
            fused_relu: relu,
            ..ConvConfig::default()
        };
        let mut e = QuantizedConvEngine::new(shape.clone(), cfg).unwrap();
        e.set_weights_prequantized(
            &wq,
            &[QuantizationParams { scale: 0.05, zero_point: 0 }],
            None,
        )
        .unwrap();
        e
    };

    let mut plain = Vec::new();
    build(false)
        .run_nhwc(ConvInput::Quantized(&input), ConvOutput::Quantized(&mut plain))
        .unwrap();
    let mut fused = Vec::new();
    build(true)
        .run_nhwc(ConvInput::Quantized(&input), ConvOutput::Quantized(&mut fused))
        .unwrap();

    let clamped: Vec<u8> = plain
        .iter()
        .map(|&q| q.max(out_p.zero_point as u8))
        .collect();
    assert_eq!(fused, clamped);
    // The data must actually exercise the clamp.
    assert_ne!(plain, fused);
}

#[test]
fn bias_tracks_dynamic_input_scale() {
    // Dynamic calibration gives each run its own input scale; the
    // quantized bias must follow so the real-valued result stays put.
    let shape = ConvShape {
        batch: 1,
        in_channels: 1,
        out_channels: 1,
        groups: 1,
        input_dims: vec![2, 2],
        kernel: vec![2, 2],
        stride: vec![1, 1],
        dilation: vec![1, 1],
        pad_begin: vec![0, 0],
        pad_end: vec![0, 0],
        output_dims: vec![1, 1],
    };
    let out_p = QuantizationParams { scale: 0.1, zero_point: 0 };
    let cfg = ConvConfig {
        output: OutputRepr::Quantized(out_p),
        ..ConvConfig::default()
    };
    let mut e = QuantizedConvEngine::new(shape, cfg).unwrap();
    e.set_weights(&[1.0, 1.0, 1.0, 1.0], Some(&[2.0])).unwrap();

    let mut out = Vec::new();
    for (range, want_real) in [(1.0f32, 4.0 * 1.0 + 2.0), (4.0, 4.0 * 4.0 + 2.0)] {
        let input = vec![range; 4];
        e.run_nhwc(ConvInput::Float(&input), ConvOutput::Quantized(&mut out))
            .unwrap();
        let real = out_p.scale * (out[0] as i32 - out_p.zero_point) as f32;
        assert!(
            (real - want_real).abs() <= out_p.scale + range * 0.05,
            "input {range}: got {real}, want {want_real}"
        );
    }
}
