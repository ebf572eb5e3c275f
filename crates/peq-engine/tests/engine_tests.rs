//! End-to-end tests across the control, audio and rebuild threads

use std::time::Duration;

use approx::assert_relative_eq;
use peq_dsp::params::{BandParams, ChannelRole, DynamicMode, FilterShape, PhaseMode};
use peq_engine::{EqController, EqEngine, GlobalParams};

const SR: f64 = 48000.0;
const BLOCK: usize = 512;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sine(freq: f64, len: usize) -> Vec<f64> {
    (0..len)
        .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / SR).sin())
        .collect()
}

fn bell(freq: f64, gain: f64) -> BandParams {
    BandParams {
        enabled: true,
        shape: FilterShape::Bell,
        frequency_hz: freq,
        gain_db: gain,
        q: 1.0,
        role: ChannelRole::All,
        ..Default::default()
    }
}

fn wait_rebuild(controller: &EqController) {
    for _ in 0..500 {
        if !controller.rebuild_busy() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("rebuild never finished");
}

fn rms(block: &[f64]) -> f64 {
    (block.iter().map(|x| x * x).sum::<f64>() / block.len() as f64).sqrt()
}

fn run_blocks(engine: &mut EqEngine, input: &[f64], blocks: usize) -> Vec<f64> {
    let mut last_left = vec![0.0; BLOCK];
    for _ in 0..blocks {
        let mut left = input.to_vec();
        let mut right = input.to_vec();
        {
            let mut bufs: Vec<&mut [f64]> = vec![&mut left, &mut right];
            engine.process_block(&mut bufs, None);
        }
        last_left.copy_from_slice(&left);
    }
    last_left
}

#[test]
fn test_linear_phase_applies_boost_after_rebuild() {
    init_logging();
    let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
    let globals = GlobalParams {
        phase_mode: PhaseMode::Natural,
        quality_tier: 0,
        ..Default::default()
    };
    let reported = controller.tick(&[bell(1000.0, 12.0)], &globals);
    // Natural tier 0 = 128 taps
    assert_eq!(reported, Some(63));
    wait_rebuild(&controller);

    let input = sine(1000.0, BLOCK);
    // Enough blocks to flush the convolver and delay transients
    let out = run_blocks(&mut engine, &input, 8);

    assert_eq!(engine.latency_samples(), 63);
    // 12 dB at the band centre is a 4x amplitude boost; the short FIR
    // realizes most of it
    let ratio = rms(&out) / rms(&input);
    assert!(ratio > 2.0, "boost not applied, ratio {ratio}");
    assert!(out.iter().all(|x| x.is_finite()));
}

#[test]
fn test_linear_phase_leaves_far_band_untouched() {
    let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
    let globals = GlobalParams {
        phase_mode: PhaseMode::Linear,
        quality_tier: 1,
        ..Default::default()
    };
    controller.tick(&[bell(100.0, 12.0)], &globals);
    wait_rebuild(&controller);

    // 8 kHz tone, far above the boosted band
    let input = sine(8000.0, BLOCK);
    let out = run_blocks(&mut engine, &input, 12);

    let ratio = rms(&out) / rms(&input);
    assert_relative_eq!(ratio, 1.0, epsilon = 0.1);
}

#[test]
fn test_external_detector_drives_dynamics() {
    let mut band = bell(1000.0, 12.0);
    band.dynamic_enabled = true;
    band.dynamic_mode = DynamicMode::Down;
    band.threshold_db = -40.0;
    band.use_external_detector = true;

    let input = sine(1000.0, BLOCK);
    let loud = sine(1000.0, BLOCK);
    let quiet = vec![0.0; BLOCK];

    let process_with = |detector: &[f64]| {
        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        controller.tick(&[band], &GlobalParams::default());
        let mut last = vec![0.0; BLOCK];
        for _ in 0..16 {
            let mut left = input.clone();
            let mut right = input.clone();
            let mut bufs: Vec<&mut [f64]> = vec![&mut left, &mut right];
            let det: Vec<&[f64]> = vec![detector, detector];
            engine.process_block(&mut bufs, Some(&det));
            last.copy_from_slice(&left);
        }
        rms(&last)
    };

    let with_loud = process_with(&loud);
    let with_quiet = process_with(&quiet);

    // A hot sidechain pulls the downward-dynamic boost back
    assert!(
        with_loud < with_quiet * 0.9,
        "sidechain had no effect: loud {with_loud}, quiet {with_quiet}"
    );
}

#[test]
fn test_bypass_toggle_follows_ticks() {
    let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
    let input = sine(440.0, BLOCK);
    let band = bell(440.0, 12.0);

    controller.tick(&[band], &GlobalParams::default());
    let processed = run_blocks(&mut engine, &input, 4);
    assert!(rms(&processed) > rms(&input) * 1.5);

    let globals = GlobalParams {
        bypass: true,
        ..Default::default()
    };
    controller.tick(&[band], &globals);
    let mut left = input.clone();
    let mut right = input.clone();
    {
        let mut bufs: Vec<&mut [f64]> = vec![&mut left, &mut right];
        engine.process_block(&mut bufs, None);
    }
    assert_eq!(left, input);
}

#[test]
fn test_mode_switch_between_blocks_stays_finite() {
    let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
    let input = sine(1000.0, BLOCK);
    let band = bell(1000.0, 6.0);

    controller.tick(&[band], &GlobalParams::default());
    run_blocks(&mut engine, &input, 2);

    let globals = GlobalParams {
        phase_mode: PhaseMode::Natural,
        quality_tier: 0,
        ..Default::default()
    };
    controller.tick(&[band], &globals);
    wait_rebuild(&controller);
    let out = run_blocks(&mut engine, &input, 4);
    assert!(out.iter().all(|x| x.is_finite()));

    controller.tick(&[band], &GlobalParams::default());
    let out = run_blocks(&mut engine, &input, 4);
    assert!(out.iter().all(|x| x.is_finite()));
}
