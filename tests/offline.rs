mod common;

use common::init_tracing;
use rendergraph::nodes::{ConstantSourceNode, GainNode, OscillatorNode};
use rendergraph::{BaseAudioContext, ContextEvent, ContextState, GraphError, OfflineAudioContext};

#[test]
fn renders_the_requested_length() {
    init_tracing();
    let mut ctx = OfflineAudioContext::new(2, 1000, 44_100).unwrap();
    let mut osc = OscillatorNode::new(&ctx).unwrap();
    ctx.connect(&osc, &ctx.destination()).unwrap();
    osc.start(0.0).unwrap();

    let buffer = ctx.render().unwrap();
    assert_eq!(buffer.length(), 1000);
    assert_eq!(buffer.number_of_channels(), 2);
    assert_eq!(buffer.sample_rate(), 44_100);
    assert!(buffer.channel(0).iter().any(|&s| s > 0.9));
    assert_eq!(buffer.channel(0), buffer.channel(1));
    assert_eq!(ctx.state(), ContextState::Closed);
}

#[test]
fn every_suspend_fires_once_in_order() {
    let mut ctx = OfflineAudioContext::new(1, 64 * 8, 48_000).unwrap();
    let mut source = ConstantSourceNode::new(&ctx).unwrap();
    let gain = GainNode::new(&ctx).unwrap();
    ctx.connect(&source, &gain).unwrap();
    ctx.connect(&gain, &ctx.destination()).unwrap();
    source.start(0.0).unwrap();

    ctx.suspend_at_frame(64 * 5).unwrap();
    ctx.suspend_at_frame(64 * 2).unwrap();
    assert!(matches!(ctx.suspend_at_frame(64 * 2 + 10), Err(GraphError::InvalidSchedule(_))));
    ctx.start_rendering().unwrap();

    let mut suspended = Vec::new();
    let buffer = loop {
        match ctx.next_event().expect("rendering stopped early") {
            ContextEvent::SuspendedAt { frame } => {
                assert_eq!(ctx.state(), ContextState::Suspended);
                assert_eq!(ctx.current_frame(), frame);
                suspended.push(frame);
                gain.gain().set_value(suspended.len() as f32 + 1.0);
                ctx.resume().unwrap();
            }
            ContextEvent::RenderComplete(buffer) => break buffer,
            _ => {}
        }
    };

    assert_eq!(suspended, vec![128, 320]);
    let samples = buffer.channel(0);
    assert!(samples[..128].iter().all(|&s| s == 1.0));
    assert!(samples[128..320].iter().all(|&s| s == 2.0));
    assert!(samples[320..].iter().all(|&s| s == 3.0));
    assert!(ctx.next_event().is_none());
}

#[test]
fn suspend_can_be_added_while_suspended() {
    let mut ctx = OfflineAudioContext::new(1, 64 * 4, 48_000).unwrap();
    ctx.suspend_at_frame(64).unwrap();
    ctx.start_rendering().unwrap();

    match ctx.next_event() {
        Some(ContextEvent::SuspendedAt { frame: 64 }) => {}
        other => panic!("expected a suspend at 64, got {:?}", other),
    }
    assert!(matches!(ctx.suspend_at_frame(0), Err(GraphError::InvalidSchedule(_))));
    ctx.suspend_at_frame(192).unwrap();
    ctx.resume().unwrap();

    match ctx.next_event() {
        Some(ContextEvent::SuspendedAt { frame: 192 }) => {}
        other => panic!("expected a suspend at 192, got {:?}", other),
    }
    ctx.resume().unwrap();
    assert_eq!(ctx.render().unwrap().length(), 256);
}

#[test]
fn resume_before_start_is_invalid() {
    let ctx = OfflineAudioContext::new(1, 128, 48_000).unwrap();
    assert!(matches!(ctx.resume(), Err(GraphError::InvalidState(_))));
}

#[test]
fn final_quantum_is_truncated() {
    let mut ctx = OfflineAudioContext::new(1, 100, 48_000).unwrap();
    let mut source = ConstantSourceNode::new(&ctx).unwrap();
    ctx.connect(&source, &ctx.destination()).unwrap();
    source.start(0.0).unwrap();
    let buffer = ctx.render().unwrap();
    assert_eq!(buffer.channel(0).len(), 100);
    assert!(buffer.channel(0).iter().all(|&s| s == 1.0));
}

#[test]
fn dropping_mid_render_cancels_the_worker() {
    let mut ctx = OfflineAudioContext::new(1, 64 * 1000, 48_000).unwrap();
    ctx.suspend_at_frame(64).unwrap();
    ctx.start_rendering().unwrap();
    assert!(matches!(ctx.next_event(), Some(ContextEvent::SuspendedAt { .. })));
    drop(ctx);
}
