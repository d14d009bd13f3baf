mod common;

use common::{init_tracing, AudioThread};
use rendergraph::nodes::{ConstantSourceNode, GainNode, MeterNode, PlaybackState};
use rendergraph::{AudioContext, BaseAudioContext, ContextEvent, ContextOptions};

#[test]
fn contended_quanta_render_stale_snapshot_and_defer_pruning() {
    init_tracing();
    let (ctx, renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
    let mut a = ConstantSourceNode::new(&ctx).unwrap();
    ctx.connect(&a, &ctx.destination()).unwrap();
    a.start(0.0).unwrap();
    // quantum 9 covers frames 512..576
    a.stop(576.0 / 48_000.0).unwrap();
    ctx.resume().unwrap();

    let audio = AudioThread::spawn(renderer);
    let mut ended_after = None;
    for quantum in 1..=10 {
        let q = if quantum == 3 || quantum == 7 {
            let _guard = ctx.lock();
            audio.render()
        } else {
            audio.render()
        };

        assert!(ctx.is_alive(a.id()), "A gone after quantum {}", quantum);
        assert_eq!(ctx.deleted_count(), 0);
        if quantum <= 9 {
            assert!(q.peak > 0.0, "quantum {} was silent", quantum);
        } else {
            assert_eq!(q.peak, 0.0);
        }
        if quantum < 10 {
            assert_eq!(ctx.active_source_count(), 1, "released early at quantum {}", quantum);
        }

        for event in ctx.process_control_tasks() {
            if let ContextEvent::SourceEnded(id) = event {
                assert_eq!(id, a.id());
                ended_after = Some(quantum);
            }
        }
    }

    assert_eq!(ended_after, Some(10));
    assert_eq!(ctx.active_source_count(), 0);
    assert_eq!(a.playback_state(), PlaybackState::Finished);
    assert!(ctx.is_alive(a.id()));
}

#[test]
fn finished_sources_past_capacity_end_on_a_later_quantum() {
    let options = ContextOptions::default().with_node_capacity(2);
    let (ctx, renderer) = AudioContext::detached(options).unwrap();
    let mut sources: Vec<ConstantSourceNode> =
        (0..3).map(|_| ConstantSourceNode::new(&ctx).unwrap()).collect();
    for source in sources.iter_mut() {
        ctx.connect(&*source, &ctx.destination()).unwrap();
        source.start(0.0).unwrap();
        source.stop(128.0 / 48_000.0).unwrap();
    }
    ctx.resume().unwrap();

    let audio = AudioThread::spawn(renderer);
    audio.render();
    {
        // all three finish while post-render cannot run
        let _guard = ctx.lock();
        audio.render_n(3);
    }

    let mut ended = Vec::new();
    for _ in 0..4 {
        audio.render();
        for event in ctx.process_control_tasks() {
            if let ContextEvent::SourceEnded(id) = event {
                ended.push(id);
            }
        }
    }
    ended.sort();
    let mut expected: Vec<_> = sources.iter().map(|s| s.id()).collect();
    expected.sort();
    assert_eq!(ended, expected);
    assert_eq!(ctx.active_source_count(), 0);
}

#[test]
fn held_lock_defers_adoption_not_rendering() {
    init_tracing();
    let (ctx, renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
    ctx.resume().unwrap();
    let audio = AudioThread::spawn(renderer);
    assert_eq!(audio.render().live_nodes, 1);

    let mut source = ConstantSourceNode::new(&ctx).unwrap();
    ctx.connect(&source, &ctx.destination()).unwrap();
    source.start(0.0).unwrap();
    {
        let _guard = ctx.lock();
        let q = audio.render();
        assert_eq!(q.live_nodes, 1);
        assert_eq!(q.peak, 0.0);
    }
    let q = audio.render();
    assert_eq!(q.live_nodes, 2);
    assert_eq!(q.first_sample, 1.0);
}

#[test]
fn suspended_context_renders_silence_and_holds_the_clock() {
    let (ctx, renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
    let mut source = ConstantSourceNode::new(&ctx).unwrap();
    ctx.connect(&source, &ctx.destination()).unwrap();
    source.start(0.0).unwrap();
    let audio = AudioThread::spawn(renderer);

    let q = audio.render();
    assert_eq!(q.peak, 0.0);
    assert_eq!(q.frame, 0);

    ctx.resume().unwrap();
    assert_eq!(audio.render().frame, 64);
    assert!(ctx.process_control_tasks().contains(&ContextEvent::Resumed));

    ctx.suspend().unwrap();
    let q = audio.render();
    assert_eq!(q.peak, 0.0);
    assert_eq!(q.frame, 64);
    assert_eq!(ctx.current_frame(), 64);
}

#[test]
fn feedback_cycle_reads_silence_on_the_back_edge() {
    let (ctx, renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
    let mut source = ConstantSourceNode::new(&ctx).unwrap();
    let a = GainNode::new(&ctx).unwrap();
    let b = GainNode::new(&ctx).unwrap();
    ctx.connect(&source, &a).unwrap();
    ctx.connect(&a, &b).unwrap();
    ctx.connect(&b, &a).unwrap();
    ctx.connect(&b, &ctx.destination()).unwrap();
    source.start(0.0).unwrap();
    ctx.resume().unwrap();

    let audio = AudioThread::spawn(renderer);
    for _ in 0..4 {
        assert_eq!(audio.render().first_sample, 1.0);
    }
}

#[test]
fn meter_is_pulled_only_while_nothing_reads_it() {
    let (ctx, renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
    let mut source = ConstantSourceNode::new(&ctx).unwrap();
    let meter = MeterNode::new(&ctx).unwrap();
    ctx.connect(&source, &meter).unwrap();
    source.start(0.0).unwrap();
    ctx.resume().unwrap();

    let audio = AudioThread::spawn(renderer);
    assert_eq!(audio.render().peak, 0.0);
    assert_eq!(meter.frames_processed(), 64);

    ctx.connect(&meter, &ctx.destination()).unwrap();
    assert_eq!(audio.render().peak, 1.0);
    // once through the destination, never twice in a quantum
    assert_eq!(meter.frames_processed(), 128);
}
