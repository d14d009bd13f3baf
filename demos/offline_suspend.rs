//! Render offline, editing the graph at sample-accurate checkpoints
//!
//! Run with: cargo run --example offline_suspend

use rendergraph::nodes::{OscillatorNode, PannerNode, Waveform};
use rendergraph::positional::Vec3;
use rendergraph::{BaseAudioContext, ContextEvent, OfflineAudioContext};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let sample_rate = 48_000;
    let mut ctx = OfflineAudioContext::new(2, sample_rate as usize * 2, sample_rate)?;
    let mut osc = OscillatorNode::with_waveform(&ctx, Waveform::Triangle)?;
    let panner = PannerNode::new(&ctx)?;
    ctx.connect(&osc, &panner)?;
    ctx.connect(&panner, &ctx.destination())?;
    osc.start(0.0)?;

    // hop the source around the listener every half second
    let spots = [
        Vec3::new(-1.0, 0.0, 0.0),
        Vec3::new(0.0, 0.0, -1.0),
        Vec3::new(1.0, 0.0, 0.0),
    ];
    for i in 1..=spots.len() {
        ctx.suspend(i as f64 * 0.5)?;
    }
    panner.set_position(Vec3::new(0.0, 0.0, 1.0))?;

    ctx.start_rendering()?;
    let mut spot = 0;
    let buffer = loop {
        match ctx.next_event() {
            Some(ContextEvent::SuspendedAt { frame }) => {
                panner.set_position(spots[spot])?;
                println!("frame {:>6}: moved to {:?}", frame, spots[spot]);
                spot += 1;
                ctx.resume()?;
            }
            Some(ContextEvent::RenderComplete(buffer)) => break buffer,
            Some(_) => {}
            None => return Err("rendering ended without a result".into()),
        }
    };

    for (ch, name) in ["left", "right"].iter().enumerate() {
        let peak = buffer.channel(ch).iter().fold(0.0f32, |p, s| p.max(s.abs()));
        println!("{:>5}: peak {:.3}", name, peak);
    }
    Ok(())
}
