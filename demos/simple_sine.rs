//! Play a sine sweep on the default output device
//!
//! Run with: cargo run --example simple_sine --features cpal_sink

use std::thread::sleep;
use std::time::Duration;

use rendergraph::nodes::{GainNode, OscillatorNode};
use rendergraph::{AudioContext, BaseAudioContext, ContextEvent, ContextOptions};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut ctx = AudioContext::new(ContextOptions::default())?;
    println!("{} Hz, {} channels", ctx.sample_rate(), ctx.channels());

    let mut osc = OscillatorNode::new(&ctx)?;
    let volume = GainNode::new(&ctx)?;
    volume.gain().set_value(0.2);
    ctx.connect(&osc, &volume)?;
    ctx.connect(&volume, &ctx.destination())?;

    osc.frequency().set_value_at_time(220.0, 0.0)?;
    osc.frequency().exponential_ramp_to_value_at_time(880.0, 2.0)?;
    volume.gain().linear_ramp_to_value_at_time(0.0, 3.0)?;
    osc.start(0.0)?;
    osc.stop(3.0)?;
    ctx.resume()?;

    // the control thread owes the audio thread a regular drain
    let mut ended = false;
    while !ended {
        for event in ctx.process_control_tasks() {
            if let ContextEvent::SourceEnded(id) = event {
                println!("{:?} ended at {:.2}s", id, ctx.current_time());
                ended = true;
            }
        }
        sleep(Duration::from_millis(10));
    }

    ctx.close()?;
    Ok(())
}
