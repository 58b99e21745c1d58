// Triggered capture example
//
// Arms a parallel trigger on the selected channel, waits for the device to
// fire and writes a summary of the reconstructed trace to stdout.

use clap::Parser;
use sump_rs::{LogicSniffer, DEFAULT_BAUD_RATE};

#[derive(Parser, Debug)]
#[command(about = "Capture a trace from a SUMP logic analyzer")]
struct Args {
    /// Serial port the analyzer is attached to
    port: String,

    /// Baud rate of the serial link
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 1_000_000)]
    rate: u32,

    /// Number of samples to capture
    #[arg(long, default_value_t = 4096)]
    samples: usize,

    /// Channel to trigger on (rising level); capture free-runs when omitted
    #[arg(long)]
    trigger_channel: Option<u8>,

    /// Enable hardware run-length encoding
    #[arg(long)]
    rle: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut sniffer = LogicSniffer::attach(&args.port, args.baud)?;

    let config = sniffer.config_mut();
    config.set_sample_rate(args.rate)?;
    config.set_sample_count(args.samples)?;
    config.set_rle_enabled(args.rle);
    if let Some(channel) = args.trigger_channel {
        let mask = 1u32 << channel;
        config.set_trigger_enabled(true);
        config.set_parallel_trigger(0, mask, mask, 0, 0, true)?;
        println!("Waiting for channel {channel} to go high ...");
    }

    let trace = sniffer.run(|percent| {
        eprint!("\rReading samples: {percent:3}%");
    })?;
    eprintln!();

    println!("Captured {} samples", trace.len());
    if let Some(rate) = trace.sample_rate {
        println!("Sample rate: {rate} Hz");
    }
    if let Some(trigger) = trace.trigger_index {
        println!("Trigger fired at sample {trigger}");
    }
    println!("Trace spans {} sample-clock ticks", trace.absolute_length);

    let df = trace.to_channel_dataframe()?;
    println!("{df}");

    Ok(())
}
