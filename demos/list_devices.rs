// Basic device discovery and connection example
//
// This example shows how to find serial ports, probe each one for a
// LogicSniffer and print what the device reports about itself.

use sump_rs::{list_ports, LogicSniffer, DEFAULT_BAUD_RATE};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("LogicSniffer Device Discovery Example");
    println!("=====================================\n");

    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found. Please connect a device and try again.");
        return Ok(());
    }

    println!("Found {} serial port(s):", ports.len());
    for (i, port) in ports.iter().enumerate() {
        println!("  {}. {}", i + 1, port);
    }
    println!();

    for port in &ports {
        println!("Probing {port} ...");
        let mut sniffer = match LogicSniffer::attach(port, DEFAULT_BAUD_RATE) {
            Ok(sniffer) => sniffer,
            Err(err) => {
                println!("  could not open: {err}");
                continue;
            }
        };

        match sniffer.detect_device() {
            Ok(()) => {
                let metadata = sniffer.read_metadata()?;
                println!("  found: {}", metadata.device_name().unwrap_or("unnamed device"));
                if let Some(fpga) = metadata.fpga_version() {
                    println!("  FPGA version: {fpga}");
                }
                println!(
                    "  sample memory: {} samples, {} probes",
                    metadata.sample_memory_depth(512),
                    metadata.probe_count(32),
                );
            }
            Err(err) => println!("  no analyzer here: {err}"),
        }
    }

    Ok(())
}
