//! # SUMP RS
//!
//! A Rust library for driving SUMP / OpenBench LogicSniffer class logic
//! analyzers over a serial port.
//!
//! This library speaks the SUMP binary protocol: it detects the device,
//! reads its capability metadata, programs the trigger/clock/sample
//! registers and retrieves the captured samples, reconstructing a
//! time-ordered trace, including run-length decoding of compressed
//! captures.
//!
//! ## Features
//!
//! - **Device detection**: identify handshake with firmware-version checking
//! - **Trigger configuration**: four sequential stages, parallel or serial,
//!   with delay, arm level and capture control per stage
//! - **Full capture pipeline**: clock source, sample rate and channel
//!   selection down to the raw register writes the hardware expects
//! - **RLE decoding**: recovers the variable-rate timeline from
//!   hardware-compressed streams
//! - **Cooperative cancellation**: stop an in-flight capture from another
//!   thread without tearing down the session
//! - **DataFrame output**: uses `polars` for efficient analysis of captured
//!   traces
//!
//! ## Examples
//!
//! ### Capture with a trigger
//!
//! ```rust,no_run
//! use sump_rs::{LogicSniffer, DEFAULT_BAUD_RATE};
//!
//! let mut sniffer = LogicSniffer::attach("/dev/ttyACM0", DEFAULT_BAUD_RATE)?;
//!
//! let config = sniffer.config_mut();
//! config.set_sample_rate(1_000_000)?;
//! config.set_sample_count(4096)?;
//! config.set_trigger_enabled(true);
//! // Fire when channel 0 goes high.
//! config.set_parallel_trigger(0, 0x1, 0x1, 0, 0, true)?;
//!
//! let trace = sniffer.run(|percent| eprint!("\r{percent}%"))?;
//! println!("Captured {} samples", trace.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Stopping a capture from another thread
//!
//! ```rust,no_run
//! use sump_rs::{LogicSniffer, SnifferError, DEFAULT_BAUD_RATE};
//! use std::time::Duration;
//!
//! let mut sniffer = LogicSniffer::attach("/dev/ttyACM0", DEFAULT_BAUD_RATE)?;
//! let stop = sniffer.stop_handle();
//!
//! let worker = std::thread::spawn(move || sniffer.run(|_| {}));
//!
//! std::thread::sleep(Duration::from_secs(5));
//! stop.stop(); // observed within one read-timeout interval
//!
//! match worker.join().unwrap() {
//!     Ok(trace) => println!("Captured {} samples", trace.len()),
//!     Err(SnifferError::Cancelled) => println!("Capture cancelled"),
//!     Err(err) => eprintln!("Capture failed: {err}"),
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Device discovery
//!
//! ```rust,no_run
//! use sump_rs::{list_ports, LogicSniffer, DEFAULT_BAUD_RATE};
//!
//! for port in list_ports()? {
//!     let mut sniffer = LogicSniffer::attach(&port, DEFAULT_BAUD_RATE)?;
//!     if sniffer.detect_device().is_ok() {
//!         let metadata = sniffer.read_metadata()?;
//!         println!("{port}: {}", metadata.device_name().unwrap_or("unnamed"));
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod capture;
pub mod command;
pub mod config;
pub mod device;
pub mod metadata;
pub mod transport;

// Re-export the main types for convenience
pub use capture::{CaptureResult, RLE_COUNT_FLAG};

pub use config::{
    AcquisitionConfig, ClockSource, ConfigError, TriggerStage, CLOCK_RATE, MAX_SAMPLE_COUNT,
    MIN_SAMPLE_COUNT, TRIGGER_STAGES,
};

pub use device::{LogicSniffer, SnifferError, StopHandle};

pub use metadata::{DeviceMetadata, MetadataValue};

pub use transport::{
    list_ports, SerialTransport, Transport, TransportError, DEFAULT_BAUD_RATE,
};
