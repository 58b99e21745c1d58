//! Device session and acquisition engine.
//!
//! [`LogicSniffer`] owns the transport and the acquisition configuration,
//! detects the device, fetches its metadata and drives the capture state
//! machine: configure, arm, wait for the trigger, drain the sample stream and
//! reconstruct the trace.

use crate::capture::{decode_plain, decode_rle, CaptureResult};
use crate::command::{self, MetadataRecord};
use crate::config::{AcquisitionConfig, ClockSource, ConfigError};
use crate::metadata::{DeviceMetadata, MetadataValue};
use crate::transport::{SerialTransport, Transport, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identifier of the original SUMP firmware ("SLA0"), no longer supported.
const SLA_V0: u32 = 0x534c_4130;
/// Identifier of the current firmware generation ("SLA1").
const SLA_V1: u32 = 0x534c_4131;

const DETECT_ATTEMPTS: usize = 3;
// Worst case the device sits mid-way through a long command and swallows the
// first four bytes as payload; the fifth reset always gets through.
const RESET_REPEAT: usize = 5;

// Wait budget for one protocol word (id, metadata value).
const WORD_WAIT: Duration = Duration::from_millis(100);
// Wait budget for one sample; also bounds how long a cancel can take to be
// observed while waiting for the trigger.
const SAMPLE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum SnifferError {
    #[error("Failed to open {port}: {source}")]
    Connection {
        port: String,
        source: TransportError,
    },

    #[error("Serial transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No supported device found")]
    DeviceNotFound,

    #[error("Device firmware is obsolete, please upgrade it")]
    ObsoleteFirmware,

    #[error("Not attached to a device")]
    NotAttached,

    #[error("A capture is already in flight on this session")]
    CaptureInProgress,

    #[error("Capture cancelled")]
    Cancelled,

    #[error("Capture aborted mid-stream: {0}")]
    Aborted(TransportError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Cloneable handle that stops an in-flight capture from another thread.
///
/// Stopping is cooperative: the engine checks the flag before every sample
/// read, so a stop is observed within one read-timeout interval.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the running capture to stop at the next read boundary.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// A session with a SUMP / OpenBench LogicSniffer class logic analyzer.
#[derive(Debug)]
pub struct LogicSniffer<T: Transport = SerialTransport> {
    transport: Option<T>,
    config: AcquisitionConfig,
    running: Arc<AtomicBool>,
}

impl LogicSniffer<SerialTransport> {
    /// Attach to the analyzer on the given serial port.
    pub fn attach(port: &str, baud_rate: u32) -> Result<Self, SnifferError> {
        let transport =
            SerialTransport::open(port, baud_rate).map_err(|source| SnifferError::Connection {
                port: port.to_string(),
                source,
            })?;
        log::info!("Attached to {port} @ {baud_rate}bps");
        Ok(Self::with_transport(transport))
    }
}

impl<T: Transport> LogicSniffer<T> {
    /// Build a session over an already opened transport.
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport: Some(transport),
            config: AcquisitionConfig::default(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Mutable access to the acquisition configuration. The borrow checker
    /// serializes this against [`Self::run`], which keeps the configuration
    /// frozen for the duration of a capture.
    pub fn config_mut(&mut self) -> &mut AcquisitionConfig {
        &mut self.config
    }

    /// Handle for stopping a capture from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Detach from the device, resetting it on the way out. Teardown I/O
    /// errors are swallowed; the port is released regardless.
    pub fn detach(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            for _ in 0..RESET_REPEAT {
                if let Err(err) = command::send_short(&mut transport, command::CMD_RESET) {
                    log::debug!("Reset during detach failed: {err}");
                    break;
                }
            }
            // Dropping the transport closes the port.
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Probe for a supported device: flush stale input, reset, identify and
    /// check the reported magic. The whole sequence is retried a few times
    /// because the first exchange after plugging in is often garbled.
    pub fn detect_device(&mut self) -> Result<(), SnifferError> {
        let transport = self.transport.as_mut().ok_or(SnifferError::NotAttached)?;

        let mut id = None;
        for attempt in 1..=DETECT_ATTEMPTS {
            transport.flush_input()?;
            for _ in 0..RESET_REPEAT {
                command::send_short(transport, command::CMD_RESET)?;
            }
            command::send_short(transport, command::CMD_ID)?;

            match command::read_u32_le(transport, WORD_WAIT) {
                Ok(value) => {
                    id = Some(value);
                    if value == SLA_V0 || value == SLA_V1 {
                        break;
                    }
                    log::info!("Found unknown device (0x{value:08x})");
                }
                Err(err) => {
                    log::debug!("No identify response on attempt {attempt}: {err}");
                }
            }
        }

        match id {
            Some(SLA_V1) => {
                log::info!("Found SUMP logic analyzer / LogicSniffer (0x{SLA_V1:08x})");
                Ok(())
            }
            Some(SLA_V0) => Err(SnifferError::ObsoleteFirmware),
            _ => Err(SnifferError::DeviceNotFound),
        }
    }

    /// Fetch the device metadata. Retrieval is best-effort: a read failure
    /// mid-stream ends the record stream instead of failing the call.
    pub fn read_metadata(&mut self) -> Result<DeviceMetadata, SnifferError> {
        let transport = self.transport.as_mut().ok_or(SnifferError::NotAttached)?;

        transport.flush_input()?;
        command::send_short(transport, command::CMD_METADATA)?;

        let mut metadata = DeviceMetadata::default();
        loop {
            match command::read_metadata_record(transport, WORD_WAIT) {
                Ok(MetadataRecord::End) => break,
                Ok(MetadataRecord::Text { key, value }) => {
                    log::debug!("Read {key:#04x} -> \"{value}\"");
                    metadata.insert(key, MetadataValue::Text(value));
                }
                Ok(MetadataRecord::Int { key, value }) => {
                    log::debug!("Read {key:#04x} -> {value} (32-bit)");
                    metadata.insert(key, MetadataValue::Int(value));
                }
                Ok(MetadataRecord::Byte { key, value }) => {
                    log::debug!("Read {key:#04x} -> {value} (8-bit)");
                    metadata.insert(key, MetadataValue::Byte(value));
                }
                Ok(MetadataRecord::Unknown { key }) => {
                    log::info!("Ignoring metadata key {key:#04x} of unknown type");
                }
                Err(err) => {
                    log::debug!("Metadata stream ended: {err}");
                    break;
                }
            }
        }

        Ok(metadata)
    }

    /// Run one acquisition and reconstruct the captured trace.
    ///
    /// Blocks until the device has triggered and delivered every sample, so
    /// call it from a worker thread; `progress` is invoked from that thread
    /// with a 0..=100 percentage and is guaranteed a final 100 even on early
    /// exit. A concurrent [`StopHandle::stop`] surfaces as
    /// [`SnifferError::Cancelled`], never as an I/O failure.
    pub fn run<F: FnMut(u8)>(&mut self, mut progress: F) -> Result<CaptureResult, SnifferError> {
        if self.transport.is_none() {
            return Err(SnifferError::NotAttached);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SnifferError::CaptureInProgress);
        }

        let result = self.run_acquisition(&mut progress);

        progress(100);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_acquisition<F: FnMut(u8)>(
        &mut self,
        progress: &mut F,
    ) -> Result<CaptureResult, SnifferError> {
        // Snapshot the configuration so nothing can mutate it mid-run.
        let config = self.config.clone();

        self.detect_device()?;
        let metadata = self.read_metadata()?;
        log::debug!("Device metadata:\n{metadata}");

        // Size the capture against true device capability.
        let device_depth = metadata.sample_memory_depth(config.sample_count());
        let read_counter = config.sample_count().min(device_depth) as u32;
        let stop_counter = (f64::from(read_counter) * config.ratio()) as u32;

        let demux = config.is_demux_enabled() && config.clock_source() == ClockSource::Internal;
        let (channel_count, sample_words) = if demux {
            // Demultiplexing disables the upper two channel groups.
            (metadata.probe_count(16), (read_counter & 0xf_fff8) as usize)
        } else {
            (metadata.probe_count(32), (read_counter & 0xf_fffc) as usize)
        };

        let groups = config.enabled_groups();
        let group_count = channel_count.div_ceil(8).min(4);
        let bytes_per_sample = groups.iter().take(group_count).filter(|&&g| g).count();
        if bytes_per_sample == 0 || sample_words == 0 {
            return Err(SnifferError::Config(ConfigError::NoChannelsEnabled));
        }

        log::debug!(
            "Starting capture: {sample_words} samples x {channel_count} channels, stop at {stop_counter}"
        );

        let transport = self.transport.as_mut().ok_or(SnifferError::NotAttached)?;
        for (opcode, value) in config.register_writes(stop_counter, read_counter) {
            command::send_long(transport, opcode, value)?;
        }
        command::send_short(transport, command::CMD_RUN)?;

        let mut buffer = vec![0u32; sample_words];

        // The first sample only arrives once the trigger has fired, which can
        // take forever; a read timeout just means "still waiting".
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(SnifferError::Cancelled);
            }
            match read_sample(transport, &groups, group_count) {
                Ok(sample) => {
                    buffer[sample_words - 1] = sample;
                    break;
                }
                Err(err) if err.is_timeout() => {}
                Err(err) => return Err(err.into()),
            }
        }

        // The remaining samples stream out newest first; fill the buffer from
        // the tail so it ends up in chronological order. From here on a
        // timeout is fatal for the run.
        for i in (0..sample_words - 1).rev() {
            if !self.running.load(Ordering::SeqCst) {
                return Err(SnifferError::Cancelled);
            }
            buffer[i] = read_sample(transport, &groups, group_count)
                .map_err(SnifferError::Aborted)?;
            progress((100 - (100 * i) / sample_words) as u8);
        }

        let decoded = if config.is_rle_enabled() {
            decode_rle(&buffer, stop_counter, config.is_trigger_enabled())
        } else {
            decode_plain(
                &buffer,
                read_counter,
                stop_counter,
                config.divider(),
                demux,
                config.is_trigger_enabled(),
            )
        };

        Ok(CaptureResult {
            samples: decoded.samples,
            timestamps: decoded.timestamps,
            trigger_index: decoded.trigger_index,
            sample_rate: config.sample_rate(),
            channel_count,
            enabled_channels: config.enabled_channels(),
            absolute_length: decoded.absolute_length,
        })
    }
}

impl<T: Transport> Drop for LogicSniffer<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Assemble one 32-bit sample word: one byte per enabled 8-channel group,
/// shifted into the group's byte position. Disabled groups contribute a zero
/// byte without consuming a read. All enabled group bytes are awaited before
/// any is consumed, so a timeout never leaves a torn sample behind.
fn read_sample<T: Transport>(
    transport: &mut T,
    groups: &[bool; 4],
    group_count: usize,
) -> Result<u32, TransportError> {
    let needed = groups.iter().take(group_count).filter(|&&g| g).count();
    let mut bytes = [0u8; 4];
    transport.read_exact(&mut bytes[..needed], SAMPLE_WAIT)?;

    let mut value = 0u32;
    let mut next = 0;
    for (i, enabled) in groups.iter().take(group_count).enumerate() {
        if *enabled {
            value |= u32::from(bytes[next]) << (8 * i);
            next += 1;
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;
    use std::thread;
    use std::time::Duration;

    // "SLA1" / "SLA0" magics as they appear on the wire, LSB first.
    const SLA1_BYTES: [u8; 4] = [0x31, 0x41, 0x4c, 0x53];
    const SLA0_BYTES: [u8; 4] = [0x30, 0x41, 0x4c, 0x53];

    fn count_opcode(writes: &[u8], opcode: u8) -> usize {
        writes.iter().filter(|&&b| b == opcode).count()
    }

    #[test]
    fn detect_succeeds_on_current_firmware_id() {
        let mut sniffer = LogicSniffer::with_transport(MockTransport::new(&SLA1_BYTES));
        sniffer.detect_device().unwrap();

        let mock = sniffer.transport.as_ref().unwrap();
        // One flush, five resets and one identify for the single attempt.
        assert_eq!(mock.flushes, 1);
        assert_eq!(mock.writes, vec![0, 0, 0, 0, 0, command::CMD_ID]);
    }

    #[test]
    fn detect_reports_not_found_after_exactly_three_attempts() {
        let mut sniffer = LogicSniffer::with_transport(MockTransport::new(&[0u8; 12]));
        assert!(matches!(
            sniffer.detect_device(),
            Err(SnifferError::DeviceNotFound)
        ));

        let mock = sniffer.transport.as_ref().unwrap();
        assert_eq!(count_opcode(&mock.writes, command::CMD_ID), 3);
        assert_eq!(mock.flushes, 3);
    }

    #[test]
    fn detect_distinguishes_obsolete_firmware() {
        let mut sniffer = LogicSniffer::with_transport(MockTransport::new(&SLA0_BYTES));
        assert!(matches!(
            sniffer.detect_device(),
            Err(SnifferError::ObsoleteFirmware)
        ));
    }

    #[test]
    fn metadata_read_failure_is_end_of_stream() {
        let mut stream = vec![0x01];
        stream.extend_from_slice(b"Logic Sniffer v1.01\0");
        stream.extend_from_slice(&[0x21, 0x00, 0x00, 0x60, 0x00]);
        stream.extend_from_slice(&[0x40, 0x20]);
        // No terminator: the next read times out.

        let mut sniffer = LogicSniffer::with_transport(MockTransport::new(&stream));
        let metadata = sniffer.read_metadata().unwrap();

        assert_eq!(metadata.device_name(), Some("Logic Sniffer v1.01"));
        assert_eq!(metadata.sample_memory_depth(512), 0x6000);
        assert_eq!(metadata.probe_count(8), 32);
    }

    /// Script a full successful exchange: identify, empty metadata, then the
    /// sample stream (newest first) for a 16-sample, 32-channel capture.
    fn scripted_run_transport(sample_words: u32) -> MockTransport {
        let mut stream = Vec::new();
        stream.extend_from_slice(&SLA1_BYTES);
        stream.push(0x00); // metadata: empty
        for word in 0..sample_words {
            stream.extend_from_slice(&word.to_le_bytes());
        }
        MockTransport::new(&stream)
    }

    #[test]
    fn run_reverses_the_sample_stream_into_chronological_order() {
        let mut sniffer = LogicSniffer::with_transport(scripted_run_transport(16));
        sniffer.config_mut().set_sample_count(16).unwrap();

        let mut percentages = Vec::new();
        let result = sniffer.run(|p| percentages.push(p)).unwrap();

        // Stream word 0 was read first and is therefore the newest sample.
        let expected: Vec<u32> = (0..16).rev().collect();
        assert_eq!(result.samples, expected);
        assert_eq!(result.timestamps, (0..16).collect::<Vec<u64>>());
        assert_eq!(result.trigger_index, None);
        assert_eq!(result.sample_rate, Some(100_000_000));
        assert_eq!(result.channel_count, 32);
        assert_eq!(result.absolute_length, 16);

        assert_eq!(percentages.last(), Some(&100));
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
        assert!(!sniffer.is_running());
    }

    #[test]
    fn run_sends_configuration_before_arming() {
        let mut sniffer = LogicSniffer::with_transport(scripted_run_transport(16));
        sniffer.config_mut().set_sample_count(16).unwrap();
        sniffer.run(|_| {}).unwrap();

        let mock = sniffer.transport.as_ref().unwrap();
        // The final two writes are the flags register and the run command.
        let n = mock.writes.len();
        assert_eq!(mock.writes[n - 1], command::CMD_RUN);
        assert_eq!(mock.writes[n - 6], command::SET_FLAGS);
    }

    #[test]
    fn run_skips_disabled_groups_without_consuming_reads() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&SLA1_BYTES);
        stream.push(0x00);
        // Only group 0 enabled: one byte per sample.
        stream.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);

        let mut sniffer = LogicSniffer::with_transport(MockTransport::new(&stream));
        sniffer.config_mut().set_sample_count(4).unwrap();
        sniffer.config_mut().set_enabled_channels(0x0000_00ff);

        let result = sniffer.run(|_| {}).unwrap();
        assert_eq!(result.samples, vec![0xdd, 0xcc, 0xbb, 0xaa]);
    }

    #[test]
    fn run_decodes_rle_when_enabled() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&SLA1_BYTES);
        stream.push(0x00);
        // Chronological target: [5, count 3, 7]; streamed newest first, plus
        // a fourth word to satisfy the 4-sample alignment.
        for word in [8u32, 7, 0x8000_0003, 5] {
            stream.extend_from_slice(&word.to_le_bytes());
        }

        let mut sniffer = LogicSniffer::with_transport(MockTransport::new(&stream));
        sniffer.config_mut().set_sample_count(4).unwrap();
        sniffer.config_mut().set_rle_enabled(true);

        let result = sniffer.run(|_| {}).unwrap();
        assert_eq!(result.samples, vec![5, 7, 8]);
        assert_eq!(result.timestamps, vec![0, 4, 5]);
        assert_eq!(result.absolute_length, 6);
    }

    #[test]
    fn cancelling_while_waiting_for_the_trigger_reports_cancelled() {
        // Identify and metadata answered, but no sample ever arrives.
        let mut stream = Vec::new();
        stream.extend_from_slice(&SLA1_BYTES);
        stream.push(0x00);

        let mut sniffer = LogicSniffer::with_transport(MockTransport::new(&stream));
        sniffer.config_mut().set_sample_count(16).unwrap();
        let handle = sniffer.stop_handle();

        let worker = thread::spawn(move || sniffer.run(|_| {}));
        thread::sleep(Duration::from_millis(30));
        assert!(handle.is_running());
        handle.stop();

        let result = worker.join().unwrap();
        assert!(matches!(result, Err(SnifferError::Cancelled)));
        assert!(!handle.is_running());
    }

    #[test]
    fn timeout_mid_drain_aborts_the_run() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&SLA1_BYTES);
        stream.push(0x00);
        // First sample arrives, then the device goes silent.
        stream.extend_from_slice(&1u32.to_le_bytes());

        let mut sniffer = LogicSniffer::with_transport(MockTransport::new(&stream));
        sniffer.config_mut().set_sample_count(16).unwrap();

        let result = sniffer.run(|_| {});
        assert!(matches!(result, Err(SnifferError::Aborted(_))));
        // The session survives a failed run.
        assert!(sniffer.is_attached());
        assert!(!sniffer.is_running());
    }

    #[test]
    fn run_requires_at_least_one_enabled_group() {
        let mut sniffer = LogicSniffer::with_transport(scripted_run_transport(16));
        sniffer.config_mut().set_enabled_channels(0);

        let result = sniffer.run(|_| {});
        assert!(matches!(
            result,
            Err(SnifferError::Config(ConfigError::NoChannelsEnabled))
        ));
    }

    #[test]
    fn detach_resets_the_device_and_releases_the_port() {
        let mut sniffer = LogicSniffer::with_transport(MockTransport::new(&[]));
        sniffer.detach();
        assert!(!sniffer.is_attached());
        assert!(matches!(
            sniffer.detect_device(),
            Err(SnifferError::NotAttached)
        ));
    }
}
