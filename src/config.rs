//! Acquisition configuration and register generation.
//!
//! [`AcquisitionConfig`] holds everything the analyzer needs to be told before
//! a run: clock source, enabled channels, trigger stages and feature flags.
//! [`AcquisitionConfig::register_writes`] turns a configuration snapshot into
//! the exact sequence of register writes the hardware expects.

use crate::command::{
    SET_DIVIDER, SET_FLAGS, SET_SIZE, SET_TRIGGER_CONFIG, SET_TRIGGER_MASK, SET_TRIGGER_VALUE,
};

/// Base clock of the sampling hardware in Hz.
pub const CLOCK_RATE: u32 = 100_000_000;

/// Number of sequential trigger stages the hardware provides.
pub const TRIGGER_STAGES: usize = 4;

/// Smallest supported capture depth in samples.
pub const MIN_SAMPLE_COUNT: usize = 4;
/// Largest supported capture depth in samples.
pub const MAX_SAMPLE_COUNT: usize = 256 * 1024;

// Capture flag bits.
const FLAG_DEMUX: u32 = 0x0000_0001;
const FLAG_FILTER: u32 = 0x0000_0002;
const FLAG_EXTERNAL: u32 = 0x0000_0040;
const FLAG_INVERTED: u32 = 0x0000_0080;
const FLAG_RLE: u32 = 0x0000_0100;
const FLAG_NUMBER_SCHEME: u32 = 0x0000_0200;
const FLAG_TEST_MODE: u32 = 0x0000_0400;

// Trigger configuration word layout.
const TRIGGER_DELAY_MASK: u32 = 0x0000_ffff;
const TRIGGER_LEVEL_MASK: u32 = 0x0003_0000;
const TRIGGER_CHANNEL_MASK: u32 = 0x01f0_0000;
const TRIGGER_SERIAL: u32 = 0x0400_0000;
/// Trigger stage fires the capture instead of only raising the arm level.
pub const TRIGGER_CAPTURE: u32 = 0x0800_0000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Sample count {0} out of range ({MIN_SAMPLE_COUNT}..={MAX_SAMPLE_COUNT})")]
    SampleCountOutOfRange(usize),

    #[error("Trigger ratio {0} out of range (0.0..=1.0)")]
    RatioOutOfRange(f64),

    #[error("Sample rate {0} Hz out of range (1..={max} Hz)", max = 2 * CLOCK_RATE)]
    RateOutOfRange(u32),

    #[error("Trigger stage {0} out of range (0..={max})", max = TRIGGER_STAGES - 1)]
    StageOutOfRange(usize),

    #[error("Arm level {0} out of range (0..=3)")]
    LevelOutOfRange(u8),

    #[error("Serial trigger channel {0} out of range (0..=31)")]
    ChannelOutOfRange(u8),

    #[error("No channel groups enabled")]
    NoChannelsEnabled,
}

/// Where the sampling clock comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// The internal 100 MHz base clock.
    #[default]
    Internal,
    /// External clock, sampling on the rising edge.
    ExternalRising,
    /// External clock, sampling on the falling edge.
    ExternalFalling,
}

/// One of the four sequential trigger stages.
///
/// A firing stage raises the arm level by one; a stage marked
/// `start_capture` starts the capture instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStage {
    mask: u32,
    value: u32,
    delay: u16,
    level: u8,
    channel: u8,
    serial: bool,
    start_capture: bool,
}

impl TriggerStage {
    /// Channel mask as it will be written to the device.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Match value as it will be written to the device.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Pack the stage into the hardware trigger configuration word.
    fn config_word(&self) -> u32 {
        let mut word = u32::from(self.delay) & TRIGGER_DELAY_MASK;
        word |= (u32::from(self.level) << 16) & TRIGGER_LEVEL_MASK;
        if self.serial {
            word |= (u32::from(self.channel) << 20) & TRIGGER_CHANNEL_MASK;
            word |= TRIGGER_SERIAL;
        }
        if self.start_capture {
            word |= TRIGGER_CAPTURE;
        }
        word
    }
}

/// Mutable per-session acquisition state.
///
/// The running engine only ever sees a clone taken at run start, so the
/// configuration can never change underneath an in-flight capture.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    clock_source: ClockSource,
    enabled_channels: u32,
    enabled_groups: [bool; 4],
    demux: bool,
    filter: bool,
    trigger_enabled: bool,
    stages: [TriggerStage; TRIGGER_STAGES],
    rle: bool,
    alt_number_scheme: bool,
    test_mode: bool,
    divider: u32,
    ratio: f64,
    sample_count: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        let mut config = Self {
            clock_source: ClockSource::Internal,
            enabled_channels: 0,
            enabled_groups: [false; 4],
            demux: false,
            filter: false,
            trigger_enabled: false,
            stages: [TriggerStage::default(); TRIGGER_STAGES],
            rle: false,
            alt_number_scheme: false,
            test_mode: false,
            divider: 0,
            ratio: 0.5,
            sample_count: 512,
        };
        config.set_enabled_channels(u32::MAX);
        config
    }
}

impl AcquisitionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock_source(&self) -> ClockSource {
        self.clock_source
    }

    pub fn set_clock_source(&mut self, source: ClockSource) {
        self.clock_source = source;
    }

    /// Bitmask of enabled channel lines, LSB is channel 0.
    pub fn enabled_channels(&self) -> u32 {
        self.enabled_channels
    }

    /// Enable the channels set in `mask`. A whole 8-channel group is read
    /// from the device as soon as any of its channels is enabled.
    pub fn set_enabled_channels(&mut self, mask: u32) {
        self.enabled_channels = mask;
        for (i, group) in self.enabled_groups.iter_mut().enumerate() {
            *group = (mask >> (8 * i)) & 0xff != 0;
        }
    }

    /// One flag per 8-channel group, derived from the channel mask.
    pub fn enabled_groups(&self) -> [bool; 4] {
        self.enabled_groups
    }

    /// Channels usable in the current mode: demultiplexing halves them.
    pub fn available_channel_count(&self) -> usize {
        if self.demux && self.clock_source == ClockSource::Internal {
            16
        } else {
            32
        }
    }

    /// Highest requestable sample rate (double the base clock, demultiplexed).
    pub fn max_sample_rate(&self) -> u32 {
        2 * CLOCK_RATE
    }

    /// Request a sample rate. Rates above the base clock switch on
    /// demultiplexing; everything is adjusted to the nearest divisor of the
    /// base clock.
    pub fn set_sample_rate(&mut self, rate: u32) -> Result<(), ConfigError> {
        if rate == 0 || rate > self.max_sample_rate() {
            return Err(ConfigError::RateOutOfRange(rate));
        }
        if rate > CLOCK_RATE {
            self.demux = true;
            self.divider = (2 * CLOCK_RATE / rate) - 1;
        } else {
            self.demux = false;
            self.divider = (CLOCK_RATE / rate) - 1;
        }
        Ok(())
    }

    /// The effective sample rate in Hz, or `None` when clocked externally.
    pub fn sample_rate(&self) -> Option<u32> {
        match self.clock_source {
            ClockSource::Internal if self.demux => Some(2 * CLOCK_RATE / (self.divider + 1)),
            ClockSource::Internal => Some(CLOCK_RATE / (self.divider + 1)),
            _ => None,
        }
    }

    pub fn divider(&self) -> u32 {
        self.divider
    }

    pub fn is_demux_enabled(&self) -> bool {
        self.demux
    }

    /// The noise filter only works on the undivided internal clock.
    pub fn is_filter_available(&self) -> bool {
        !self.demux && self.clock_source == ClockSource::Internal
    }

    pub fn is_filter_enabled(&self) -> bool {
        self.filter
    }

    pub fn set_filter_enabled(&mut self, enable: bool) {
        self.filter = enable;
    }

    pub fn is_rle_enabled(&self) -> bool {
        self.rle
    }

    pub fn set_rle_enabled(&mut self, enable: bool) {
        self.rle = enable;
    }

    pub fn is_alt_number_scheme_enabled(&self) -> bool {
        self.alt_number_scheme
    }

    pub fn set_alt_number_scheme_enabled(&mut self, enable: bool) {
        self.alt_number_scheme = enable;
    }

    pub fn is_test_mode_enabled(&self) -> bool {
        self.test_mode
    }

    pub fn set_test_mode_enabled(&mut self, enable: bool) {
        self.test_mode = enable;
    }

    pub fn is_trigger_enabled(&self) -> bool {
        self.trigger_enabled
    }

    pub fn set_trigger_enabled(&mut self, enable: bool) {
        self.trigger_enabled = enable;
    }

    /// Fraction of the buffer captured after the trigger fires.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn set_ratio(&mut self, ratio: f64) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::RatioOutOfRange(ratio));
        }
        self.ratio = ratio;
        Ok(())
    }

    /// Requested capture depth in samples.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn set_sample_count(&mut self, count: usize) -> Result<(), ConfigError> {
        if !(MIN_SAMPLE_COUNT..=MAX_SAMPLE_COUNT).contains(&count) {
            return Err(ConfigError::SampleCountOutOfRange(count));
        }
        self.sample_count = count;
        Ok(())
    }

    pub fn trigger_stage(&self, stage: usize) -> Option<&TriggerStage> {
        self.stages.get(stage)
    }

    /// Configure a trigger stage in parallel mode: each mask/value bit
    /// watches one channel line.
    ///
    /// When demultiplexed, only the low 16 mask/value bits are meaningful and
    /// they are replicated into the upper half because each probe line
    /// carries two interleaved samples.
    pub fn set_parallel_trigger(
        &mut self,
        stage: usize,
        mask: u32,
        value: u32,
        level: u8,
        delay: u16,
        start_capture: bool,
    ) -> Result<(), ConfigError> {
        let (mask, value) = self.spread_for_demux(mask, value);
        let slot = self.stage_mut(stage)?;
        *slot = TriggerStage {
            mask,
            value,
            delay,
            level: check_level(level)?,
            channel: 0,
            serial: false,
            start_capture,
        };
        Ok(())
    }

    /// Configure a trigger stage in serial mode: mask/value bits apply to a
    /// 32-bit shift register fed from a single channel.
    pub fn set_serial_trigger(
        &mut self,
        stage: usize,
        channel: u8,
        mask: u32,
        value: u32,
        level: u8,
        delay: u16,
        start_capture: bool,
    ) -> Result<(), ConfigError> {
        if channel > 31 {
            return Err(ConfigError::ChannelOutOfRange(channel));
        }
        let (mask, value) = self.spread_for_demux(mask, value);
        let slot = self.stage_mut(stage)?;
        *slot = TriggerStage {
            mask,
            value,
            delay,
            level: check_level(level)?,
            channel,
            serial: true,
            start_capture,
        };
        Ok(())
    }

    fn stage_mut(&mut self, stage: usize) -> Result<&mut TriggerStage, ConfigError> {
        self.stages
            .get_mut(stage)
            .ok_or(ConfigError::StageOutOfRange(stage))
    }

    fn spread_for_demux(&self, mask: u32, value: u32) -> (u32, u32) {
        if self.demux {
            let mask = mask & 0xffff;
            let value = value & 0xffff;
            (mask | (mask << 16), value | (value << 16))
        } else {
            (mask, value)
        }
    }

    /// Produce the ordered register writes for a capture of `read_counter`
    /// samples with `stop_counter` of them after the trigger point.
    ///
    /// Order is fixed: trigger stages, divider, size, flags. The flags write
    /// arms feature interpretation on the device, so it must come after every
    /// register it depends on.
    pub fn register_writes(&self, stop_counter: u32, read_counter: u32) -> Vec<(u8, u32)> {
        let mut writes = Vec::with_capacity(3 * TRIGGER_STAGES + 3);

        let effective_stop = self.trigger_writes(&mut writes, stop_counter, read_counter);

        writes.push((SET_DIVIDER, self.divider));
        writes.push((SET_SIZE, self.size_word(effective_stop, read_counter)));
        writes.push((SET_FLAGS, self.flags_word()));

        writes
    }

    /// Emit the per-stage trigger registers and return the stop counter that
    /// the size register has to account for. Without a trigger the device
    /// captures immediately and the whole buffer is post-"trigger".
    fn trigger_writes(
        &self,
        writes: &mut Vec<(u8, u32)>,
        stop_counter: u32,
        read_counter: u32,
    ) -> u32 {
        if self.trigger_enabled {
            for (i, stage) in self.stages.iter().enumerate() {
                let select = (4 * i) as u8;
                writes.push((SET_TRIGGER_MASK | select, stage.mask));
                writes.push((SET_TRIGGER_VALUE | select, stage.value));
                writes.push((SET_TRIGGER_CONFIG | select, stage.config_word()));
            }
            stop_counter
        } else {
            // Zero every stage so stale hardware state cannot fire, then make
            // stage 0 capture unconditionally.
            for i in 0..TRIGGER_STAGES {
                let select = (4 * i) as u8;
                writes.push((SET_TRIGGER_MASK | select, 0));
                writes.push((SET_TRIGGER_VALUE | select, 0));
                writes.push((
                    SET_TRIGGER_CONFIG | select,
                    if i == 0 { TRIGGER_CAPTURE } else { 0 },
                ));
            }
            read_counter
        }
    }

    /// Pack the stop and read counters into the size register. The layout is
    /// a hardware register format: 8-sample alignment and a 13-bit shift when
    /// demultiplexed, 4-sample alignment and a 14-bit shift otherwise.
    fn size_word(&self, stop_counter: u32, read_counter: u32) -> u32 {
        if self.demux && self.clock_source == ClockSource::Internal {
            (((stop_counter.wrapping_sub(8)) & 0x7_fff8) << 13)
                | (((read_counter & 0x7_fff8) >> 3).wrapping_sub(1))
        } else {
            (((stop_counter.wrapping_sub(4)) & 0x3_fffc) << 14)
                | (((read_counter & 0x3_fffc) >> 2).wrapping_sub(1))
        }
    }

    /// Assemble the capture flags word. Demultiplexing and the noise filter
    /// are mutually exclusive on the hardware; whichever applies clears the
    /// other bit.
    fn flags_word(&self) -> u32 {
        let mut flags = 0;

        match self.clock_source {
            ClockSource::Internal => {}
            ClockSource::ExternalRising => flags |= FLAG_EXTERNAL,
            ClockSource::ExternalFalling => flags |= FLAG_EXTERNAL | FLAG_INVERTED,
        }

        let mut groups = 0;
        for (i, enabled) in self.enabled_groups.iter().enumerate() {
            if *enabled {
                groups |= 1 << i;
            }
        }
        // Bits 2..=5 carry the *disabled* groups.
        flags |= !(groups << 2) & 0x3c;

        if self.demux && self.clock_source == ClockSource::Internal {
            flags |= FLAG_DEMUX;
            flags &= !FLAG_FILTER;
        } else if self.filter && self.is_filter_available() {
            flags |= FLAG_FILTER;
            flags &= !FLAG_DEMUX;
        }

        if self.rle {
            flags |= FLAG_RLE;
        }
        if self.alt_number_scheme {
            flags |= FLAG_NUMBER_SCHEME;
        }
        if self.test_mode {
            flags |= FLAG_TEST_MODE;
        }

        flags
    }
}

fn check_level(level: u8) -> Result<u8, ConfigError> {
    if level > 3 {
        return Err(ConfigError::LevelOutOfRange(level));
    }
    Ok(level)
}
