//! Reconstruction of the captured trace.
//!
//! The device delivers a fixed-rate stream of raw 32-bit sample words. With
//! run-length encoding enabled, words with the high bit set are repeat counts
//! for the preceding sample instead of new data; decoding recovers a
//! variable-rate timeline of (value, timestamp) pairs.

use polars::prelude::*;

/// High bit marks a raw word as a repeat count.
pub const RLE_COUNT_FLAG: u32 = 0x8000_0000;
const RLE_COUNT_MASK: u32 = 0x7fff_ffff;

/// The result of one successful acquisition, owned by the caller.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Sample values in chronological order, oldest first.
    pub samples: Vec<u32>,
    /// Per-sample positions on the sample clock, monotonically
    /// non-decreasing. Identical to the sample index unless the capture was
    /// run-length encoded.
    pub timestamps: Vec<u64>,
    /// Index into `samples` where the trigger fired, when a trigger was
    /// armed. Back-calculated, may fall slightly outside the buffer.
    pub trigger_index: Option<i64>,
    /// Sample rate in Hz; `None` when the clock was external.
    pub sample_rate: Option<u32>,
    /// Number of probe lines sampled.
    pub channel_count: usize,
    /// Bitmask of the channels that were enabled for this capture.
    pub enabled_channels: u32,
    /// Total time span of the trace in sample-clock ticks. Exceeds
    /// `samples.len()` once RLE runs are expanded.
    pub absolute_length: u64,
}

impl CaptureResult {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Convert the trace to a DataFrame with a `timestamp` tick column and
    /// the raw `sample` words. When the sample rate is known a derived
    /// `time` column in seconds is added.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let timestamps: Column = Series::new("timestamp".into(), &self.timestamps).into();
        let samples: Column = Series::new("sample".into(), &self.samples).into();
        let mut df = DataFrame::new(vec![timestamps, samples])?;

        if let Some(rate) = self.sample_rate {
            let seconds: Vec<f64> = self
                .timestamps
                .iter()
                .map(|&t| t as f64 / f64::from(rate))
                .collect();
            let time: Column = Series::new("time".into(), seconds).into();
            df.with_column(time)?;
        }

        Ok(df)
    }

    /// Expand every enabled channel into its own boolean `ch_<n>` column.
    pub fn to_channel_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let mut df = self.to_dataframe()?;

        for channel in 0..self.channel_count.min(32) {
            if self.enabled_channels & (1 << channel) == 0 {
                continue;
            }
            let bits: Vec<bool> = self
                .samples
                .iter()
                .map(|&sample| (sample >> channel) & 1 == 1)
                .collect();
            let column: Column = Series::new(format!("ch_{channel}").into(), bits).into();
            df.with_column(column)?;
        }

        Ok(df)
    }
}

/// A decoded (but not yet annotated) trace.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct DecodedTrace {
    pub samples: Vec<u32>,
    pub timestamps: Vec<u64>,
    pub trigger_index: Option<i64>,
    pub absolute_length: u64,
}

/// Pass unencoded samples through and back-calculate the trigger position.
///
/// The trigger formula embeds hardware timing compensation constants taken
/// verbatim from the device's reference client; do not rederive them.
pub(crate) fn decode_plain(
    raw: &[u32],
    read_counter: u32,
    stop_counter: u32,
    divider: u32,
    demux: bool,
    trigger_enabled: bool,
) -> DecodedTrace {
    debug_assert!(!raw.is_empty());

    let trigger_index = trigger_enabled.then(|| {
        i64::from(read_counter)
            - i64::from(stop_counter)
            - 3
            - (4 / (i64::from(divider) + 1))
            - if demux { 5 } else { 0 }
    });

    DecodedTrace {
        samples: raw.to_vec(),
        timestamps: (0..raw.len() as u64).collect(),
        trigger_index,
        absolute_length: raw.len() as u64,
    }
}

/// Expand a run-length encoded stream into (value, timestamp) pairs.
///
/// A count word advances the running clock by its low 31 bits; a data word is
/// emitted at the current clock and advances it by one. Some firmware
/// revisions emit the same count word twice in a row; the duplicate is
/// dropped with a warning instead of doubling the gap.
pub(crate) fn decode_rle(raw: &[u32], stop_counter: u32, trigger_enabled: bool) -> DecodedTrace {
    debug_assert!(!raw.is_empty());

    let mut samples = Vec::with_capacity(raw.len());
    let mut timestamps = Vec::with_capacity(raw.len());
    let mut time: u64 = 0;
    let mut previous: Option<u32> = None;
    let mut trigger_position: Option<usize> = None;

    for (i, &word) in raw.iter().enumerate() {
        if word & RLE_COUNT_FLAG != 0 {
            if previous == Some(word) {
                log::warn!(
                    "Skipping duplicate RLE count of {} samples",
                    word & RLE_COUNT_MASK
                );
            } else {
                time += u64::from(word & RLE_COUNT_MASK);
            }
        } else {
            if trigger_position.is_none() && i as i64 >= i64::from(stop_counter) - 2 {
                trigger_position = Some(samples.len());
            }
            samples.push(word);
            timestamps.push(time);
            time += 1;
        }
        previous = Some(word);
    }

    let trigger_index =
        trigger_enabled.then(|| trigger_position.unwrap_or(0) as i64 - 1);

    DecodedTrace {
        samples,
        timestamps,
        trigger_index,
        absolute_length: time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_decode_is_a_passthrough() {
        let raw = [5u32, 6, 7, 8];
        let trace = decode_plain(&raw, 512, 256, 0, false, false);
        assert_eq!(trace.samples, raw);
        assert_eq!(trace.timestamps, vec![0, 1, 2, 3]);
        assert_eq!(trace.trigger_index, None);
        assert_eq!(trace.absolute_length, 4);
    }

    #[test]
    fn plain_trigger_position_formula() {
        let raw = [0u32; 4];

        // 512 - 256 - 3 - 4/1 - 0
        let trace = decode_plain(&raw, 512, 256, 0, false, true);
        assert_eq!(trace.trigger_index, Some(249));

        // 512 - 256 - 3 - 4/2 - 5
        let trace = decode_plain(&raw, 512, 256, 1, true, true);
        assert_eq!(trace.trigger_index, Some(246));
    }

    #[test]
    fn rle_count_advances_the_running_clock() {
        let trace = decode_rle(&[5, 0x8000_0003, 7], 0, false);
        assert_eq!(trace.samples, vec![5, 7]);
        assert_eq!(trace.timestamps, vec![0, 4]);
        assert_eq!(trace.trigger_index, None);
        assert_eq!(trace.absolute_length, 5);
    }

    #[test]
    fn duplicate_rle_count_is_counted_once() {
        let trace = decode_rle(&[0x8000_0005, 0x8000_0005, 9], 0, false);
        assert_eq!(trace.samples, vec![9]);
        assert_eq!(trace.timestamps, vec![5]);
        assert_eq!(trace.absolute_length, 6);
    }

    #[test]
    fn distinct_consecutive_rle_counts_both_apply() {
        let trace = decode_rle(&[1, 0x8000_0002, 0x8000_0003, 4], 0, false);
        assert_eq!(trace.samples, vec![1, 4]);
        assert_eq!(trace.timestamps, vec![0, 6]);
    }

    #[test]
    fn rle_trigger_is_first_decoded_sample_at_or_after_stop_minus_two() {
        let raw = [1u32, 0x8000_0002, 3, 4];
        let trace = decode_rle(&raw, 4, true);
        // Raw index 2 is the first data word at or after 4 - 2; it is decoded
        // sample 1, reported off by one.
        assert_eq!(trace.trigger_index, Some(0));
        assert_eq!(trace.samples, vec![1, 3, 4]);
        assert_eq!(trace.timestamps, vec![0, 3, 4]);
        assert_eq!(trace.absolute_length, 5);
    }

    #[test]
    fn rle_trigger_without_match_reports_minus_one() {
        let trace = decode_rle(&[0x8000_0001], 8, true);
        assert_eq!(trace.trigger_index, Some(-1));
        assert!(trace.samples.is_empty());
    }

    #[test]
    fn dataframe_carries_time_only_with_a_known_rate() {
        let result = CaptureResult {
            samples: vec![1, 2, 3],
            timestamps: vec![0, 1, 2],
            trigger_index: None,
            sample_rate: Some(1_000_000),
            channel_count: 8,
            enabled_channels: 0xff,
            absolute_length: 3,
        };

        let df = result.to_dataframe().unwrap();
        assert_eq!(df.height(), 3);
        assert!(df.column("time").is_ok());

        let unclocked = CaptureResult {
            sample_rate: None,
            ..result
        };
        let df = unclocked.to_dataframe().unwrap();
        assert!(df.column("time").is_err());
    }

    #[test]
    fn channel_dataframe_splits_enabled_channels_into_bit_columns() {
        let result = CaptureResult {
            samples: vec![0b0000_0001, 0b0000_0010],
            timestamps: vec![0, 1],
            trigger_index: None,
            sample_rate: None,
            channel_count: 8,
            enabled_channels: 0b0000_0011,
            absolute_length: 2,
        };

        let df = result.to_channel_dataframe().unwrap();
        assert!(df.column("ch_0").is_ok());
        assert!(df.column("ch_1").is_ok());
        assert!(df.column("ch_2").is_err());

        let ch0: Vec<bool> = df
            .column("ch_0")
            .unwrap()
            .bool()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(ch0, vec![true, false]);
    }
}
