//! Alignment of per-source sample streams into one workout stream
//!
//! Sources (watch, chest strap, power pod, bike computer) record on their own
//! clocks and cadences. The merger re-anchors each source to the matched
//! activity start, joins samples whose timestamps fall within a tolerance
//! window, resolves conflicting metrics by source priority and derives speed
//! and pace from cumulative distance.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::models::{ActiveInterval, MergedSample, RawSample, SampleFields, SourceStream};

/// Merge tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Maximum timestamp distance for samples to share a slot
    pub tolerance_ms: i64,

    /// A gap longer than this splits the stream into separate intervals
    pub pause_threshold_secs: i64,

    /// Number of trailing slots used to derive speed from distance
    pub smoothing_window: usize,

    /// Altitude and distance are interpolated across gaps up to this length
    pub max_interpolation_gap_secs: i64,

    /// Below this speed (m/s) pace is left unset instead of exploding
    pub min_speed_for_pace: Decimal,

    /// Source preference, highest priority first
    pub priority: SourcePriority,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            tolerance_ms: 1000,
            pause_threshold_secs: 5,
            smoothing_window: 5,
            max_interpolation_gap_secs: 10,
            min_speed_for_pace: dec!(0.5),
            priority: SourcePriority::default(),
        }
    }
}

/// Preferred order of sources, overall and per metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePriority {
    /// Applies to every metric without its own ordering
    pub default_order: Vec<String>,

    /// Keyed by field name (`heart_rate`, `power`, `distance`, ...)
    pub per_metric: BTreeMap<String, Vec<String>>,
}

impl SourcePriority {
    pub fn new(default_order: Vec<String>) -> Self {
        SourcePriority {
            default_order,
            per_metric: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, field: &str, order: Vec<String>) -> Self {
        self.per_metric.insert(field.to_string(), order);
        self
    }

    /// Lower is better; unlisted sources rank after all listed ones
    pub fn rank(&self, field: &str, source_id: &str) -> usize {
        let order = self.per_metric.get(field).unwrap_or(&self.default_order);
        order
            .iter()
            .position(|s| s == source_id)
            .unwrap_or(order.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Merged,
    NoData,
}

/// A pause that split the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapSplit {
    /// Index of the last sample before the pause
    pub after_index: usize,
    pub gap_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub status: MergeStatus,
    pub samples: Vec<MergedSample>,
    pub intervals: Vec<ActiveInterval>,
    pub gaps: Vec<GapSplit>,

    /// Samples per source after duplicate averaging
    pub source_counts: BTreeMap<String, usize>,
}

impl MergeResult {
    fn empty() -> Self {
        MergeResult {
            status: MergeStatus::NoData,
            samples: Vec::new(),
            intervals: Vec::new(),
            gaps: Vec::new(),
            source_counts: BTreeMap::new(),
        }
    }

    /// Moving time: every within-interval delta plus one nominal delta per interval
    pub fn moving_duration_secs(&self, nominal_delta_secs: Decimal) -> Decimal {
        self.intervals
            .iter()
            .map(|interval| {
                let span = (interval.end - interval.start).num_milliseconds();
                Decimal::new(span, 3) + nominal_delta_secs
            })
            .sum()
    }
}

pub struct SampleMerger {
    config: MergeConfig,
}

impl Default for SampleMerger {
    fn default() -> Self {
        Self::new(MergeConfig::default())
    }
}

impl SampleMerger {
    pub fn new(config: MergeConfig) -> Self {
        SampleMerger { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge all streams of one workout.
    ///
    /// `reference_start` is the matched activity start; sources that declare
    /// a different start are shifted by the difference before joining.
    pub fn merge(
        &self,
        streams: &[SourceStream],
        reference_start: Option<DateTime<Utc>>,
    ) -> MergeResult {
        let prepared: Vec<Vec<RawSample>> = streams
            .iter()
            .map(|stream| {
                let offset = match (reference_start, stream.activity_start) {
                    (Some(reference), Some(declared)) if reference != declared => {
                        let offset = reference - declared;
                        debug!(
                            source_id = %stream.source_id,
                            offset_ms = offset.num_milliseconds(),
                            "Re-anchoring source"
                        );
                        offset
                    }
                    _ => Duration::zero(),
                };
                dedupe(&stream.samples, offset)
            })
            .collect();

        let source_counts = streams
            .iter()
            .zip(&prepared)
            .map(|(stream, samples)| (stream.source_id.clone(), samples.len()))
            .collect();

        if prepared.iter().all(|samples| samples.is_empty()) {
            return MergeResult {
                source_counts,
                ..MergeResult::empty()
            };
        }

        let mut samples = self.join(&prepared);
        let (intervals, gaps) = self.split_intervals(&samples);
        for interval in &intervals {
            self.interpolate(&mut samples, interval);
            self.derive_speed_and_pace(&mut samples, interval);
        }

        info!(
            merged = samples.len(),
            sources = streams.len(),
            intervals = intervals.len(),
            "Merged sample streams"
        );

        MergeResult {
            status: MergeStatus::Merged,
            samples,
            intervals,
            gaps,
            source_counts,
        }
    }

    /// Nearest-timestamp join. The earliest pending sample anchors a slot;
    /// another source's next sample joins when it lies within the tolerance
    /// and is not closer to the anchor source's following sample.
    fn join(&self, sources: &[Vec<RawSample>]) -> Vec<MergedSample> {
        let tolerance = Duration::milliseconds(self.config.tolerance_ms);
        let mut cursors = vec![0usize; sources.len()];
        let mut merged = Vec::new();

        loop {
            let anchor = sources
                .iter()
                .enumerate()
                .filter_map(|(i, samples)| samples.get(cursors[i]).map(|s| (i, s.timestamp)))
                .min_by_key(|(i, ts)| (*ts, *i));
            let Some((anchor_source, anchor_ts)) = anchor else {
                break;
            };
            let anchor_following = sources[anchor_source]
                .get(cursors[anchor_source] + 1)
                .map(|s| s.timestamp);

            let mut members: Vec<&RawSample> = Vec::new();
            for (i, samples) in sources.iter().enumerate() {
                let Some(candidate) = samples.get(cursors[i]) else {
                    continue;
                };
                let distance = candidate.timestamp - anchor_ts;
                let joins = i == anchor_source
                    || (distance <= tolerance
                        && anchor_following
                            .map_or(true, |next| distance <= next - candidate.timestamp));
                if joins {
                    members.push(candidate);
                    cursors[i] += 1;
                }
            }

            merged.push(self.resolve_slot(anchor_ts, &members));
        }

        merged
    }

    /// Pick each field from the best-ranked member, nearest sample on ties
    fn resolve_slot(&self, timestamp: DateTime<Utc>, members: &[&RawSample]) -> MergedSample {
        let mut sample = MergedSample::empty(timestamp);
        sample.heart_rate = self.pick(members, timestamp, "heart_rate", |f| f.heart_rate);
        sample.power = self.pick(members, timestamp, "power", |f| f.power);
        sample.cadence = self.pick(members, timestamp, "cadence", |f| f.cadence);
        sample.run_cadence = self.pick(members, timestamp, "run_cadence", |f| f.run_cadence);
        sample.form_power = self.pick(members, timestamp, "form_power", |f| f.form_power);
        sample.air_power = self.pick(members, timestamp, "air_power", |f| f.air_power);
        sample.altitude = self.pick(members, timestamp, "altitude", |f| f.altitude);
        sample.distance = self.pick(members, timestamp, "distance", |f| f.distance);
        sample.speed = self.pick(members, timestamp, "speed", |f| f.speed);
        sample
    }

    fn pick<T>(
        &self,
        members: &[&RawSample],
        timestamp: DateTime<Utc>,
        field: &str,
        get: fn(&SampleFields) -> Option<T>,
    ) -> Option<T> {
        members
            .iter()
            .filter_map(|m| get(&m.fields).map(|value| (m, value)))
            .min_by_key(|(m, _)| {
                let offset = (m.timestamp - timestamp).num_milliseconds().abs();
                (self.config.priority.rank(field, &m.source_id), offset)
            })
            .map(|(_, value)| value)
    }

    fn split_intervals(&self, samples: &[MergedSample]) -> (Vec<ActiveInterval>, Vec<GapSplit>) {
        let threshold = self.config.pause_threshold_secs;
        let mut intervals = Vec::new();
        let mut gaps = Vec::new();
        let mut start = 0;

        for i in 1..samples.len() {
            let gap_ms = (samples[i].timestamp - samples[i - 1].timestamp).num_milliseconds();
            if gap_ms > threshold * 1000 {
                EngineError::GapExceeded {
                    gap_ms,
                    threshold_secs: threshold,
                }
                .emit();
                intervals.push(interval(samples, start, i));
                gaps.push(GapSplit {
                    after_index: i - 1,
                    gap_ms,
                });
                start = i;
            }
        }
        if start < samples.len() {
            intervals.push(interval(samples, start, samples.len()));
        }

        (intervals, gaps)
    }

    /// Fill short native gaps in altitude and distance within one interval
    fn interpolate(&self, samples: &mut [MergedSample], interval: &ActiveInterval) {
        let max_gap = Duration::seconds(self.config.max_interpolation_gap_secs);
        interpolate_field(samples, interval, max_gap, |s| &mut s.altitude);
        interpolate_field(samples, interval, max_gap, |s| &mut s.distance);
    }

    /// Speed from a trailing distance delta where no native speed exists;
    /// pace from speed wherever speed is fast enough
    fn derive_speed_and_pace(&self, samples: &mut [MergedSample], interval: &ActiveInterval) {
        let window = self.config.smoothing_window.max(1);

        for i in interval.start_index..interval.end_index {
            if samples[i].speed.is_none() {
                if let Some(current) = samples[i].distance {
                    let from = i.saturating_sub(window).max(interval.start_index);
                    let earliest = (from..i).find(|k| samples[*k].distance.is_some());
                    if let Some(k) = earliest {
                        let elapsed = (samples[i].timestamp - samples[k].timestamp).num_milliseconds();
                        if elapsed > 0 {
                            let covered = current - samples[k].distance.unwrap_or(current);
                            let speed = (covered * dec!(1000) / Decimal::from(elapsed)).round_dp(3);
                            samples[i].speed = Some(speed.max(Decimal::ZERO));
                        }
                    }
                }
            }

            samples[i].pace = match samples[i].speed {
                Some(speed) if speed > self.config.min_speed_for_pace => {
                    Some((dec!(1000) / speed).round_dp(1))
                }
                _ => None,
            };
        }
    }
}

fn interval(samples: &[MergedSample], start: usize, end: usize) -> ActiveInterval {
    ActiveInterval {
        start_index: start,
        end_index: end,
        start: samples[start].timestamp,
        end: samples[end - 1].timestamp,
    }
}

fn interpolate_field<F>(
    samples: &mut [MergedSample],
    interval: &ActiveInterval,
    max_gap: Duration,
    field: F,
) where
    F: Fn(&mut MergedSample) -> &mut Option<Decimal>,
{
    let mut last_known: Option<usize> = None;

    for i in interval.start_index..interval.end_index {
        let Some(value) = *field(&mut samples[i]) else {
            continue;
        };

        if let Some(k) = last_known {
            let span = samples[i].timestamp - samples[k].timestamp;
            if i > k + 1 && span <= max_gap {
                let start_value = field(&mut samples[k]).unwrap_or(value);
                let start_ts = samples[k].timestamp;
                let span_ms = Decimal::from(span.num_milliseconds());
                for j in k + 1..i {
                    let offset = Decimal::from((samples[j].timestamp - start_ts).num_milliseconds());
                    let filled = start_value + (value - start_value) * offset / span_ms;
                    *field(&mut samples[j]) = Some(filled.round_dp(2));
                }
            }
        }
        last_known = Some(i);
    }
}

/// Shift a source's samples and average samples sharing a timestamp
fn dedupe(samples: &[RawSample], offset: Duration) -> Vec<RawSample> {
    let mut sorted: Vec<RawSample> = samples
        .iter()
        .cloned()
        .map(|mut s| {
            s.timestamp += offset;
            s
        })
        .collect();
    sorted.sort_by_key(|s| s.timestamp);

    let mut result: Vec<RawSample> = Vec::with_capacity(sorted.len());
    let mut group: Vec<RawSample> = Vec::new();
    for sample in sorted {
        if group.last().is_some_and(|g| g.timestamp != sample.timestamp) {
            result.push(average(&group));
            group.clear();
        }
        group.push(sample);
    }
    if !group.is_empty() {
        result.push(average(&group));
    }
    result
}

fn average(group: &[RawSample]) -> RawSample {
    if group.len() == 1 {
        return group[0].clone();
    }

    let avg_u16 = |get: fn(&SampleFields) -> Option<u16>| -> Option<u16> {
        let values: Vec<u32> = group.iter().filter_map(|s| get(&s.fields)).map(u32::from).collect();
        if values.is_empty() {
            return None;
        }
        let count = values.len() as u32;
        let sum: u32 = values.iter().sum();
        // Round half up
        u16::try_from((sum * 2 + count) / (count * 2)).ok()
    };
    let avg_decimal = |get: fn(&SampleFields) -> Option<Decimal>| -> Option<Decimal> {
        let values: Vec<Decimal> = group.iter().filter_map(|s| get(&s.fields)).collect();
        if values.is_empty() {
            return None;
        }
        let sum: Decimal = values.iter().sum();
        Some(sum / Decimal::from(values.len()))
    };

    RawSample {
        source_id: group[0].source_id.clone(),
        timestamp: group[0].timestamp,
        fields: SampleFields {
            heart_rate: avg_u16(|f| f.heart_rate),
            power: avg_u16(|f| f.power),
            cadence: avg_u16(|f| f.cadence),
            run_cadence: avg_u16(|f| f.run_cadence),
            form_power: avg_u16(|f| f.form_power),
            air_power: avg_u16(|f| f.air_power),
            altitude: avg_decimal(|f| f.altitude),
            distance: avg_decimal(|f| f.distance),
            speed: avg_decimal(|f| f.speed),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 23, 7, 0, 0).unwrap()
    }

    fn sample(source: &str, offset_ms: i64, fields: SampleFields) -> RawSample {
        RawSample {
            source_id: source.to_string(),
            timestamp: start() + Duration::milliseconds(offset_ms),
            fields,
        }
    }

    fn hr(value: u16) -> SampleFields {
        SampleFields {
            heart_rate: Some(value),
            ..Default::default()
        }
    }

    fn power(value: u16) -> SampleFields {
        SampleFields {
            power: Some(value),
            ..Default::default()
        }
    }

    fn distance(meters: Decimal) -> SampleFields {
        SampleFields {
            distance: Some(meters),
            ..Default::default()
        }
    }

    fn stream(source: &str, samples: Vec<RawSample>) -> SourceStream {
        SourceStream {
            source_id: source.to_string(),
            activity_start: None,
            samples,
        }
    }

    #[test]
    fn test_empty_input_is_no_data() {
        let merger = SampleMerger::default();
        let result = merger.merge(&[], Some(start()));
        assert_eq!(result.status, MergeStatus::NoData);
        assert!(result.samples.is_empty());

        let result = merger.merge(&[stream("watch", Vec::new())], None);
        assert_eq!(result.status, MergeStatus::NoData);
        assert_eq!(result.source_counts.get("watch"), Some(&0));
    }

    #[test]
    fn test_joins_within_tolerance() {
        let watch = stream(
            "watch",
            (0..3).map(|i| sample("watch", i * 1000, hr(140))).collect(),
        );
        let pod = stream(
            "pod",
            (0..3).map(|i| sample("pod", i * 1000 + 300, power(250))).collect(),
        );

        let result = SampleMerger::default().merge(&[watch, pod], None);
        assert_eq!(result.samples.len(), 3);
        for merged in &result.samples {
            assert_eq!(merged.heart_rate, Some(140));
            assert_eq!(merged.power, Some(250));
        }
        assert_eq!(result.samples[1].timestamp, start() + Duration::seconds(1));
    }

    #[test]
    fn test_sample_closer_to_next_slot_waits() {
        let watch = stream(
            "watch",
            vec![sample("watch", 0, hr(140)), sample("watch", 1000, hr(141))],
        );
        let pod = stream("pod", vec![sample("pod", 800, power(250))]);

        let result = SampleMerger::default().merge(&[watch, pod], None);
        assert_eq!(result.samples.len(), 2);
        assert_eq!(result.samples[0].power, None);
        assert_eq!(result.samples[1].power, Some(250));
    }

    #[test]
    fn test_absent_metrics_stay_unset() {
        let watch = stream("watch", vec![sample("watch", 0, hr(140))]);
        let pod = stream("pod", vec![sample("pod", 3000, power(250))]);

        let result = SampleMerger::default().merge(&[watch, pod], None);
        assert_eq!(result.samples.len(), 2);
        assert_eq!(result.samples[0].power, None);
        assert_eq!(result.samples[1].heart_rate, None);
    }

    #[test]
    fn test_priority_resolves_conflicts() {
        let watch = stream("watch", vec![sample("watch", 0, power(300))]);
        let pod = stream("pod", vec![sample("pod", 500, power(250))]);
        let config = MergeConfig {
            priority: SourcePriority::new(vec!["pod".to_string(), "watch".to_string()]),
            ..Default::default()
        };

        let result = SampleMerger::new(config).merge(&[watch.clone(), pod.clone()], None);
        assert_eq!(result.samples.len(), 1);
        assert_eq!(result.samples[0].power, Some(250));

        // Without a ranking the nearest sample wins
        let result = SampleMerger::default().merge(&[watch, pod], None);
        assert_eq!(result.samples[0].power, Some(300));
    }

    #[test]
    fn test_per_metric_priority() {
        let priority = SourcePriority::new(vec!["watch".to_string()])
            .with_metric("power", vec!["pod".to_string()]);
        assert_eq!(priority.rank("power", "pod"), 0);
        assert_eq!(priority.rank("power", "watch"), 1);
        assert_eq!(priority.rank("heart_rate", "watch"), 0);
        assert_eq!(priority.rank("heart_rate", "pod"), 1);
    }

    #[test]
    fn test_duplicate_timestamps_averaged() {
        let watch = stream(
            "watch",
            vec![
                sample("watch", 0, hr(140)),
                sample("watch", 0, hr(145)),
                sample("watch", 1000, hr(150)),
            ],
        );

        let result = SampleMerger::default().merge(&[watch], None);
        assert_eq!(result.samples.len(), 2);
        assert_eq!(result.samples[0].heart_rate, Some(143));
        assert_eq!(result.source_counts.get("watch"), Some(&2));
    }

    #[test]
    fn test_reanchors_declared_start() {
        let watch = stream("watch", vec![sample("watch", 0, hr(140))]);
        let mut pod = stream("pod", vec![sample("pod", 2000, power(250))]);
        pod.activity_start = Some(start() + Duration::seconds(2));

        let result = SampleMerger::default().merge(&[watch, pod], Some(start()));
        assert_eq!(result.samples.len(), 1);
        assert_eq!(result.samples[0].heart_rate, Some(140));
        assert_eq!(result.samples[0].power, Some(250));
    }

    #[test]
    fn test_pause_splits_intervals() {
        let mut samples: Vec<RawSample> = (0..3).map(|i| sample("watch", i * 1000, hr(140))).collect();
        samples.extend((0..2).map(|i| sample("watch", 60_000 + i * 1000, hr(130))));

        let result = SampleMerger::default().merge(&[stream("watch", samples)], None);
        assert_eq!(result.intervals.len(), 2);
        assert_eq!(result.intervals[0].end_index, 3);
        assert_eq!(result.intervals[1].start_index, 3);
        assert_eq!(result.gaps[0].after_index, 2);
        assert_eq!(result.gaps[0].gap_ms, 58_000);
        // 2s + 1s nominal, then 1s + 1s nominal
        assert_eq!(result.moving_duration_secs(Decimal::ONE), dec!(5));
    }

    #[test]
    fn test_fractional_gap_over_threshold_splits() {
        let samples = vec![
            sample("watch", 0, hr(140)),
            sample("watch", 5000, hr(141)),
            sample("watch", 10_900, hr(142)),
        ];

        let result = SampleMerger::default().merge(&[stream("watch", samples)], None);
        assert_eq!(result.intervals.len(), 2);
        assert_eq!(result.gaps.len(), 1);
        assert_eq!(result.gaps[0].after_index, 1);
        assert_eq!(result.gaps[0].gap_ms, 5900);
    }

    #[test]
    fn test_mixed_rate_sources_interleave() {
        let strap = stream(
            "strap",
            (0..20).map(|i| sample("strap", i * 500, hr(150))).collect(),
        );
        let meter = stream(
            "meter",
            (0..10).map(|i| sample("meter", i * 1000, power(250))).collect(),
        );

        let result = SampleMerger::default().merge(&[meter, strap], None);
        assert_eq!(result.samples.len(), 20);
        assert_eq!(result.intervals.len(), 1);
        for (i, merged) in result.samples.iter().enumerate() {
            assert_eq!(merged.heart_rate, Some(150));
            assert_eq!(merged.power.is_some(), i % 2 == 0);
        }
        // 9.5s span + 1s nominal
        assert_eq!(result.moving_duration_secs(Decimal::ONE), dec!(10.5));
    }

    #[test]
    fn test_distance_interpolated_and_speed_derived() {
        let samples = vec![
            sample("watch", 0, distance(dec!(0))),
            sample("watch", 1000, hr(150)),
            sample("watch", 2000, hr(150)),
            sample("watch", 3000, distance(dec!(12))),
        ];

        let result = SampleMerger::default().merge(&[stream("watch", samples)], None);
        let merged = &result.samples;
        assert_eq!(merged[1].distance, Some(dec!(4)));
        assert_eq!(merged[2].distance, Some(dec!(8)));
        assert_eq!(merged[0].speed, None);
        assert_eq!(merged[3].speed, Some(dec!(4)));
        assert_eq!(merged[3].pace, Some(dec!(250)));
    }

    #[test]
    fn test_heart_rate_never_interpolated() {
        let samples = vec![
            sample("watch", 0, hr(150)),
            sample("watch", 1000, power(200)),
            sample("watch", 2000, hr(160)),
        ];
        let result = SampleMerger::default().merge(&[stream("watch", samples)], None);
        assert_eq!(result.samples[1].heart_rate, None);
    }

    #[test]
    fn test_slow_speed_has_no_pace() {
        let samples = vec![SampleFields {
            speed: Some(dec!(0.2)),
            ..Default::default()
        }];
        let samples = samples
            .into_iter()
            .map(|fields| sample("watch", 0, fields))
            .collect();
        let result = SampleMerger::default().merge(&[stream("watch", samples)], None);
        assert_eq!(result.samples[0].pace, None);
    }

    proptest! {
        #[test]
        fn test_merged_stream_invariants(
            a in prop::collection::vec(0i64..120_000, 0..60),
            b in prop::collection::vec(0i64..120_000, 0..60),
        ) {
            let watch = stream("watch", a.iter().map(|ms| sample("watch", *ms, hr(140))).collect());
            let pod = stream("pod", b.iter().map(|ms| sample("pod", *ms, power(220))).collect());

            let result = SampleMerger::default().merge(&[watch, pod], None);

            prop_assert!(result.samples.len() <= a.len() + b.len());
            for pair in result.samples.windows(2) {
                prop_assert!(pair[0].timestamp < pair[1].timestamp);
            }
            let covered: usize = result.intervals.iter().map(|i| i.len()).sum();
            prop_assert_eq!(covered, result.samples.len());
        }
    }
}
