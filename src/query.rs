//! Query shapes and the randomized generator that instantiates them.
//!
//! A shape fixes the structure of a query (stages, fields touched); each
//! generated [`QuerySpec`] only varies the parameter values, so repeated runs
//! hit the same store code paths with different selectivity.

use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Days after the window start in which a generated range may begin.
const WINDOW_OFFSET_DAYS: i64 = 176;
const SAMPLE_SIZES: [u32; 3] = [1000, 2000, 5000];
const SUMMARY_LIMITS: [u32; 3] = [20, 50, 100];
const RECENT_LIMITS: [u32; 3] = [10, 25, 50];
const HEAVY_LIMITS: [u32; 3] = [5, 10, 20];
pub const DEVICE_CATEGORIES: [&str; 4] = ["HEATER", "OVEN", "TV", "MISC_APPLIANCE"];
/// Unanchored name patterns; none of them can use an index.
pub const NAME_PATTERNS: [&str; 3] = [
    ".*[Hh]eat.*|.*[Ll]ight.*|.*[Oo]ven.*",
    ".*[Hh]eat.*|.*[Ff]ridge.*",
    ".*[Oo]ven.*|.*TV.*|.*[Ww]asher.*",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryShape {
    /// match range -> sample -> group by device -> match count -> sort -> limit
    DevicePowerSummary,
    /// indexed find on timestamp with projection and limit
    RecentReadings,
    /// match range -> group by category -> sort by count
    CategoryCounts,
    /// match range + category -> approximate percentiles of power
    PowerPercentiles,
    /// day/device grouping -> percentiles per device -> self-lookup of the
    /// hourly pattern -> count of days above p95. Deliberately expensive.
    DeviceAnomalyPercentiles,
    /// unindexed regex on device name -> anomaly score -> time-of-day buckets.
    /// Deliberately expensive.
    NameRegexAnomaly,
}

impl QueryShape {
    pub const ALL: [QueryShape; 6] = [
        QueryShape::DevicePowerSummary,
        QueryShape::RecentReadings,
        QueryShape::CategoryCounts,
        QueryShape::PowerPercentiles,
        QueryShape::DeviceAnomalyPercentiles,
        QueryShape::NameRegexAnomaly,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QueryShape::DevicePowerSummary => "device_power_summary",
            QueryShape::RecentReadings => "recent_readings",
            QueryShape::CategoryCounts => "category_counts",
            QueryShape::PowerPercentiles => "power_percentiles",
            QueryShape::DeviceAnomalyPercentiles => "device_anomaly_percentiles",
            QueryShape::NameRegexAnomaly => "name_regex_anomaly",
        }
    }
}

impl fmt::Display for QueryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for QueryShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        QueryShape::ALL
            .into_iter()
            .find(|shape| shape.name() == wanted)
            .ok_or_else(|| format!("unknown query shape: {}", s))
    }
}

/// How the generator picks a shape for each call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShapeSelection {
    #[default]
    Random,
    RoundRobin,
}

impl FromStr for ShapeSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "round-robin" | "round_robin" | "rotation" => Ok(Self::RoundRobin),
            other => Err(format!("unknown shape selection: {}", other)),
        }
    }
}

/// Width class of a generated date range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSpan {
    Short,
    Medium,
    Long,
}

impl RangeSpan {
    const ALL: [RangeSpan; 3] = [RangeSpan::Short, RangeSpan::Medium, RangeSpan::Long];

    /// Inclusive bounds on the range length in days.
    pub fn day_bounds(&self) -> (i64, i64) {
        match self {
            RangeSpan::Short => (1, 3),
            RangeSpan::Medium => (4, 10),
            RangeSpan::Long => (11, 30),
        }
    }
}

/// Inclusive calendar-day range (`start` at midnight through `end` at midnight).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

/// One instantiated query. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum QuerySpec {
    DevicePowerSummary {
        range: DateRange,
        span: RangeSpan,
        sample_size: u32,
        min_count: u32,
        limit: u32,
    },
    RecentReadings {
        since: NaiveDate,
        limit: u32,
    },
    CategoryCounts {
        range: DateRange,
    },
    PowerPercentiles {
        range: DateRange,
        category: &'static str,
    },
    DeviceAnomalyPercentiles {
        since: NaiveDate,
        limit: u32,
    },
    NameRegexAnomaly {
        pattern: &'static str,
        limit: u32,
    },
}

impl QuerySpec {
    pub fn shape(&self) -> QueryShape {
        match self {
            QuerySpec::DevicePowerSummary { .. } => QueryShape::DevicePowerSummary,
            QuerySpec::RecentReadings { .. } => QueryShape::RecentReadings,
            QuerySpec::CategoryCounts { .. } => QueryShape::CategoryCounts,
            QuerySpec::PowerPercentiles { .. } => QueryShape::PowerPercentiles,
            QuerySpec::DeviceAnomalyPercentiles { .. } => QueryShape::DeviceAnomalyPercentiles,
            QuerySpec::NameRegexAnomaly { .. } => QueryShape::NameRegexAnomaly,
        }
    }
}

/// Produces one [`QuerySpec`] per call from a fixed shape catalog.
///
/// Each worker owns its own generator, so no synchronization is involved.
pub struct QueryGenerator {
    catalog: Vec<QueryShape>,
    selection: ShapeSelection,
    window_start: NaiveDate,
    rng: StdRng,
    cursor: usize,
}

impl QueryGenerator {
    /// `seed` makes the sequence reproducible; `None` seeds from entropy.
    pub fn new(
        catalog: &[QueryShape],
        selection: ShapeSelection,
        window_start: NaiveDate,
        seed: Option<u64>,
    ) -> Self {
        let catalog = if catalog.is_empty() {
            QueryShape::ALL.to_vec()
        } else {
            catalog.to_vec()
        };
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            catalog,
            selection,
            window_start,
            rng,
            cursor: 0,
        }
    }

    pub fn next_spec(&mut self) -> QuerySpec {
        let shape = self.next_shape();
        match shape {
            QueryShape::DevicePowerSummary => {
                let span = *RangeSpan::ALL.choose(&mut self.rng).unwrap_or(&RangeSpan::Short);
                QuerySpec::DevicePowerSummary {
                    range: self.date_range(span),
                    span,
                    sample_size: self.pick(&SAMPLE_SIZES),
                    min_count: self.rng.gen_range(2..=5),
                    limit: self.pick(&SUMMARY_LIMITS),
                }
            }
            QueryShape::RecentReadings => QuerySpec::RecentReadings {
                since: self.window_day(),
                limit: self.pick(&RECENT_LIMITS),
            },
            QueryShape::CategoryCounts => {
                let span = *RangeSpan::ALL.choose(&mut self.rng).unwrap_or(&RangeSpan::Medium);
                QuerySpec::CategoryCounts {
                    range: self.date_range(span),
                }
            }
            QueryShape::PowerPercentiles => {
                let span = *RangeSpan::ALL.choose(&mut self.rng).unwrap_or(&RangeSpan::Long);
                QuerySpec::PowerPercentiles {
                    range: self.date_range(span),
                    category: DEVICE_CATEGORIES
                        .choose(&mut self.rng)
                        .copied()
                        .unwrap_or(DEVICE_CATEGORIES[0]),
                }
            }
            QueryShape::DeviceAnomalyPercentiles => QuerySpec::DeviceAnomalyPercentiles {
                since: self.window_day(),
                limit: self.pick(&HEAVY_LIMITS),
            },
            QueryShape::NameRegexAnomaly => QuerySpec::NameRegexAnomaly {
                pattern: NAME_PATTERNS
                    .choose(&mut self.rng)
                    .copied()
                    .unwrap_or(NAME_PATTERNS[0]),
                limit: self.pick(&HEAVY_LIMITS),
            },
        }
    }

    fn next_shape(&mut self) -> QueryShape {
        match self.selection {
            ShapeSelection::Random => {
                let idx = self.rng.gen_range(0..self.catalog.len());
                self.catalog[idx]
            }
            ShapeSelection::RoundRobin => {
                let shape = self.catalog[self.cursor % self.catalog.len()];
                self.cursor = self.cursor.wrapping_add(1);
                shape
            }
        }
    }

    fn pick(&mut self, choices: &[u32]) -> u32 {
        choices.choose(&mut self.rng).copied().unwrap_or(choices[0])
    }

    fn window_day(&mut self) -> NaiveDate {
        let offset = self.rng.gen_range(0..WINDOW_OFFSET_DAYS);
        self.window_start + Duration::days(offset)
    }

    fn date_range(&mut self, span: RangeSpan) -> DateRange {
        let start = self.window_day();
        let (lo, hi) = span.day_bounds();
        let len = self.rng.gen_range(lo..=hi);
        DateRange {
            start,
            end: start + Duration::days(len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[test]
    fn parameters_stay_within_bands() {
        let mut generator = QueryGenerator::new(&QueryShape::ALL, ShapeSelection::Random, window(), Some(7));
        let last_start = window() + Duration::days(WINDOW_OFFSET_DAYS);
        for _ in 0..2_000 {
            match generator.next_spec() {
                QuerySpec::DevicePowerSummary { range, span, sample_size, min_count, limit } => {
                    let (lo, hi) = span.day_bounds();
                    assert!((lo..=hi).contains(&range.days()));
                    assert!(range.start >= window() && range.start < last_start);
                    assert!(SAMPLE_SIZES.contains(&sample_size));
                    assert!((2..=5).contains(&min_count));
                    assert!(SUMMARY_LIMITS.contains(&limit));
                }
                QuerySpec::RecentReadings { since, limit } => {
                    assert!(since >= window() && since < last_start);
                    assert!(RECENT_LIMITS.contains(&limit));
                }
                QuerySpec::CategoryCounts { range } => {
                    assert!((1..=30).contains(&range.days()));
                }
                QuerySpec::PowerPercentiles { range, category } => {
                    assert!((1..=30).contains(&range.days()));
                    assert!(DEVICE_CATEGORIES.contains(&category));
                }
                QuerySpec::DeviceAnomalyPercentiles { since, limit } => {
                    assert!(since >= window() && since < last_start);
                    assert!(HEAVY_LIMITS.contains(&limit));
                }
                QuerySpec::NameRegexAnomaly { pattern, limit } => {
                    assert!(NAME_PATTERNS.contains(&pattern));
                    assert!(HEAVY_LIMITS.contains(&limit));
                }
            }
        }
    }

    #[test]
    fn round_robin_cycles_catalog_in_order() {
        let catalog = [QueryShape::CategoryCounts, QueryShape::RecentReadings];
        let mut generator = QueryGenerator::new(&catalog, ShapeSelection::RoundRobin, window(), None);
        let shapes: Vec<_> = (0..5).map(|_| generator.next_spec().shape()).collect();
        assert_eq!(
            shapes,
            vec![
                QueryShape::CategoryCounts,
                QueryShape::RecentReadings,
                QueryShape::CategoryCounts,
                QueryShape::RecentReadings,
                QueryShape::CategoryCounts,
            ]
        );
    }

    #[test]
    fn random_selection_only_uses_catalog() {
        let catalog = [QueryShape::PowerPercentiles];
        let mut generator = QueryGenerator::new(&catalog, ShapeSelection::Random, window(), Some(1));
        assert!((0..200).all(|_| generator.next_spec().shape() == QueryShape::PowerPercentiles));
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = QueryGenerator::new(&QueryShape::ALL, ShapeSelection::Random, window(), Some(42));
        let mut b = QueryGenerator::new(&QueryShape::ALL, ShapeSelection::Random, window(), Some(42));
        for _ in 0..50 {
            assert_eq!(a.next_spec(), b.next_spec());
        }
    }

    #[test]
    fn shape_names_parse_back() {
        for shape in QueryShape::ALL {
            assert_eq!(shape.name().parse::<QueryShape>().unwrap(), shape);
        }
        assert_eq!("recent-readings".parse::<QueryShape>().unwrap(), QueryShape::RecentReadings);
        assert!("full_scan".parse::<QueryShape>().is_err());
    }
}
