use chrono::{DateTime, Utc};
use eyre::Result;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::pricing::{CompsQuery, PriceEstimator, PricingConfig};

/// How a correction reached the log: either the self-play pass predicting
/// against held-back sold prices, or a user overriding the suggested price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionSource {
    SelfPlay,
    UserEdit,
}

/// One prediction-vs-truth observation, persisted as a JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub recorded_at: DateTime<Utc>,
    pub source: CorrectionSource,
    pub category_id: String,
    pub condition: String,
    pub predicted_pence: i64,
    pub truth_pence: i64,
}

/// A labeled example for self-play: everything the estimator sees, plus the
/// realized sold price it never gets to look at while predicting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeacherExample {
    pub brand: String,
    pub category_id: String,
    pub size: String,
    pub condition: String,
    pub sold_pence: i64,
}

/// Labeled-sale corpus used when a learning run supplies no inline examples.
/// A JSON array of `TeacherExample` at `TEACHER_EXAMPLES_PATH`.
pub fn load_teacher_examples() -> Result<Vec<TeacherExample>> {
    let path = std::env::var("TEACHER_EXAMPLES_PATH")
        .unwrap_or_else(|_| "data/teacher_examples.json".to_string());
    let raw = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Append-only JSONL correction log. Malformed lines are skipped on read so
/// a torn write never wedges the learning run.
pub struct CorrectionLog {
    path: PathBuf,
}

impl CorrectionLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn from_env() -> Self {
        let path = std::env::var("CORRECTIONS_PATH")
            .unwrap_or_else(|_| "data/corrections.jsonl".to_string());
        Self::new(PathBuf::from(path))
    }

    pub fn append(&self, record: &CorrectionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Returns up to `window` most recent records, oldest first.
    pub fn read_recent(&self, window: usize) -> Result<Vec<CorrectionRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let mut records: Vec<CorrectionRecord> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if records.len() > window {
            records.drain(..records.len() - window);
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningReport {
    pub examples_played: usize,
    pub records_examined: usize,
    pub buckets_adjusted: usize,
    pub published_version: Option<u64>,
}

/// Offline learning pass. Self-play replays labeled sales through the live
/// estimator, logs the misses, then folds systematic per-bucket error back
/// into the pricing config as a bias shift.
pub struct LearningLoop {
    estimator: Arc<PriceEstimator>,
    log: Arc<CorrectionLog>,
    window: usize,
    sample_size: usize,
    seed: u64,
}

/// A bucket only earns an adjustment once it has this many observations.
const MIN_BUCKET_COUNT: usize = 10;
/// And only when the mean error exceeds this share of the bucket's truth median.
const MIN_ERROR_SHARE: f64 = 0.10;

impl LearningLoop {
    pub fn new(estimator: Arc<PriceEstimator>, log: Arc<CorrectionLog>) -> Self {
        Self {
            estimator,
            log,
            window: env_usize("LEARNING_WINDOW", 500),
            sample_size: env_usize("LEARNING_SAMPLE", 64),
            seed: env_usize("LEARNING_SEED", 17) as u64,
        }
    }

    pub async fn run(&self, examples: &[TeacherExample]) -> Result<LearningReport> {
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let played: Vec<&TeacherExample> = examples
            .choose_multiple(&mut rng, self.sample_size.min(examples.len()))
            .collect();

        for example in &played {
            let query = CompsQuery::new(
                &example.brand,
                &example.category_id,
                &example.size,
                &example.condition,
            );
            let estimate = self.estimator.estimate(&query).await;
            self.log.append(&CorrectionRecord {
                recorded_at: Utc::now(),
                source: CorrectionSource::SelfPlay,
                category_id: query.category_id,
                condition: query.condition,
                predicted_pence: estimate.mid_pence,
                truth_pence: example.sold_pence,
            })?;
        }

        let records = self.log.read_recent(self.window)?;
        let adjustments = bucket_adjustments(&records);
        let buckets_adjusted = adjustments.len();

        let published_version = if adjustments.is_empty() {
            None
        } else {
            let current = self.estimator.config().current();
            let mut next = PricingConfig::clone(&current);
            next.version += 1;
            for (bucket, shift) in adjustments {
                info!(
                    target = "magpie.learning",
                    bucket = %bucket,
                    shift_pence = shift,
                    "publishing bias adjustment"
                );
                *next.bias_pence.entry(bucket).or_insert(0) += shift;
            }
            let version = next.version;
            self.estimator.config().publish(next);
            Some(version)
        };

        Ok(LearningReport {
            examples_played: played.len(),
            records_examined: records.len(),
            buckets_adjusted,
            published_version,
        })
    }
}

/// Per-bucket bias deltas: the negated mean signed error, for buckets with
/// enough volume and a miss large enough to be systematic rather than noise.
fn bucket_adjustments(records: &[CorrectionRecord]) -> HashMap<String, i64> {
    let mut buckets: HashMap<String, Vec<&CorrectionRecord>> = HashMap::new();
    for record in records {
        let key = PricingConfig::bucket_key(&record.category_id, &record.condition);
        buckets.entry(key).or_default().push(record);
    }

    let mut adjustments = HashMap::new();
    for (key, bucket) in buckets {
        if bucket.len() < MIN_BUCKET_COUNT {
            continue;
        }
        let mean_error = bucket
            .iter()
            .map(|r| (r.predicted_pence - r.truth_pence) as f64)
            .sum::<f64>()
            / bucket.len() as f64;
        let truth_median = median(bucket.iter().map(|r| r.truth_pence));
        if truth_median <= 0 {
            continue;
        }
        if mean_error.abs() <= MIN_ERROR_SHARE * truth_median as f64 {
            debug!(
                target = "magpie.learning",
                bucket = %key,
                mean_error_pence = mean_error as i64,
                "error within noise band, skipping"
            );
            continue;
        }
        adjustments.insert(key, -(mean_error.round() as i64));
    }
    adjustments
}

fn median(values: impl Iterator<Item = i64>) -> i64 {
    let mut sorted: Vec<i64> = values.collect();
    if sorted.is_empty() {
        return 0;
    }
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2
    } else {
        sorted[mid]
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::{CompsError, CompsSource, PricingConfigHandle};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedComps(Vec<i64>);

    #[async_trait]
    impl CompsSource for FixedComps {
        async fn lookup(&self, _query: &CompsQuery) -> Result<Vec<i64>, CompsError> {
            Ok(self.0.clone())
        }
    }

    fn record(category: &str, predicted: i64, truth: i64) -> CorrectionRecord {
        CorrectionRecord {
            recorded_at: Utc::now(),
            source: CorrectionSource::SelfPlay,
            category_id: category.to_string(),
            condition: "good".to_string(),
            predicted_pence: predicted,
            truth_pence: truth,
        }
    }

    #[test]
    fn log_appends_and_reads_back_in_order() {
        let dir = TempDir::new().unwrap();
        let log = CorrectionLog::new(dir.path().join("corrections.jsonl"));
        log.append(&record("1904", 2_000, 2_300)).unwrap();
        log.append(&record("2050", 1_500, 1_400)).unwrap();

        let records = log.read_recent(10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].category_id, "1904");
        assert_eq!(records[1].category_id, "2050");
    }

    #[test]
    fn read_recent_skips_torn_lines_and_honors_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrections.jsonl");
        let log = CorrectionLog::new(path.clone());
        for i in 0..5 {
            log.append(&record("1904", 2_000 + i, 2_300)).unwrap();
        }
        fs::write(
            &path,
            format!("{}{{truncated", fs::read_to_string(&path).unwrap()),
        )
        .unwrap();

        let records = log.read_recent(3).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].predicted_pence, 2_004);
    }

    #[test]
    fn small_buckets_and_small_errors_get_no_adjustment() {
        // Nine records: below the volume floor.
        let few: Vec<CorrectionRecord> = (0..9).map(|_| record("1904", 1_500, 2_000)).collect();
        assert!(bucket_adjustments(&few).is_empty());

        // Enough volume, but the miss is under 10% of the truth median.
        let noisy: Vec<CorrectionRecord> = (0..12).map(|_| record("1904", 2_050, 2_000)).collect();
        assert!(bucket_adjustments(&noisy).is_empty());
    }

    #[test]
    fn systematic_underprediction_earns_positive_bias() {
        // Truth 2000, predicted 1700: mean error -300, 15% of the median.
        let records: Vec<CorrectionRecord> =
            (0..20).map(|_| record("1904", 1_700, 2_000)).collect();
        let adjustments = bucket_adjustments(&records);
        assert_eq!(
            adjustments.get(&PricingConfig::bucket_key("1904", "good")),
            Some(&300)
        );
    }

    #[tokio::test]
    async fn run_publishes_a_bumped_config_when_the_student_drifts() {
        let dir = TempDir::new().unwrap();
        let handle = PricingConfigHandle::new(PricingConfig::from_env());
        // Comps put the mid at 1700; every sale closed at 2000.
        let estimator = Arc::new(PriceEstimator::new(
            Arc::new(FixedComps(vec![1_500, 1_700, 1_900])),
            handle.clone(),
        ));
        let log = Arc::new(CorrectionLog::new(dir.path().join("corrections.jsonl")));
        let learning = LearningLoop::new(estimator, log);

        let examples: Vec<TeacherExample> = (0..20)
            .map(|_| TeacherExample {
                brand: "Nike".to_string(),
                category_id: "1904".to_string(),
                size: "L".to_string(),
                condition: "good".to_string(),
                sold_pence: 2_000,
            })
            .collect();

        let report = learning.run(&examples).await.unwrap();
        assert_eq!(report.examples_played, 20);
        assert_eq!(report.buckets_adjusted, 1);
        assert_eq!(report.published_version, Some(2));

        let config = handle.current();
        assert_eq!(
            config
                .bias_pence
                .get(&PricingConfig::bucket_key("1904", "good")),
            Some(&300)
        );
    }

    #[tokio::test]
    async fn quiet_log_leaves_the_config_alone() {
        let dir = TempDir::new().unwrap();
        let handle = PricingConfigHandle::new(PricingConfig::from_env());
        let estimator = Arc::new(PriceEstimator::new(
            Arc::new(FixedComps(vec![1_900, 2_000, 2_100])),
            handle.clone(),
        ));
        let log = Arc::new(CorrectionLog::new(dir.path().join("corrections.jsonl")));
        let learning = LearningLoop::new(estimator, log);

        let examples = vec![
            TeacherExample {
                brand: "Nike".to_string(),
                category_id: "1904".to_string(),
                size: "L".to_string(),
                condition: "good".to_string(),
                sold_pence: 2_000,
            };
            12
        ];

        let report = learning.run(&examples).await.unwrap();
        assert_eq!(report.buckets_adjusted, 0);
        assert_eq!(report.published_version, None);
        assert_eq!(handle.current().version, 1);
    }
}
