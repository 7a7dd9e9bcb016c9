use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_classifier::{
    DecisionTreeClassifier, DecisionTreeClassifierParameters, SplitCriterion,
};
use thiserror::Error;

use crate::aggregator::{AggregateError, Aggregator, FeatureVector};
use crate::firewall::Iptables;
use crate::policy::{AnomalyThresholds, PolicyError, PolicyStore};
use crate::session::{BanKind, BanRecord, SessionError, SessionStore};

const TEMPORARY_BAN_HOURS: i64 = 24;
const PERMANENT_CONFIDENCE: f64 = 0.95;
const TEMPORARY_CONFIDENCE: f64 = 0.75;
const FOREST_SIZE: usize = 25;
const TREE_DEPTH: u16 = 8;

#[derive(Error, Debug)]
pub enum AnomalyError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::error::Error),
    #[error("Aggregation failed: {0}")]
    AggregateError(#[from] AggregateError),
    #[error("Policy read failed: {0}")]
    PolicyError(#[from] PolicyError),
    #[error("Session operation failed: {0}")]
    SessionError(#[from] SessionError),
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Classifier training failed: {0}")]
    TrainingFailed(String),
}

/// Evaluate the hard threshold rules against a feature vector, returning a
/// human-readable description of every rule that tripped. An empty result
/// means no rule fired.
pub fn evaluate_rules(thresholds: &AnomalyThresholds, fv: &FeatureVector) -> Vec<String> {
    let mut reasons = Vec::new();
    if fv.total >= thresholds.high_activity_total {
        reasons.push(format!("High activity ({} requests)", fv.total));
    }
    if fv.video_ratio >= thresholds.video_ratio {
        reasons.push(format!("Excessive video ({:.0}%)", fv.video_ratio * 100.0));
    }
    if fv.social_ratio >= thresholds.social_ratio {
        reasons.push(format!(
            "Excessive social media ({:.0}%)",
            fv.social_ratio * 100.0
        ));
    }
    if fv.gaming >= thresholds.gaming_count {
        reasons.push(format!(
            "Gaming detected ({} requests, {:.0}%)",
            fv.gaming,
            fv.gaming_ratio * 100.0
        ));
    }
    if fv.video_ratio + fv.social_ratio >= thresholds.combined_ratio {
        reasons.push(format!(
            "Combined video and social ({:.0}%)",
            (fv.video_ratio + fv.social_ratio) * 100.0
        ));
    }
    reasons
}

/// Map a confidence score to the ban policy bands. `None` means the anomaly
/// is recorded without revoking access.
pub fn ban_decision(confidence: f64) -> Option<(BanKind, Option<chrono::Duration>)> {
    if confidence >= PERMANENT_CONFIDENCE {
        Some((BanKind::Permanent, None))
    } else if confidence >= TEMPORARY_CONFIDENCE {
        Some((
            BanKind::Temporary,
            Some(chrono::Duration::hours(TEMPORARY_BAN_HOURS)),
        ))
    } else {
        None
    }
}

type Tree = DecisionTreeClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>>;

/// A bootstrap-aggregated forest of decision trees. Confidence is the
/// fraction of trees voting anomalous, which gives the banded decision
/// pipeline a real spread instead of a single vote.
pub struct Forest {
    trees: Vec<Tree>,
}

impl Forest {
    pub fn train(
        features: &[[f64; 10]],
        labels: &[i32],
        seed: u64,
    ) -> Result<Forest, ModelError> {
        if features.is_empty() || features.len() != labels.len() {
            return Err(ModelError::TrainingFailed(
                "training set is empty or mismatched".to_owned(),
            ));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut trees = Vec::with_capacity(FOREST_SIZE);
        for _ in 0..FOREST_SIZE {
            let mut sample_rows: Vec<Vec<f64>> = Vec::with_capacity(features.len());
            let mut sample_labels: Vec<i32> = Vec::with_capacity(labels.len());
            for _ in 0..features.len() {
                let pick = rng.gen_range(0..features.len());
                sample_rows.push(features[pick].to_vec());
                sample_labels.push(labels[pick]);
            }
            let matrix = DenseMatrix::from_2d_vec(&sample_rows);
            let tree = Tree::fit(
                &matrix,
                &sample_labels,
                DecisionTreeClassifierParameters::default()
                    .with_max_depth(TREE_DEPTH)
                    .with_criterion(SplitCriterion::Gini),
            )
            .map_err(|e| ModelError::TrainingFailed(e.to_string()))?;
            trees.push(tree);
        }
        Ok(Forest { trees })
    }

    /// Score a feature vector; returns the anomalous-vote fraction in
    /// `[0, 1]`.
    pub fn score(&self, features: &[f64; 10]) -> f64 {
        let matrix = DenseMatrix::from_2d_vec(&vec![features.to_vec()]);
        let votes = self
            .trees
            .iter()
            .filter(|tree| matches!(tree.predict(&matrix), Ok(prediction) if prediction[0] == 1))
            .count();
        votes as f64 / self.trees.len() as f64
    }
}

fn labelled_row(
    thresholds: &AnomalyThresholds,
    total: i64,
    video: i64,
    social: i64,
    messaging: i64,
    gaming: i64,
) -> ([f64; 10], i32) {
    let fv = FeatureVector::from_counts(
        String::new(),
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        total,
        video,
        social,
        messaging,
        gaming,
    );
    let label = if evaluate_rules(thresholds, &fv).is_empty() {
        0
    } else {
        1
    };
    (fv.to_features(), label)
}

/// Deterministically synthesize the labelled training set the forest
/// learns from. Three regimes: quiet normal traffic, high-activity
/// entertainment-heavy traffic, and gaming-present traffic. The anomalous
/// regimes together outnumber the normal one, weighting the learned policy
/// toward recall on the anomalous class. Labels always come from the hard
/// rules, never from the regime, so the model is taught exactly the policy
/// it backs up.
pub fn synthesize_training_set(
    thresholds: &AnomalyThresholds,
    seed: u64,
) -> (Vec<[f64; 10]>, Vec<i32>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut features = Vec::new();
    let mut labels = Vec::new();

    let mut push = |row: ([f64; 10], i32)| {
        features.push(row.0);
        labels.push(row.1);
    };

    // Regime 1: low-activity normal traffic, no gaming, modest ratios.
    for _ in 0..400 {
        let total = rng.gen_range(1..=(thresholds.high_activity_total / 3).max(5));
        let video = (total as f64 * rng.gen_range(0.0..thresholds.video_ratio * 0.6)) as i64;
        let social = (total as f64 * rng.gen_range(0.0..thresholds.social_ratio * 0.6)) as i64;
        let remaining = (total - video - social).max(0);
        let messaging = rng.gen_range(0..=remaining);
        push(labelled_row(thresholds, total, video, social, messaging, 0));
    }

    // Regime 2: high-activity mixed traffic dominated by video and social.
    for _ in 0..450 {
        let total =
            rng.gen_range(thresholds.high_activity_total..=thresholds.high_activity_total * 3);
        let video_share = rng.gen_range(0.25..0.85);
        let social_share = rng.gen_range(0.05..(1.0f64 - video_share).max(0.06));
        let video = (total as f64 * video_share) as i64;
        let social = (total as f64 * social_share) as i64;
        let messaging = ((total - video - social).max(0) as f64 * rng.gen_range(0.0..0.5)) as i64;
        push(labelled_row(thresholds, total, video, social, messaging, 0));
    }

    // Regime 3: gaming present at or above the gaming threshold.
    for _ in 0..350 {
        let gaming = rng.gen_range(thresholds.gaming_count..=thresholds.gaming_count + 40);
        let extra = rng.gen_range(0..150);
        let total = gaming + extra;
        let video = (extra as f64 * rng.gen_range(0.0..0.7)) as i64;
        let social = ((extra - video).max(0) as f64 * rng.gen_range(0.0..0.7)) as i64;
        push(labelled_row(thresholds, total, video, social, 0, gaming));
    }

    (features, labels)
}

/// Outcome of evaluating one user in one cycle.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub rule_flag: bool,
    pub ml_flag: bool,
    pub confidence: f64,
    pub reason: String,
    pub should_ban: bool,
}

/// Evaluate the full decision pipeline for one feature vector. With no
/// model available the engine degrades to rule-only decisions: a gaming
/// trip bans at confidence 1.0, anything else is recorded without a ban.
pub fn evaluate(
    thresholds: &AnomalyThresholds,
    model: Option<&Forest>,
    fv: &FeatureVector,
) -> Verdict {
    let reasons = evaluate_rules(thresholds, fv);
    let rule_flag = !reasons.is_empty();
    let reason = reasons.join("; ");

    match model {
        Some(forest) => {
            let confidence = forest.score(&fv.to_features());
            let ml_flag = confidence >= 0.5;
            Verdict {
                rule_flag,
                ml_flag,
                confidence,
                reason,
                should_ban: rule_flag && ml_flag,
            }
        }
        None => {
            let gaming_tripped = fv.gaming >= thresholds.gaming_count;
            Verdict {
                rule_flag,
                ml_flag: false,
                confidence: if rule_flag && gaming_tripped { 1.0 } else { 0.0 },
                reason,
                should_ban: rule_flag && gaming_tripped,
            }
        }
    }
}

/// Consumes aggregation snapshots on a fixed cadence and applies the ban
/// policy through the session store and rule engine.
pub struct AnomalyEngine {
    model: Option<Forest>,
    model_tag: String,
    aggregator: Aggregator,
    policy: PolicyStore,
    sessions: SessionStore,
    firewall: Arc<Iptables>,
    db_pool: Arc<sqlx::PgPool>,
    window: chrono::Duration,
    log: slog::Logger,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub evaluated: usize,
    pub flagged: usize,
    pub banned: usize,
}

impl AnomalyEngine {
    /// Construct the engine, training the forest synchronously from the
    /// seeded synthetic recipe. A failed build degrades the engine to
    /// rule-only decisions rather than refusing to start.
    pub fn new(
        aggregator: Aggregator,
        policy: PolicyStore,
        sessions: SessionStore,
        firewall: Arc<Iptables>,
        db_pool: Arc<sqlx::PgPool>,
        thresholds: &AnomalyThresholds,
        window: chrono::Duration,
        seed: u64,
        log: slog::Logger,
    ) -> AnomalyEngine {
        let (features, labels) = synthesize_training_set(thresholds, seed);
        let anomalous = labels.iter().filter(|&&label| label == 1).count();
        let model = match Forest::train(&features, &labels, seed) {
            Ok(forest) => {
                slog::info!(log, "anomaly model trained";
                    "samples" => features.len(), "anomalous" => anomalous, "seed" => seed);
                Some(forest)
            }
            Err(e) => {
                slog::error!(log, "model build failed, degrading to rule-only decisions";
                    "error" => e.to_string());
                None
            }
        };
        AnomalyEngine {
            model,
            model_tag: format!("forest-v1-seed{}", seed),
            aggregator,
            policy,
            sessions,
            firewall,
            db_pool,
            window,
            log,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.model.is_none()
    }

    /// One evaluation pass over every user active in the window. Safe to
    /// re-run: equal bans upsert as no-ops and forwarding revocation is
    /// idempotent.
    pub async fn run_cycle(&self) -> Result<CycleStats, AnomalyError> {
        let thresholds = self.policy.snapshot().await?.thresholds;
        let vectors = self.aggregator.snapshot(self.window).await?;
        let mut stats = CycleStats {
            evaluated: vectors.len(),
            ..CycleStats::default()
        };

        for fv in &vectors {
            let verdict = evaluate(&thresholds, self.model.as_ref(), fv);
            if !verdict.rule_flag && !verdict.should_ban {
                continue;
            }
            if verdict.rule_flag {
                stats.flagged += 1;
                self.record_anomaly(fv, &verdict).await?;
            }
            if !verdict.should_ban {
                continue;
            }
            let Some((kind, duration)) = ban_decision(verdict.confidence) else {
                continue;
            };
            self.apply_ban(fv, &verdict, kind, duration).await?;
            stats.banned += 1;
        }

        slog::info!(self.log, "anomaly cycle complete";
            "evaluated" => stats.evaluated, "flagged" => stats.flagged, "banned" => stats.banned);
        Ok(stats)
    }

    async fn apply_ban(
        &self,
        fv: &FeatureVector,
        verdict: &Verdict,
        kind: BanKind,
        duration: Option<chrono::Duration>,
    ) -> Result<(), AnomalyError> {
        // Revoke forwarding before the ban becomes visible so no further
        // detection can be attributed to the banned identity.
        if let Err(e) = self.firewall.deny_client(fv.client_ip).await {
            slog::error!(self.log, "failed to revoke forwarding for banned user";
                "user" => &fv.user_id, "ip" => fv.client_ip.to_string(), "error" => e.to_string());
        }
        let now = Utc::now();
        let ban = BanRecord {
            user_id: fv.user_id.clone(),
            kind,
            confidence: verdict.confidence,
            reason: verdict.reason.clone(),
            blocked_at: now,
            expires_at: duration.map(|d| now + d),
        };
        self.sessions.insert_ban(&ban).await?;
        Ok(())
    }

    async fn record_anomaly(&self, fv: &FeatureVector, verdict: &Verdict) -> Result<(), AnomalyError> {
        let severity = if verdict.confidence >= PERMANENT_CONFIDENCE {
            "high"
        } else if verdict.confidence >= TEMPORARY_CONFIDENCE {
            "medium"
        } else {
            "low"
        };
        let features = serde_json::json!({
            "total": fv.total,
            "video": fv.video,
            "social": fv.social,
            "messaging": fv.messaging,
            "gaming": fv.gaming,
            "video_ratio": fv.video_ratio,
            "social_ratio": fv.social_ratio,
            "messaging_ratio": fv.messaging_ratio,
            "gaming_ratio": fv.gaming_ratio,
            "entertainment_ratio": fv.entertainment_ratio,
        });
        sqlx::query(
            r#"
            INSERT INTO anomalies("user_id", "ts", "confidence", "severity", "reason", "features", "model_tag")
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&fv.user_id)
        .bind(Utc::now())
        .bind(verdict.confidence)
        .bind(severity)
        .bind(&verdict.reason)
        .bind(sqlx::types::Json(features))
        .bind(&self.model_tag)
        .execute(self.db_pool.as_ref())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // Build a feature row from raw category counts, reusing the
    // aggregator's derivation so fixtures and live rows share one formula.
    fn feature_row(total: i64, video: i64, social: i64, messaging: i64, gaming: i64) -> [f64; 10] {
        FeatureVector::from_counts(
            String::new(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            total,
            video,
            social,
            messaging,
            gaming,
        )
        .to_features()
    }

    fn s3_thresholds() -> AnomalyThresholds {
        AnomalyThresholds {
            high_activity_total: 1000,
            video_ratio: 0.4,
            social_ratio: 0.9,
            gaming_count: 1,
            combined_ratio: 2.0,
        }
    }

    fn s3_vector() -> FeatureVector {
        FeatureVector::from_counts(
            "U1".to_owned(),
            IpAddr::from_str("10.0.0.7").unwrap(),
            55,
            45,
            0,
            0,
            10,
        )
    }

    #[test]
    fn test_rules_trip_on_s3_vector() {
        let reasons = evaluate_rules(&s3_thresholds(), &s3_vector());
        assert!(!reasons.is_empty());
        let joined = reasons.join("; ");
        assert!(joined.contains("Excessive video (82%)"), "got: {}", joined);
        assert!(joined.contains("Gaming detected (10 requests, 18%)"), "got: {}", joined);
    }

    #[test]
    fn test_rules_quiet_vector() {
        let fv = FeatureVector::from_counts(
            "U2".to_owned(),
            IpAddr::from_str("10.0.0.8").unwrap(),
            20,
            2,
            1,
            5,
            0,
        );
        assert!(evaluate_rules(&AnomalyThresholds::default(), &fv).is_empty());
    }

    #[test]
    fn test_ban_decision_bands() {
        assert_eq!(ban_decision(0.97), Some((BanKind::Permanent, None)));
        let (kind, duration) = ban_decision(0.80).unwrap();
        assert_eq!(kind, BanKind::Temporary);
        assert_eq!(duration, Some(chrono::Duration::hours(24)));
        assert_eq!(ban_decision(0.74), None);
        // Band edges are inclusive.
        assert_eq!(ban_decision(0.95).unwrap().0, BanKind::Permanent);
        assert_eq!(ban_decision(0.75).unwrap().0, BanKind::Temporary);
    }

    #[test]
    fn test_training_set_is_deterministic_and_recall_weighted() {
        let thresholds = AnomalyThresholds::default();
        let (features_a, labels_a) = synthesize_training_set(&thresholds, 42);
        let (features_b, labels_b) = synthesize_training_set(&thresholds, 42);
        assert_eq!(features_a, features_b);
        assert_eq!(labels_a, labels_b);

        let anomalous = labels_a.iter().filter(|&&label| label == 1).count();
        let normal = labels_a.len() - anomalous;
        assert!(anomalous > normal, "{} anomalous vs {} normal", anomalous, normal);
    }

    #[test]
    fn test_training_labels_match_rules() {
        let thresholds = AnomalyThresholds::default();
        let (features, labels) = synthesize_training_set(&thresholds, 7);
        for (row, label) in features.iter().zip(labels.iter()) {
            // Recompute the label from the raw counts embedded in the row.
            let fv = FeatureVector::from_counts(
                String::new(),
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                row[0] as i64,
                row[1] as i64,
                row[2] as i64,
                row[3] as i64,
                row[4] as i64,
            );
            let expected = if evaluate_rules(&thresholds, &fv).is_empty() { 0 } else { 1 };
            assert_eq!(*label, expected);
        }
    }

    #[test]
    fn test_forest_decisions_are_seeded_and_sensible() {
        let thresholds = AnomalyThresholds::default();
        let (features, labels) = synthesize_training_set(&thresholds, 42);
        let forest_a = Forest::train(&features, &labels, 42).unwrap();
        let forest_b = Forest::train(&features, &labels, 42).unwrap();

        let quiet = feature_row(12, 1, 1, 4, 0);
        let heavy = feature_row(400, 300, 80, 0, 0);
        let gaming = feature_row(60, 5, 5, 0, 30);

        // Same seed, same data, same decisions.
        assert_eq!(forest_a.score(&quiet), forest_b.score(&quiet));
        assert_eq!(forest_a.score(&heavy), forest_b.score(&heavy));

        assert!(forest_a.score(&quiet) < 0.5, "quiet traffic scored anomalous");
        assert!(forest_a.score(&heavy) >= 0.5, "heavy traffic scored normal");
        assert!(forest_a.score(&gaming) >= 0.5, "gaming traffic scored normal");
    }

    #[test]
    fn test_conservative_gate_requires_both_flags() {
        let thresholds = AnomalyThresholds::default();
        let (features, labels) = synthesize_training_set(&thresholds, 42);
        let forest = Forest::train(&features, &labels, 42).unwrap();

        // Quiet vector: no rule trip, whatever the model says the gate
        // stays closed.
        let quiet = FeatureVector::from_counts(
            "U2".to_owned(),
            IpAddr::from_str("10.0.0.8").unwrap(),
            10,
            1,
            1,
            2,
            0,
        );
        let verdict = evaluate(&thresholds, Some(&forest), &quiet);
        assert!(!verdict.rule_flag);
        assert!(!verdict.should_ban);
    }

    #[test]
    fn test_degraded_mode_bans_only_on_gaming() {
        let thresholds = AnomalyThresholds::default();
        let gaming_fv = FeatureVector::from_counts(
            "U3".to_owned(),
            IpAddr::from_str("10.0.0.9").unwrap(),
            40,
            0,
            0,
            0,
            20,
        );
        let verdict = evaluate(&thresholds, None, &gaming_fv);
        assert!(verdict.should_ban);
        assert_eq!(verdict.confidence, 1.0);

        let video_fv = FeatureVector::from_counts(
            "U4".to_owned(),
            IpAddr::from_str("10.0.0.10").unwrap(),
            100,
            90,
            0,
            0,
            0,
        );
        let verdict = evaluate(&thresholds, None, &video_fv);
        assert!(verdict.rule_flag);
        assert!(!verdict.should_ban);
        assert_eq!(verdict.confidence, 0.0);
    }
}
