use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::error::Error),
}

/// Per-user activity over one aggregation window, in the fixed feature
/// order consumed by the anomaly engine: `[total, video, social, messaging,
/// gaming, video_ratio, social_ratio, messaging_ratio, gaming_ratio,
/// entertainment_ratio]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub user_id: String,
    pub client_ip: IpAddr,
    pub total: i64,
    pub video: i64,
    pub social: i64,
    pub messaging: i64,
    pub gaming: i64,
    pub video_ratio: f64,
    pub social_ratio: f64,
    pub messaging_ratio: f64,
    pub gaming_ratio: f64,
    pub entertainment_ratio: f64,
}

impl FeatureVector {
    pub fn from_counts(
        user_id: String,
        client_ip: IpAddr,
        total: i64,
        video: i64,
        social: i64,
        messaging: i64,
        gaming: i64,
    ) -> FeatureVector {
        let denominator = total.max(1) as f64;
        FeatureVector {
            user_id,
            client_ip,
            total,
            video,
            social,
            messaging,
            gaming,
            video_ratio: video as f64 / denominator,
            social_ratio: social as f64 / denominator,
            messaging_ratio: messaging as f64 / denominator,
            gaming_ratio: gaming as f64 / denominator,
            entertainment_ratio: (video + social + gaming) as f64 / denominator,
        }
    }

    pub fn to_features(&self) -> [f64; 10] {
        [
            self.total as f64,
            self.video as f64,
            self.social as f64,
            self.messaging as f64,
            self.gaming as f64,
            self.video_ratio,
            self.social_ratio,
            self.messaging_ratio,
            self.gaming_ratio,
            self.entertainment_ratio,
        ]
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ActivityRow {
    user_id: String,
    client_ip: ipnetwork::IpNetwork,
    total: i64,
    video: i64,
    social: i64,
    messaging: i64,
    gaming: i64,
}

/// Windowed reduction over the detection log. Stateless between
/// invocations; a snapshot is a pure function of the log contents and the
/// window, so re-running over the same state yields the same vectors.
#[derive(Clone)]
pub struct Aggregator {
    db_pool: Arc<sqlx::PgPool>,
    log: slog::Logger,
}

impl Aggregator {
    pub fn new(db_pool: Arc<sqlx::PgPool>, log: slog::Logger) -> Aggregator {
        Aggregator { db_pool, log }
    }

    /// Compute feature vectors for every user with at least one detection
    /// inside the window. `general` traffic is excluded from all counts,
    /// and only users currently bound to an address are considered.
    pub async fn snapshot(
        &self,
        window: chrono::Duration,
    ) -> Result<Vec<FeatureVector>, AggregateError> {
        let since = Utc::now() - window;
        let rows: Vec<ActivityRow> = sqlx::query_as(
            r#"
            SELECT s."user_id", s."client_ip",
                   COUNT(*) AS "total",
                   COUNT(*) FILTER (WHERE d."category" = 'video') AS "video",
                   COUNT(*) FILTER (WHERE d."category" = 'social') AS "social",
                   COUNT(*) FILTER (WHERE d."category" = 'messaging') AS "messaging",
                   COUNT(*) FILTER (WHERE d."category" = 'gaming') AS "gaming"
            FROM detections d
            INNER JOIN sessions s ON s."user_id" = d."user_id" AND s."state" = 'active'
            WHERE d."ts" >= $1 AND d."category" <> 'general'
            GROUP BY s."user_id", s."client_ip"
            "#,
        )
        .bind(since)
        .fetch_all(self.db_pool.as_ref())
        .await?;

        let vectors: Vec<FeatureVector> = rows
            .into_iter()
            .map(|row| {
                FeatureVector::from_counts(
                    row.user_id,
                    row.client_ip.ip(),
                    row.total,
                    row.video,
                    row.social,
                    row.messaging,
                    row.gaming,
                )
            })
            .collect();
        slog::debug!(self.log, "aggregation snapshot computed"; "users" => vectors.len());
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_feature_math_matches_window_semantics() {
        // 100 observations, 45 video, 10 gaming, 45 general: general is
        // excluded upstream, so the counts arriving here total 55.
        let fv = FeatureVector::from_counts(
            "U1".to_owned(),
            IpAddr::from_str("10.0.0.7").unwrap(),
            55,
            45,
            0,
            0,
            10,
        );
        assert_eq!(fv.total, 55);
        assert!((fv.video_ratio - 45.0 / 55.0).abs() < 1e-9);
        assert!((fv.gaming_ratio - 10.0 / 55.0).abs() < 1e-9);
        assert!((fv.entertainment_ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_feature_order_is_fixed() {
        let fv = FeatureVector::from_counts(
            "U1".to_owned(),
            IpAddr::from_str("10.0.0.7").unwrap(),
            10,
            4,
            3,
            2,
            1,
        );
        let features = fv.to_features();
        assert_eq!(features[0], 10.0);
        assert_eq!(features[1], 4.0);
        assert_eq!(features[2], 3.0);
        assert_eq!(features[3], 2.0);
        assert_eq!(features[4], 1.0);
        assert!((features[5] - 0.4).abs() < 1e-9);
        assert!((features[9] - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_zero_total_does_not_divide_by_zero() {
        let fv = FeatureVector::from_counts(
            "U1".to_owned(),
            IpAddr::from_str("10.0.0.7").unwrap(),
            0,
            0,
            0,
            0,
            0,
        );
        assert_eq!(fv.video_ratio, 0.0);
        assert_eq!(fv.entertainment_ratio, 0.0);
    }
}
