use std::collections::HashSet;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::classifier::{self, Category};
use crate::observer::Observation;
use crate::session::SessionStore;

// Pending flushed batches beyond this are dropped oldest-first rather than
// stalling the capture path.
const MAX_PENDING_BATCHES: usize = 8;

#[derive(Error, Debug)]
pub enum DetectionLogError {
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] sqlx::error::Error),
}

/// One observed hostname-bearing packet attributed to an authenticated
/// user. Immutable once written.
#[derive(Debug, Clone)]
pub struct Detection {
    pub ts: DateTime<Utc>,
    pub user_id: String,
    pub client_ip: IpAddr,
    pub hostname: String,
    pub app: String,
    pub category: Category,
    pub score: f64,
    pub reason: String,
}

/// Append-only writer for the detection log. Owns a worker task that
/// attributes observations, batches them, and writes batches out without
/// ever blocking the observer.
#[derive(Debug)]
pub struct DetectionLog {
    dropped_batches: Arc<AtomicU64>,
}

impl DetectionLog {
    pub fn new(
        observations: tokio::sync::mpsc::Receiver<Observation>,
        flush_interval: std::time::Duration,
        retention: chrono::Duration,
        db_pool: Arc<sqlx::PgPool>,
        sessions: SessionStore,
        shutdown: tokio::sync::watch::Receiver<bool>,
        log: slog::Logger,
    ) -> DetectionLog {
        let dropped_batches = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&dropped_batches);
        tokio::task::spawn(async move {
            detection_writer(
                observations,
                flush_interval,
                retention,
                db_pool,
                sessions,
                counter,
                shutdown,
                log,
            )
            .await;
        });
        DetectionLog { dropped_batches }
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }
}

async fn detection_writer(
    mut chan: tokio::sync::mpsc::Receiver<Observation>,
    flush_interval: std::time::Duration,
    retention: chrono::Duration,
    db_pool: Arc<sqlx::PgPool>,
    sessions: SessionStore,
    dropped_batches: Arc<AtomicU64>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    log: slog::Logger,
) {
    let mut current_batch: Vec<Detection> = Vec::new();
    let mut pending: VecDeque<Vec<Detection>> = VecDeque::new();

    let mut flush_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + flush_interval,
        flush_interval,
    );
    let retention_period = std::time::Duration::from_secs(3600);
    let mut retention_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + retention_period,
        retention_period,
    );

    loop {
        tokio::select! {
            message = chan.recv() => {
                let observation = match message {
                    Some(observation) => observation,
                    None => break,
                };
                // Unattributable traffic never reaches storage; this also
                // drops traffic from banned identities since lookup refuses
                // to name them.
                let user_id = match sessions.lookup_user(observation.src_ip).await {
                    Ok(Some(user_id)) => user_id,
                    Ok(None) => continue,
                    Err(e) => {
                        slog::warn!(log, "session lookup failed, dropping observation";
                            "ip" => observation.src_ip.to_string(), "error" => e.to_string());
                        continue;
                    }
                };
                let (category, app) = classifier::classify(&observation.hostname);
                current_batch.push(Detection {
                    ts: observation.ts,
                    user_id,
                    client_ip: observation.src_ip,
                    hostname: observation.hostname,
                    app: app.to_owned(),
                    category,
                    score: 1.0,
                    reason: String::new(),
                });
            }
            _ = flush_timer.tick() => {
                rotate_batch(&mut current_batch, &mut pending, &dropped_batches, &log);
                drain_pending(&mut pending, &db_pool, &log).await;
            }
            _ = retention_timer.tick() => {
                if let Err(e) = prune(&db_pool, retention).await {
                    slog::warn!(log, "detection retention prune failed"; "error" => e.to_string());
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Final flush on the way out.
    rotate_batch(&mut current_batch, &mut pending, &dropped_batches, &log);
    drain_pending(&mut pending, &db_pool, &log).await;
    slog::debug!(log, "detection writer shutting down");
}

fn rotate_batch(
    current_batch: &mut Vec<Detection>,
    pending: &mut VecDeque<Vec<Detection>>,
    dropped_batches: &AtomicU64,
    log: &slog::Logger,
) {
    if current_batch.is_empty() {
        return;
    }
    let batch = dedup_batch(std::mem::take(current_batch));
    pending.push_back(batch);
    while pending.len() > MAX_PENDING_BATCHES {
        pending.pop_front();
        let dropped = dropped_batches.fetch_add(1, Ordering::Relaxed) + 1;
        slog::warn!(log, "detection writer lagging, dropped oldest batch";
            "dropped_batches" => dropped);
    }
}

async fn drain_pending(
    pending: &mut VecDeque<Vec<Detection>>,
    db_pool: &sqlx::PgPool,
    log: &slog::Logger,
) {
    while let Some(batch) = pending.front() {
        match write_batch(db_pool, batch).await {
            Ok(written) => {
                slog::debug!(log, "detection batch written"; "count" => written);
                pending.pop_front();
            }
            Err(e) => {
                // Leave the batch queued; the next flush retries it and the
                // rotation cap bounds memory in the meantime.
                slog::warn!(log, "detection batch write failed"; "error" => e.to_string());
                break;
            }
        }
    }
}

/// Deduplicate a batch by `(user_id, hostname)` so a burst of resolutions
/// for one name cannot dominate the aggregates. First sighting wins.
fn dedup_batch(batch: Vec<Detection>) -> Vec<Detection> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    batch
        .into_iter()
        .filter(|detection| {
            seen.insert((detection.user_id.clone(), detection.hostname.clone()))
        })
        .collect()
}

async fn write_batch(
    db_pool: &sqlx::PgPool,
    batch: &[Detection],
) -> Result<usize, DetectionLogError> {
    let mut transaction = db_pool.begin().await?;
    for detection in batch {
        sqlx::query(
            r#"
            INSERT INTO detections("ts", "user_id", "client_ip", "hostname", "app", "category", "score", "reason")
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(detection.ts)
        .bind(&detection.user_id)
        .bind(ipnetwork::IpNetwork::from(detection.client_ip))
        .bind(&detection.hostname)
        .bind(&detection.app)
        .bind(detection.category.as_str())
        .bind(detection.score)
        .bind(&detection.reason)
        .execute(&mut transaction)
        .await?;
    }
    transaction.commit().await?;
    Ok(batch.len())
}

/// Age out detections beyond the retention window.
pub async fn prune(
    db_pool: &sqlx::PgPool,
    retention: chrono::Duration,
) -> Result<u64, DetectionLogError> {
    let cutoff = Utc::now() - retention;
    let result = sqlx::query(r#"DELETE FROM detections WHERE "ts" < $1"#)
        .bind(cutoff)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn detection(user_id: &str, hostname: &str) -> Detection {
        Detection {
            ts: Utc::now(),
            user_id: user_id.to_owned(),
            client_ip: IpAddr::from_str("10.0.0.7").unwrap(),
            hostname: hostname.to_owned(),
            app: "Unknown".to_owned(),
            category: Category::General,
            score: 1.0,
            reason: String::new(),
        }
    }

    fn make_logger() -> slog::Logger {
        use slog::Drain;
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain.fuse(), slog::o!())
    }

    #[test]
    fn test_dedup_keeps_one_per_user_hostname() {
        let batch = vec![
            detection("u1", "youtube.com"),
            detection("u1", "youtube.com"),
            detection("u1", "youtube.com"),
            detection("u2", "youtube.com"),
            detection("u1", "discord.gg"),
        ];
        let deduped = dedup_batch(batch);
        assert_eq!(deduped.len(), 3);
        assert_eq!(
            deduped
                .iter()
                .filter(|d| d.user_id == "u1" && d.hostname == "youtube.com")
                .count(),
            1
        );
    }

    #[test]
    fn test_rotate_drops_oldest_when_writer_lags() {
        let log = make_logger();
        let dropped = AtomicU64::new(0);
        let mut pending: VecDeque<Vec<Detection>> = VecDeque::new();

        for i in 0..(MAX_PENDING_BATCHES + 3) {
            let mut batch = vec![detection("u1", &format!("host{}.example", i))];
            rotate_batch(&mut batch, &mut pending, &dropped, &log);
        }

        assert_eq!(pending.len(), MAX_PENDING_BATCHES);
        assert_eq!(dropped.load(Ordering::Relaxed), 3);
        // The survivors are the newest batches.
        assert_eq!(pending.front().unwrap()[0].hostname, "host3.example");
    }

    #[test]
    fn test_rotate_skips_empty_batches() {
        let log = make_logger();
        let dropped = AtomicU64::new(0);
        let mut pending: VecDeque<Vec<Detection>> = VecDeque::new();
        let mut batch: Vec<Detection> = Vec::new();
        rotate_batch(&mut batch, &mut pending, &dropped, &log);
        assert!(pending.is_empty());
    }
}
