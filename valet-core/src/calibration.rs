//! Feedback & Calibration (C11): turns recorded human verdicts into
//! per-source stopping-threshold adjustments and a sender→action pattern
//! store (spec.md §4.11).
//!
//! Shares the queue's `rusqlite` database (spec.md §6 "Pattern/calibration:
//! per-source tables") via the same `Arc<Mutex<Connection>>` handed out by
//! [`crate::queue::ApprovalQueue::connection`], following the teacher's
//! `with_conn` idiom from `memory/store.rs`.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::bus::{EventBus, EventEnvelope, EventKind};
use crate::error::{Error, Result};

/// Confidence buckets are deciles: `0.92` falls in the `0.90` bucket (spec.md
/// §4.11 "agreement rate at the 0.90 bucket").
fn confidence_bucket(confidence: f64) -> f64 {
    ((confidence * 10.0).floor() / 10.0).clamp(0.0, 0.9)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    ApproveAsSuggested,
    ApproveOtherOption,
    Reject,
    CorrectedManually,
}

impl Verdict {
    fn agrees(&self) -> bool {
        matches!(self, Verdict::ApproveAsSuggested)
    }
}

/// One `(source, action_class, confidence_bucket)` agreement row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationTable {
    pub source: String,
    pub action_class: String,
    pub confidence_bucket: f64,
    pub agree_count: u64,
    pub total_count: u64,
}

impl CalibrationTable {
    pub fn agreement_rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.agree_count as f64 / self.total_count as f64
        }
    }
}

/// One `(sender, action_class)` pattern-store row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternStore {
    pub sender: String,
    pub action_class: String,
    pub agree_count: u64,
    pub total_count: u64,
}

impl PatternStore {
    pub fn agreement_rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.agree_count as f64 / self.total_count as f64
        }
    }

    /// Promotion rule: agreement ≥0.95 over ≥20 samples (spec.md §4.11).
    pub fn is_promoted(&self) -> bool {
        self.total_count >= 20 && self.agreement_rate() >= 0.95
    }

    /// Rendered the way V1's prompt context expects it (spec.md §8
    /// scenario 2: `"sender pattern: delete"`).
    pub fn as_prior(&self) -> String {
        format!("sender pattern: {}", self.action_class)
    }
}

pub struct Calibrator {
    conn: Arc<Mutex<Connection>>,
    bus: EventBus,
}

impl Calibrator {
    /// Build on top of an existing connection (typically
    /// [`crate::queue::ApprovalQueue::connection`]) so the two components
    /// share one database file.
    pub fn new(conn: Arc<Mutex<Connection>>, bus: EventBus) -> Result<Self> {
        {
            let guard = conn
                .lock()
                .map_err(|e| Error::Internal(format!("calibration connection lock poisoned: {e}")))?;
            initialize_schema(&guard)?;
        }
        Ok(Self { conn, bus })
    }

    pub fn in_memory(bus: EventBus) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        Self::new(Arc::new(Mutex::new(conn)), bus)
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("calibration connection lock poisoned: {e}")))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    /// Record a human verdict against a suggested action and, when a
    /// sender is known, fold it into that sender's pattern row too.
    /// Publishes `CalibrationUpdated` whenever the resulting state crosses
    /// a threshold-adjustment or pattern-promotion boundary.
    pub fn record_verdict(
        &self,
        source: &str,
        action_class: &str,
        suggested_confidence: f64,
        verdict: Verdict,
        sender: Option<&str>,
    ) -> Result<()> {
        let bucket = confidence_bucket(suggested_confidence);
        let agree = if verdict.agrees() { 1 } else { 0 };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO calibration_buckets (source, action_class, confidence_bucket, agree_count, total_count)
                 VALUES (?1, ?2, ?3, ?4, 1)
                 ON CONFLICT(source, action_class, confidence_bucket) DO UPDATE SET
                    agree_count = agree_count + excluded.agree_count,
                    total_count = total_count + 1",
                params![source, action_class, bucket, agree],
            )
        })?;

        if let Some(sender) = sender {
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO sender_patterns (sender, action_class, agree_count, total_count)
                     VALUES (?1, ?2, ?3, 1)
                     ON CONFLICT(sender, action_class) DO UPDATE SET
                        agree_count = agree_count + excluded.agree_count,
                        total_count = total_count + 1",
                    params![sender, action_class, agree],
                )
            })?;

            let pattern = self.pattern(sender, action_class)?;
            if pattern.is_promoted() {
                self.bus.publish(EventEnvelope::new(
                    source.to_string(),
                    EventKind::CalibrationUpdated {
                        source: source.to_string(),
                        action_class: action_class.to_string(),
                    },
                    Utc::now(),
                ));
            }
        }

        if bucket >= 0.9 {
            let table = self.agreement(source, action_class, 0.9)?;
            let rate = table.agreement_rate();
            if rate > 0.95 || rate < 0.70 {
                self.bus.publish(EventEnvelope::new(
                    source.to_string(),
                    EventKind::CalibrationUpdated {
                        source: source.to_string(),
                        action_class: action_class.to_string(),
                    },
                    Utc::now(),
                ));
            }
        }

        Ok(())
    }

    pub fn agreement(&self, source: &str, action_class: &str, bucket: f64) -> Result<CalibrationTable> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT agree_count, total_count FROM calibration_buckets
                 WHERE source = ?1 AND action_class = ?2 AND confidence_bucket = ?3",
                params![source, action_class, bucket],
                |row| {
                    Ok(CalibrationTable {
                        source: source.to_string(),
                        action_class: action_class.to_string(),
                        confidence_bucket: bucket,
                        agree_count: row.get::<_, i64>(0)? as u64,
                        total_count: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .or_else(|_| {
                Ok(CalibrationTable {
                    source: source.to_string(),
                    action_class: action_class.to_string(),
                    confidence_bucket: bucket,
                    agree_count: 0,
                    total_count: 0,
                })
            })
        })
    }

    fn pattern(&self, sender: &str, action_class: &str) -> Result<PatternStore> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT agree_count, total_count FROM sender_patterns WHERE sender = ?1 AND action_class = ?2",
                params![sender, action_class],
                |row| {
                    Ok(PatternStore {
                        sender: sender.to_string(),
                        action_class: action_class.to_string(),
                        agree_count: row.get::<_, i64>(0)? as u64,
                        total_count: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .or_else(|_| {
                Ok(PatternStore {
                    sender: sender.to_string(),
                    action_class: action_class.to_string(),
                    agree_count: 0,
                    total_count: 0,
                })
            })
        })
    }

    /// The V3-stop threshold to use for `source`, derived from the 0.90
    /// bucket's agreement rate: lowered to 0.88 on strong agreement
    /// (>0.95), raised on poor agreement (<0.70). The raise amount (+0.05,
    /// capped at 0.97) has no literal figure in spec.md — an interior
    /// choice recorded in DESIGN.md.
    pub fn stopping_threshold_for(&self, source: &str, action_class: &str, baseline: f64) -> Result<f64> {
        let table = self.agreement(source, action_class, 0.9)?;
        if table.total_count == 0 {
            return Ok(baseline);
        }
        let rate = table.agreement_rate();
        if rate > 0.95 {
            Ok(baseline.min(0.88))
        } else if rate < 0.70 {
            Ok((baseline + 0.05).min(0.97))
        } else {
            Ok(baseline)
        }
    }

    /// Promoted sender→action priors, rendered for V1's prompt context.
    pub fn sender_priors(&self, sender: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT action_class, agree_count, total_count FROM sender_patterns WHERE sender = ?1",
            )?;
            let rows = stmt.query_map(params![sender], |row| {
                Ok(PatternStore {
                    sender: sender.to_string(),
                    action_class: row.get(0)?,
                    agree_count: row.get::<_, i64>(1)? as u64,
                    total_count: row.get::<_, i64>(2)? as u64,
                })
            })?;
            let mut priors = Vec::new();
            for row in rows {
                let pattern = row?;
                if pattern.is_promoted() {
                    priors.push(pattern.as_prior());
                }
            }
            Ok(priors)
        })
    }
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS calibration_buckets (
            source TEXT NOT NULL,
            action_class TEXT NOT NULL,
            confidence_bucket REAL NOT NULL,
            agree_count INTEGER NOT NULL DEFAULT 0,
            total_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (source, action_class, confidence_bucket)
        );
        CREATE TABLE IF NOT EXISTS sender_patterns (
            sender TEXT NOT NULL,
            action_class TEXT NOT NULL,
            agree_count INTEGER NOT NULL DEFAULT 0,
            total_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (sender, action_class)
        );",
    )
    .map_err(|e| Error::Storage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_agreement_lowers_the_stop_threshold() {
        let calibrator = Calibrator::in_memory(EventBus::default()).unwrap();
        for _ in 0..20 {
            calibrator
                .record_verdict("newsletter@techcrunch.com", "delete", 0.92, Verdict::ApproveAsSuggested, None)
                .unwrap();
        }
        let threshold = calibrator
            .stopping_threshold_for("newsletter@techcrunch.com", "delete", 0.90)
            .unwrap();
        assert_eq!(threshold, 0.88);
    }

    #[test]
    fn poor_agreement_raises_the_stop_threshold() {
        let calibrator = Calibrator::in_memory(EventBus::default()).unwrap();
        for i in 0..20 {
            let verdict = if i < 2 { Verdict::ApproveAsSuggested } else { Verdict::Reject };
            calibrator
                .record_verdict("noisy@example.com", "archive", 0.93, verdict, None)
                .unwrap();
        }
        let threshold = calibrator
            .stopping_threshold_for("noisy@example.com", "archive", 0.90)
            .unwrap();
        assert!(threshold > 0.90);
    }

    #[test]
    fn sender_pattern_promotes_after_twenty_consistent_samples() {
        let calibrator = Calibrator::in_memory(EventBus::default()).unwrap();
        for _ in 0..19 {
            calibrator
                .record_verdict("newsletter@techcrunch.com", "delete", 0.92, Verdict::ApproveAsSuggested, Some("newsletter@techcrunch.com"))
                .unwrap();
        }
        assert!(calibrator.sender_priors("newsletter@techcrunch.com").unwrap().is_empty());

        calibrator
            .record_verdict("newsletter@techcrunch.com", "delete", 0.92, Verdict::ApproveAsSuggested, Some("newsletter@techcrunch.com"))
            .unwrap();
        let priors = calibrator.sender_priors("newsletter@techcrunch.com").unwrap();
        assert_eq!(priors, vec!["sender pattern: delete".to_string()]);
    }

    #[test]
    fn unseen_source_falls_back_to_baseline_threshold() {
        let calibrator = Calibrator::in_memory(EventBus::default()).unwrap();
        let threshold = calibrator.stopping_threshold_for("unknown@example.com", "delete", 0.90).unwrap();
        assert_eq!(threshold, 0.90);
    }
}
