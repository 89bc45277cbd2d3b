use crate::models::{Source, VehicleRecord};
use crate::sync::SyncError;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Storage seam for the diff engine. The production implementation is the
/// Supabase client; tests use an in-memory table.
#[allow(async_fn_in_trait)]
pub trait VehicleRepository {
    /// `source_id -> content fingerprint` for every stored row of a source.
    async fn existing_index(&self, source: Source) -> Result<HashMap<String, u64>, SyncError>;

    async fn upsert_batch(&self, records: &[VehicleRecord]) -> Result<(), SyncError>;

    async fn delete_by_ids(&self, source: Source, ids: &[String]) -> Result<(), SyncError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiffOutcome {
    pub added: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub errors: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub removed: u64,
    pub errors: u64,
}

/// Applies a normalized snapshot against stored state in batches. A record
/// whose content fingerprint matches the stored row is not rewritten, so a
/// re-run over an unchanged feed reports zero added and zero updated.
pub struct DiffEngine {
    batch_size: usize,
}

impl DiffEngine {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub async fn apply_snapshot<R: VehicleRepository>(
        &self,
        repo: &R,
        existing: &HashMap<String, u64>,
        records: Vec<VehicleRecord>,
    ) -> DiffOutcome {
        let mut outcome = DiffOutcome::default();

        for chunk in records.chunks(self.batch_size) {
            let mut to_write = Vec::new();
            let mut chunk_added = 0u64;
            let mut chunk_updated = 0u64;
            for record in chunk {
                match existing.get(&record.source_id) {
                    Some(fingerprint) if *fingerprint == record.fingerprint() => {
                        outcome.unchanged += 1;
                    }
                    Some(_) => {
                        chunk_updated += 1;
                        to_write.push(record.clone());
                    }
                    None => {
                        chunk_added += 1;
                        to_write.push(record.clone());
                    }
                }
            }
            if to_write.is_empty() {
                continue;
            }
            match repo.upsert_batch(&to_write).await {
                Ok(()) => {
                    outcome.added += chunk_added;
                    outcome.updated += chunk_updated;
                    debug!(
                        target = "sync.db",
                        written = to_write.len(),
                        "batch upserted"
                    );
                }
                // One bad batch costs its own rows, not the run.
                Err(err) => {
                    warn!(
                        target = "sync.db",
                        size = to_write.len(),
                        error = %err,
                        "batch upsert failed"
                    );
                    outcome.errors += to_write.len() as u64;
                }
            }
        }

        outcome
    }

    /// Delete stored rows of `source` whose ids the snapshot no longer
    /// contains. `stale` must already be the set difference.
    pub async fn remove_stale<R: VehicleRepository>(
        &self,
        repo: &R,
        source: Source,
        stale: Vec<String>,
    ) -> RemovalOutcome {
        let mut outcome = RemovalOutcome::default();
        for chunk in stale.chunks(self.batch_size) {
            match repo.delete_by_ids(source, chunk).await {
                Ok(()) => outcome.removed += chunk.len() as u64,
                Err(err) => {
                    warn!(
                        target = "sync.db",
                        size = chunk.len(),
                        error = %err,
                        "stale batch delete failed"
                    );
                    outcome.errors += chunk.len() as u64;
                }
            }
        }
        outcome
    }
}

/// Ids present in storage but absent from the incoming snapshot.
pub fn stale_ids(existing: &HashMap<String, u64>, incoming: &[VehicleRecord]) -> Vec<String> {
    let seen: std::collections::HashSet<&str> = incoming
        .iter()
        .map(|record| record.source_id.as_str())
        .collect();
    let mut stale: Vec<String> = existing
        .keys()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();
    stale.sort();
    stale
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryRepo;
    use super::*;
    use crate::models::{AuctionStatus, BodyType, FuelType, Transmission};
    use chrono::Utc;

    fn record(id: &str, price: i64) -> VehicleRecord {
        let now = Utc::now();
        VehicleRecord {
            source: Source::Korea,
            source_id: id.to_string(),
            source_url: None,
            make: "Kia".into(),
            model: "Sorento".into(),
            grade: None,
            year: Some(2022),
            mileage: Some(10_000),
            engine_cc: Some(2200),
            fuel_type: FuelType::Diesel,
            transmission: Transmission::Automatic,
            drive_type: None,
            body_type: BodyType::Suv,
            color: None,
            start_price_usd: Some(price),
            current_price_usd: Some(price),
            original_price: None,
            original_currency: None,
            auction_status: AuctionStatus::Ongoing,
            auction_platform: None,
            is_visible: true,
            images: vec!["https://img/1.jpg".into()],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn first_pass_adds_everything() {
        let repo = MemoryRepo::default();
        let engine = DiffEngine::new(2);
        let existing = repo.existing_index(Source::Korea).await.unwrap();
        let outcome = engine
            .apply_snapshot(
                &repo,
                &existing,
                vec![record("a", 1), record("b", 2), record("c", 3)],
            )
            .await;
        assert_eq!(outcome.added, 3);
        assert_eq!(outcome.updated, 0);
        assert_eq!(repo.ids(Source::Korea).len(), 3);
    }

    #[tokio::test]
    async fn rerun_over_unchanged_feed_writes_nothing() {
        let repo = MemoryRepo::default();
        let engine = DiffEngine::new(100);
        let batch = vec![record("a", 1), record("b", 2)];

        let existing = repo.existing_index(Source::Korea).await.unwrap();
        engine.apply_snapshot(&repo, &existing, batch.clone()).await;

        let existing = repo.existing_index(Source::Korea).await.unwrap();
        let outcome = engine.apply_snapshot(&repo, &existing, batch).await;
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.unchanged, 2);
    }

    #[tokio::test]
    async fn content_change_counts_as_update() {
        let repo = MemoryRepo::default();
        let engine = DiffEngine::new(100);
        let existing = repo.existing_index(Source::Korea).await.unwrap();
        engine
            .apply_snapshot(&repo, &existing, vec![record("a", 1)])
            .await;

        let existing = repo.existing_index(Source::Korea).await.unwrap();
        let outcome = engine
            .apply_snapshot(&repo, &existing, vec![record("a", 99)])
            .await;
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.added, 0);
    }

    #[tokio::test]
    async fn failed_batch_is_isolated() {
        let repo = MemoryRepo::default();
        let engine = DiffEngine::new(100);
        *repo.fail_upserts.lock().unwrap() = true;
        let existing = repo.existing_index(Source::Korea).await.unwrap();
        let outcome = engine
            .apply_snapshot(&repo, &existing, vec![record("a", 1), record("b", 2)])
            .await;
        assert_eq!(outcome.errors, 2);
        assert_eq!(outcome.added, 0);
        assert!(repo.ids(Source::Korea).is_empty());
    }

    #[tokio::test]
    async fn stale_removal_matches_set_difference() {
        let repo = MemoryRepo::default();
        let engine = DiffEngine::new(100);
        let existing = repo.existing_index(Source::Korea).await.unwrap();
        engine
            .apply_snapshot(
                &repo,
                &existing,
                vec![record("a", 1), record("d", 4), record("x", 9)],
            )
            .await;

        let incoming = vec![record("a", 1), record("x", 9)];
        let existing = repo.existing_index(Source::Korea).await.unwrap();
        let stale = stale_ids(&existing, &incoming);
        assert_eq!(stale, vec!["d".to_string()]);

        let removal = engine.remove_stale(&repo, Source::Korea, stale).await;
        assert_eq!(removal.removed, 1);
        assert_eq!(repo.ids(Source::Korea), vec!["a", "x"]);
    }
}
