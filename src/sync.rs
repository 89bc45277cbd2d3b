use crate::config::SyncConfig;
use crate::diff::{DiffEngine, VehicleRepository, stale_ids};
use crate::export::{ExportClient, ExportRow, export_date};
use crate::feed::{ChangeFeedReader, ChangeType, OfferEnvelope, Snapshot, offer_identity};
use crate::metrics;
use crate::models::{
    PhotoSyncRequest, PhotoSyncResponse, PhotoSyncStats, Source, SyncMode, SyncRequest,
    SyncResponse, SyncStats, VehicleRecord,
};
use crate::photos::{PhotoCache, RefreshPlan, finalize_refresh, plan_refresh};
use crate::sources::{SourceAdapter, adapter_for};
use crate::supabase::{Checkpoint, SupabaseClient};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Network or upstream 5xx trouble; retrying can help.
    TransientNetwork,
    /// Credentials rejected. Retrying cannot help.
    Auth,
    MalformedRecord,
    StorageUpload,
    RateLimited,
    /// The daily export file has not been published yet.
    ExportUnavailable,
    InvalidInput,
    Internal,
}

/// Failure of one pipeline stage. `stage` names where it happened (`feed`,
/// `export`, `photos`, `db`, `run`), `kind` drives retry and HTTP mapping.
#[derive(Debug, Error)]
#[error("{stage}: {message}")]
pub struct SyncError {
    stage: &'static str,
    message: String,
    kind: SyncErrorKind,
}

impl SyncError {
    fn new(stage: &'static str, message: impl Into<String>, kind: SyncErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn transient(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, SyncErrorKind::TransientNetwork)
    }

    pub fn auth(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, SyncErrorKind::Auth)
    }

    pub fn malformed(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, SyncErrorKind::MalformedRecord)
    }

    pub fn storage(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, SyncErrorKind::StorageUpload)
    }

    pub fn rate_limited(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, SyncErrorKind::RateLimited)
    }

    pub fn export_unavailable(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, SyncErrorKind::ExportUnavailable)
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, SyncErrorKind::InvalidInput)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, SyncErrorKind::Internal)
    }

    pub fn kind(&self) -> SyncErrorKind {
        self.kind
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            SyncErrorKind::TransientNetwork | SyncErrorKind::RateLimited
        )
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == SyncErrorKind::Auth
    }
}

/// Seam for per-record image refreshing, so the snapshot pipeline can run
/// in tests without storage. Failures degrade to dropped images, never to
/// an aborted run.
#[allow(async_fn_in_trait)]
pub trait ImageFetcher {
    async fn refresh(&self, source_id: &str, plan: &RefreshPlan) -> (Vec<String>, u64, u64);
}

impl ImageFetcher for PhotoCache {
    async fn refresh(&self, source_id: &str, plan: &RefreshPlan) -> (Vec<String>, u64, u64) {
        match self.execute(source_id, plan).await {
            Ok(result) => result,
            Err(err) => {
                warn!(target = "sync.photos", source_id, error = %err, "image refresh aborted");
                let failed = vec![None; plan.to_fetch as usize];
                (finalize_refresh(plan, failed), 0, plan.to_fetch)
            }
        }
    }
}

/// Drives one sync end to end: feed pagination, normalization, image
/// policy, diffing against storage, removal, and checkpointing.
pub struct Orchestrator {
    config: Arc<SyncConfig>,
    supabase: Arc<SupabaseClient>,
    reader: ChangeFeedReader,
    photos: PhotoCache,
}

impl Orchestrator {
    pub fn new(config: Arc<SyncConfig>, supabase: Arc<SupabaseClient>) -> Self {
        let reader = ChangeFeedReader::new(&config);
        let photos = PhotoCache::new(&config, supabase.clone());
        Self {
            config,
            supabase,
            reader,
            photos,
        }
    }

    pub async fn run(&self, slug: &str, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        let adapter = adapter_for(slug, &self.config)
            .ok_or_else(|| SyncError::invalid_input("run", format!("unknown source `{slug}`")))?;
        let source = adapter.source();
        let started = Instant::now();
        info!(
            target = "sync.run",
            %source,
            mode = request.mode.as_str(),
            phase = "started",
            "sync started"
        );

        let run_id = match self.supabase.create_run(adapter.slug(), request.mode).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(target = "sync.run", %source, error = %err, "could not record run");
                None
            }
        };

        let result = match request.mode {
            SyncMode::Full => self.run_full(adapter.as_ref(), &request).await,
            SyncMode::Incremental => self.run_incremental(adapter.as_ref(), &request).await,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        metrics::run_elapsed(adapter.slug(), started.elapsed().as_millis());

        match result {
            Ok((stats, last_change_id)) => {
                let status = if stats.errors == 0 {
                    "completed"
                } else {
                    "partial"
                };
                if let Some(id) = &run_id {
                    if let Err(err) = self.supabase.finish_run(id, status, &stats).await {
                        warn!(target = "sync.run", %source, error = %err, "could not close run row");
                    }
                }
                self.save_checkpoint(adapter.as_ref(), last_change_id).await;
                info!(
                    target = "sync.run",
                    %source,
                    phase = "completed",
                    added = stats.added,
                    updated = stats.updated,
                    removed = stats.removed,
                    skipped = stats.skipped,
                    errors = stats.errors,
                    duration_ms,
                    "sync completed"
                );
                Ok(SyncResponse {
                    success: true,
                    source,
                    mode: request.mode,
                    run_id,
                    stats,
                    duration_ms,
                    last_change_id,
                })
            }
            Err(err) => {
                if let Some(id) = &run_id {
                    if let Err(finish_err) = self
                        .supabase
                        .finish_run(id, "failed", &SyncStats::default())
                        .await
                    {
                        warn!(target = "sync.run", %source, error = %finish_err, "could not close run row");
                    }
                }
                error!(
                    target = "sync.run",
                    %source,
                    phase = "failed",
                    stage = err.stage(),
                    error = %err,
                    duration_ms,
                    "sync failed"
                );
                Err(err)
            }
        }
    }

    /// Current cursor and counters of a source, for `GET /sync/{source}`.
    pub async fn status(&self, slug: &str) -> Result<Checkpoint, SyncError> {
        let adapter = adapter_for(slug, &self.config)
            .ok_or_else(|| SyncError::invalid_input("run", format!("unknown source `{slug}`")))?;
        let checkpoint = self
            .supabase
            .get_checkpoint(adapter.slug())
            .await
            .map_err(|err| SyncError::transient("db", err.to_string()))?;
        Ok(checkpoint.unwrap_or(Checkpoint {
            source: adapter.slug().to_string(),
            last_change_id: None,
            last_sync_at: None,
            status: None,
            total_vehicles: None,
        }))
    }

    async fn run_full(
        &self,
        adapter: &dyn SourceAdapter,
        request: &SyncRequest,
    ) -> Result<(SyncStats, Option<i64>), SyncError> {
        let max_pages = self.config.clamp_max_pages(request.max_pages);
        info!(
            target = "sync.run",
            source = %adapter.source(),
            max_pages,
            phase = "fetching",
            "collecting snapshot"
        );
        let snapshot = self.reader.collect_snapshot(adapter, max_pages).await?;
        metrics::pages_fetched(adapter.slug(), snapshot.pages_fetched);

        // Deleting what a truncated snapshot did not see would wipe live
        // inventory, so removal only runs off a complete walk.
        let complete = snapshot_complete(&snapshot);
        let allow_removal = request.remove_expired.unwrap_or(true) && complete;
        if request.remove_expired.unwrap_or(true) && !complete {
            warn!(
                target = "sync.run",
                source = %adapter.source(),
                pages = snapshot.pages_fetched,
                page_errors = snapshot.page_errors,
                "snapshot may be incomplete, skipping removal"
            );
        }

        let export = self.load_export(adapter, request.date.as_deref()).await?;

        let engine = DiffEngine::new(self.config.clamp_batch_size(request.batch_size));
        info!(
            target = "sync.run",
            source = %adapter.source(),
            offers = snapshot.offers.len(),
            phase = "diffing",
            "applying snapshot"
        );
        let stats = apply_full_snapshot(
            adapter,
            self.supabase.as_ref(),
            &engine,
            &self.photos,
            &self.photos.storage_host(),
            snapshot,
            export.as_ref(),
            allow_removal,
            Utc::now(),
        )
        .await?;
        Ok((stats, None))
    }

    async fn run_incremental(
        &self,
        adapter: &dyn SourceAdapter,
        request: &SyncRequest,
    ) -> Result<(SyncStats, Option<i64>), SyncError> {
        let source = adapter.source();
        if adapter.changes_url(0).is_none() {
            return Err(SyncError::invalid_input(
                "run",
                format!("source `{source}` has no change feed"),
            ));
        }

        let start = match request.change_id {
            Some(id) => id,
            None => {
                let stored = self
                    .supabase
                    .get_checkpoint(adapter.slug())
                    .await
                    .map_err(|err| SyncError::transient("db", err.to_string()))?
                    .and_then(|cp| cp.last_change_id);
                match (stored, &request.date) {
                    (Some(id), _) => id,
                    (None, Some(date)) => {
                        let url = adapter.change_id_url(date).ok_or_else(|| {
                            SyncError::invalid_input("run", "source cannot resolve a date cursor")
                        })?;
                        self.reader.fetch_change_id(&url).await?
                    }
                    (None, None) => {
                        return Err(SyncError::invalid_input(
                            "run",
                            "no stored cursor; pass changeId or date",
                        ));
                    }
                }
            }
        };

        info!(
            target = "sync.run",
            %source,
            change_id = start,
            phase = "fetching",
            "collecting changes"
        );
        let batch = self
            .reader
            .collect_changes(adapter, start, self.config.clamp_max_pages(request.max_pages))
            .await?;
        metrics::pages_fetched(adapter.slug(), batch.pages_fetched);

        let mut stats = SyncStats {
            processed: batch.changes.len() as u64,
            deduplicated: batch.changes.len() as u64,
            errors: batch.page_errors,
            ..SyncStats::default()
        };
        let existing = self.supabase.existing_index(source).await?;
        let engine = DiffEngine::new(self.config.clamp_batch_size(request.batch_size));
        let storage_host = self.photos.storage_host();
        let now = Utc::now();

        let mut added_offers = Vec::new();
        for envelope in &batch.changes {
            match envelope.change_type {
                ChangeType::Added => added_offers.push(envelope.clone()),
                ChangeType::Changed => {
                    self.apply_price_change(adapter, &existing, envelope, &mut stats)
                        .await;
                }
                ChangeType::Removed => {
                    let Some(inner_id) = offer_identity(envelope) else {
                        stats.errors += 1;
                        continue;
                    };
                    let source_id = adapter.source_id(&inner_id);
                    match self.supabase.mark_vehicle_sold(source, &source_id).await {
                        Ok(()) => stats.removed += 1,
                        Err(err) => {
                            warn!(target = "sync.run", %source, source_id, error = %err, "could not mark sold");
                            stats.errors += 1;
                        }
                    }
                }
                ChangeType::Unknown => stats.skipped += 1,
            }
        }

        let (records, _skipped_ids) = normalize_offers(
            adapter,
            &self.photos,
            &storage_host,
            &added_offers,
            None,
            now,
            &mut stats,
        )
        .await;
        let outcome = engine
            .apply_snapshot(self.supabase.as_ref(), &existing, records)
            .await;
        stats.added += outcome.added;
        stats.updated += outcome.updated;
        stats.errors += outcome.errors;

        Ok((stats, Some(batch.last_change_id)))
    }

    async fn apply_price_change(
        &self,
        adapter: &dyn SourceAdapter,
        existing: &HashMap<String, u64>,
        envelope: &OfferEnvelope,
        stats: &mut SyncStats,
    ) {
        let source = adapter.source();
        let Some(inner_id) = offer_identity(envelope) else {
            stats.errors += 1;
            return;
        };
        let source_id = adapter.source_id(&inner_id);
        if !existing.contains_key(&source_id) {
            debug!(target = "sync.run", %source, source_id, "change for unknown vehicle");
            stats.skipped += 1;
            return;
        }
        let Some(price_usd) = adapter.price_update(&envelope.data) else {
            stats.skipped += 1;
            return;
        };
        match self
            .supabase
            .update_vehicle_price(source, &source_id, price_usd)
            .await
        {
            Ok(()) => stats.updated += 1,
            Err(err) => {
                warn!(target = "sync.run", %source, source_id, error = %err, "price update failed");
                stats.errors += 1;
            }
        }
    }

    /// Best-effort load of the daily export for sources that have one. A
    /// missing file or credentials means the feed's own image URLs stand.
    async fn load_export(
        &self,
        adapter: &dyn SourceAdapter,
        date: Option<&str>,
    ) -> Result<Option<HashMap<String, ExportRow>>, SyncError> {
        let Some(provider) = adapter.export_provider() else {
            return Ok(None);
        };
        let Some(client) = ExportClient::from_provider(self.config.provider(adapter.source()))
        else {
            debug!(
                target = "sync.photos",
                source = %adapter.source(),
                "export credentials not configured"
            );
            return Ok(None);
        };
        let date = resolve_export_date(date)?;
        match client.fetch_active_offers(provider, date).await {
            Ok(rows) => Ok(Some(rows)),
            Err(err) if err.kind() == SyncErrorKind::ExportUnavailable => {
                warn!(
                    target = "sync.photos",
                    source = %adapter.source(),
                    %date,
                    "export not yet published, using feed images"
                );
                Ok(None)
            }
            Err(err) => {
                warn!(
                    target = "sync.photos",
                    source = %adapter.source(),
                    error = %err,
                    "export load failed, using feed images"
                );
                Ok(None)
            }
        }
    }

    /// Standalone photo refresh for `POST /sync/{source}/photos`. Unlike the
    /// full sync, a missing export file is an error here.
    pub async fn refresh_photos(
        &self,
        slug: &str,
        request: PhotoSyncRequest,
    ) -> Result<PhotoSyncResponse, SyncError> {
        let adapter = adapter_for(slug, &self.config)
            .ok_or_else(|| SyncError::invalid_input("run", format!("unknown source `{slug}`")))?;
        let source = adapter.source();
        let provider = adapter.export_provider().ok_or_else(|| {
            SyncError::invalid_input("run", format!("source `{source}` has no photo export"))
        })?;
        let client = ExportClient::from_provider(self.config.provider(source)).ok_or_else(
            || SyncError::invalid_input("run", "export credentials not configured"),
        )?;
        let date = resolve_export_date(request.date.as_deref())?;

        let rows = client.fetch_active_offers(provider, date).await?;
        let mut stats = PhotoSyncStats {
            total_rows: rows.len() as u64,
            ..PhotoSyncStats::default()
        };

        let stored = self
            .supabase
            .fetch_vehicle_contents(source)
            .await
            .map_err(|err| SyncError::transient("db", err.to_string()))?;
        let storage_host = self.photos.storage_host();
        let now = Utc::now();
        let limit = request
            .limit
            .filter(|limit| *limit > 0)
            .unwrap_or(self.config.photo_sync_limit);
        let mut refreshed = 0usize;

        for vehicle in stored {
            let Some(row) = rows.get(&vehicle.source_id) else {
                continue;
            };
            stats.valid_rows += 1;
            let candidate = if row.images.is_empty() {
                vehicle.images.clone()
            } else {
                row.images.clone()
            };
            let plan = plan_refresh(&candidate, |url| {
                adapter.classify_link(url, row.synced_at, now, &storage_host)
            });

            if plan.to_fetch == 0 {
                let images = finalize_refresh(&plan, Vec::new());
                if images != vehicle.images && !request.dry_run {
                    stats.processed += 1;
                    if let Err(err) = self
                        .supabase
                        .update_vehicle_images(source, &vehicle.source_id, &images)
                        .await
                    {
                        warn!(target = "sync.photos", source_id = vehicle.source_id, error = %err, "image list update failed");
                        stats.errors += 1;
                    }
                } else {
                    stats.skipped += 1;
                }
                continue;
            }

            if refreshed >= limit {
                stats.skipped += 1;
                continue;
            }
            refreshed += 1;
            stats.processed += 1;
            if request.dry_run {
                continue;
            }

            let (images, uploaded, image_errors) =
                self.photos.refresh(&vehicle.source_id, &plan).await;
            stats.uploaded += uploaded;
            stats.errors += image_errors;
            if images != vehicle.images {
                if let Err(err) = self
                    .supabase
                    .update_vehicle_images(source, &vehicle.source_id, &images)
                    .await
                {
                    warn!(target = "sync.photos", source_id = vehicle.source_id, error = %err, "image list update failed");
                    stats.errors += 1;
                }
            }
        }

        metrics::images_cached(adapter.slug(), stats.uploaded);
        info!(
            target = "sync.photos",
            %source,
            %date,
            processed = stats.processed,
            uploaded = stats.uploaded,
            skipped = stats.skipped,
            errors = stats.errors,
            dry_run = request.dry_run,
            "photo refresh finished"
        );
        Ok(PhotoSyncResponse {
            success: true,
            source,
            date: date.to_string(),
            dry_run: request.dry_run,
            stats,
        })
    }

    async fn save_checkpoint(&self, adapter: &dyn SourceAdapter, last_change_id: Option<i64>) {
        let slug = adapter.slug();
        let previous = self.supabase.get_checkpoint(slug).await.ok().flatten();
        let total_vehicles = self.supabase.count_vehicles(adapter.source()).await.ok();
        let checkpoint = Checkpoint {
            source: slug.to_string(),
            last_change_id: last_change_id
                .or_else(|| previous.as_ref().and_then(|cp| cp.last_change_id)),
            last_sync_at: Some(Utc::now()),
            status: Some("idle".to_string()),
            total_vehicles,
        };
        if let Err(err) = self.supabase.save_checkpoint(&checkpoint).await {
            warn!(target = "sync.db", source = slug, error = %err, "checkpoint save failed");
        }
    }
}

/// A snapshot is complete when the API signalled its natural end and no
/// page failed, regardless of whether that happened right on the page cap.
fn snapshot_complete(snapshot: &Snapshot) -> bool {
    snapshot.page_errors == 0 && snapshot.exhausted
}

fn resolve_export_date(requested: Option<&str>) -> Result<NaiveDate, SyncError> {
    match requested {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| SyncError::invalid_input("run", format!("invalid date `{raw}`"))),
        None => Ok(export_date(Utc::now())),
    }
}

/// Normalize deduplicated offers into records, applying export images and
/// the per-image link policy. Records left with no usable image out of a
/// non-empty set are skipped, and their ids reported so removal leaves
/// their stored rows alone.
async fn normalize_offers<F: ImageFetcher>(
    adapter: &dyn SourceAdapter,
    fetcher: &F,
    storage_host: &str,
    offers: &[OfferEnvelope],
    export: Option<&HashMap<String, ExportRow>>,
    now: DateTime<Utc>,
    stats: &mut SyncStats,
) -> (Vec<VehicleRecord>, Vec<String>) {
    let mut records = Vec::new();
    let mut skipped_ids = Vec::new();

    for envelope in offers {
        if envelope.change_type == ChangeType::Removed {
            continue;
        }
        let mut record = match adapter.normalize(envelope) {
            Ok(record) => record,
            Err(reject) => {
                debug!(
                    target = "sync.run",
                    source = %adapter.source(),
                    error = %reject,
                    "offer rejected"
                );
                stats.errors += 1;
                continue;
            }
        };

        let mut synced_at = None;
        if let Some(export) = export {
            if let Some(row) = export.get(record.source_id.as_str()) {
                if !row.images.is_empty() {
                    record.images = row.images.clone();
                }
                synced_at = row.synced_at;
            }
        }

        let had_images = !record.images.is_empty();
        let plan = plan_refresh(&record.images, |url| {
            adapter.classify_link(url, synced_at, now, storage_host)
        });
        let (images, _uploaded, image_errors) = if plan.to_fetch > 0 {
            fetcher.refresh(&record.source_id, &plan).await
        } else {
            (finalize_refresh(&plan, Vec::new()), 0, 0)
        };

        // A record that lost its whole image set is skipped, not errored,
        // so its failed downloads do not double-count.
        if had_images && images.is_empty() {
            debug!(
                target = "sync.run",
                source_id = record.source_id,
                "no usable images, skipping"
            );
            stats.skipped += 1;
            skipped_ids.push(record.source_id);
            continue;
        }
        stats.errors += image_errors;
        record.images = images;
        records.push(record);
    }

    (records, skipped_ids)
}

/// The full-sync pipeline after pagination, factored off the orchestrator
/// so it can run against an in-memory repository.
#[allow(clippy::too_many_arguments)]
async fn apply_full_snapshot<R: VehicleRepository, F: ImageFetcher>(
    adapter: &dyn SourceAdapter,
    repo: &R,
    engine: &DiffEngine,
    fetcher: &F,
    storage_host: &str,
    snapshot: Snapshot,
    export: Option<&HashMap<String, ExportRow>>,
    allow_removal: bool,
    now: DateTime<Utc>,
) -> Result<SyncStats, SyncError> {
    let mut stats = SyncStats {
        processed: snapshot.processed,
        deduplicated: snapshot.offers.len() as u64,
        errors: snapshot.malformed + snapshot.page_errors,
        ..SyncStats::default()
    };

    let existing = repo.existing_index(adapter.source()).await?;
    let (records, skipped_ids) = normalize_offers(
        adapter,
        fetcher,
        storage_host,
        &snapshot.offers,
        export,
        now,
        &mut stats,
    )
    .await;

    let mut stale = stale_ids(&existing, &records);
    stale.retain(|id| adapter.owns_source_id(id) && !skipped_ids.contains(id));

    let outcome = engine.apply_snapshot(repo, &existing, records).await;
    stats.added += outcome.added;
    stats.updated += outcome.updated;
    stats.errors += outcome.errors;

    if allow_removal {
        let removal = engine.remove_stale(repo, adapter.source(), stale).await;
        stats.removed += removal.removed;
        stats.errors += removal.errors;
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::diff::testing::MemoryRepo;
    use crate::sources::{Che168Adapter, DongchediAdapter};
    use serde_json::json;

    struct NoFetch;

    impl ImageFetcher for NoFetch {
        async fn refresh(&self, _source_id: &str, plan: &RefreshPlan) -> (Vec<String>, u64, u64) {
            let failed = vec![None; plan.to_fetch as usize];
            (finalize_refresh(plan, failed), 0, plan.to_fetch)
        }
    }

    fn adapter() -> DongchediAdapter {
        DongchediAdapter::new(
            ProviderConfig {
                api_base: "https://api1.auto-api.com/api/v2/dongchedi".to_string(),
                api_key: "secret".to_string(),
                export_host: None,
                export_login: None,
                export_password: None,
            },
            6,
            24 * 3600,
        )
    }

    fn offer(inner_id: &str, image: &str) -> OfferEnvelope {
        serde_json::from_value(json!({
            "id": 1,
            "inner_id": inner_id,
            "change_type": "added",
            "data": {
                "inner_id": inner_id,
                "mark": "BYD",
                "model": "Seal",
                "year": 2023,
                "price": 150_000,
                "images": [image],
            },
        }))
        .unwrap()
    }

    const STORAGE: &str = "https://proj.supabase.co/storage/v1/object/public/vehicle-photos/";
    const GOOD: &str = "https://cdn.example.com/car.jpg?x-expires=9999999999";
    const BLOCKED: &str = "https://p1-dcd-sign.byteimg.com/car.jpg";

    /// Three pages of 100 sightings: 4 duplicate ids and 10 offers whose
    /// only image is on a blocked CDN.
    fn scenario_snapshot() -> Snapshot {
        let mut offers = Vec::new();
        for i in 0..286 {
            offers.push(offer(&format!("ok{i}"), GOOD));
        }
        for i in 0..10 {
            offers.push(offer(&format!("blocked{i}"), BLOCKED));
        }
        Snapshot {
            offers,
            processed: 300,
            duplicates: 4,
            malformed: 0,
            pages_fetched: 3,
            page_errors: 0,
            exhausted: true,
        }
    }

    #[tokio::test]
    async fn full_snapshot_counts_and_skips_blocked_only_offers() {
        let repo = MemoryRepo::default();
        let engine = DiffEngine::new(100);
        let stats = apply_full_snapshot(
            &adapter(),
            &repo,
            &engine,
            &NoFetch,
            STORAGE,
            scenario_snapshot(),
            None,
            true,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(stats.processed, 300);
        assert_eq!(stats.deduplicated, 296);
        assert_eq!(stats.skipped, 10);
        assert_eq!(stats.added, 286);
        assert_eq!(stats.updated, 0);
        assert_eq!(stats.removed, 0);
        assert_eq!(stats.errors, 0);
        assert_eq!(repo.ids(Source::China).len(), 286);
    }

    #[tokio::test]
    async fn rerun_of_unchanged_snapshot_is_idempotent() {
        let repo = MemoryRepo::default();
        let engine = DiffEngine::new(100);
        for expected_added in [286u64, 0] {
            let stats = apply_full_snapshot(
                &adapter(),
                &repo,
                &engine,
                &NoFetch,
                STORAGE,
                scenario_snapshot(),
                None,
                true,
                Utc::now(),
            )
            .await
            .unwrap();
            assert_eq!(stats.added, expected_added);
            assert_eq!(stats.updated, 0);
            assert_eq!(stats.skipped, 10);
            assert_eq!(stats.errors, 0);
        }
    }

    #[tokio::test]
    async fn stale_rows_are_removed_but_skipped_rows_are_kept() {
        let repo = MemoryRepo::default();
        let engine = DiffEngine::new(100);

        // Seed: one row that will vanish from the feed and one row whose
        // next sighting only carries a blocked image.
        let seed = vec![
            offer("gone", GOOD),
            offer("blocked0", GOOD),
            offer("ok0", GOOD),
        ];
        let mut stats = SyncStats::default();
        let (records, _) =
            normalize_offers(&adapter(), &NoFetch, STORAGE, &seed, None, Utc::now(), &mut stats)
                .await;
        let existing = repo.existing_index(Source::China).await.unwrap();
        engine.apply_snapshot(&repo, &existing, records).await;

        let next = Snapshot {
            offers: vec![offer("ok0", GOOD), offer("blocked0", BLOCKED)],
            processed: 2,
            duplicates: 0,
            malformed: 0,
            pages_fetched: 1,
            page_errors: 0,
            exhausted: true,
        };
        let stats = apply_full_snapshot(
            &adapter(),
            &repo,
            &engine,
            &NoFetch,
            STORAGE,
            next,
            None,
            true,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(stats.removed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(repo.ids(Source::China), vec!["blocked0", "ok0"]);
    }

    #[tokio::test]
    async fn removal_never_crosses_marketplaces_sharing_a_region() {
        let repo = MemoryRepo::default();
        let engine = DiffEngine::new(100);

        // Seed the shared china region with a che168 row.
        let che168 = Che168Adapter::new(ProviderConfig {
            api_base: "https://api1.auto-api.com/api/v2/che168".to_string(),
            api_key: "secret".to_string(),
            export_host: None,
            export_login: None,
            export_password: None,
        });
        let seed = Snapshot {
            offers: vec![offer("55021", GOOD)],
            processed: 1,
            duplicates: 0,
            malformed: 0,
            pages_fetched: 1,
            page_errors: 0,
            exhausted: true,
        };
        apply_full_snapshot(
            &che168,
            &repo,
            &engine,
            &NoFetch,
            STORAGE,
            seed,
            None,
            true,
            Utc::now(),
        )
        .await
        .unwrap();

        // A Dongchedi full sync that never lists the che168 id must not
        // remove it, even with removal enabled.
        let snapshot = Snapshot {
            offers: vec![offer("ok0", GOOD)],
            processed: 1,
            duplicates: 0,
            malformed: 0,
            pages_fetched: 1,
            page_errors: 0,
            exhausted: true,
        };
        let stats = apply_full_snapshot(
            &adapter(),
            &repo,
            &engine,
            &NoFetch,
            STORAGE,
            snapshot,
            None,
            true,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(stats.removed, 0);
        assert_eq!(repo.ids(Source::China), vec!["che168_55021", "ok0"]);
    }

    #[test]
    fn feed_ending_exactly_on_the_page_cap_still_completes() {
        let ended_on_cap = Snapshot {
            pages_fetched: 50,
            exhausted: true,
            ..Default::default()
        };
        assert!(snapshot_complete(&ended_on_cap));

        let truncated = Snapshot {
            pages_fetched: 50,
            exhausted: false,
            ..Default::default()
        };
        assert!(!snapshot_complete(&truncated));

        let failed_page = Snapshot {
            page_errors: 1,
            exhausted: true,
            ..Default::default()
        };
        assert!(!snapshot_complete(&failed_page));
    }

    #[tokio::test]
    async fn export_images_override_feed_images() {
        let repo = MemoryRepo::default();
        let engine = DiffEngine::new(100);
        let mut export = HashMap::new();
        export.insert(
            "ok0".to_string(),
            ExportRow {
                inner_id: "ok0".to_string(),
                images: vec![format!("{STORAGE}ok0/0.jpg")],
                synced_at: Some(Utc::now()),
            },
        );
        let snapshot = Snapshot {
            offers: vec![offer("ok0", BLOCKED)],
            processed: 1,
            duplicates: 0,
            malformed: 0,
            pages_fetched: 1,
            page_errors: 0,
            exhausted: true,
        };
        let stats = apply_full_snapshot(
            &adapter(),
            &repo,
            &engine,
            &NoFetch,
            STORAGE,
            snapshot,
            Some(&export),
            true,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(stats.added, 1);
        assert_eq!(stats.skipped, 0);
        let rows = repo.rows.lock().unwrap();
        assert_eq!(rows["ok0"].images, vec![format!("{STORAGE}ok0/0.jpg")]);
    }

    #[tokio::test]
    async fn sole_image_download_failure_skips_without_error() {
        // x-expires in the past forces a fetch, which NoFetch always fails.
        let expired = "https://cdn.example.com/car.jpg?x-expires=1000000000";
        let mut stats = SyncStats::default();
        let (records, skipped_ids) = normalize_offers(
            &adapter(),
            &NoFetch,
            STORAGE,
            &[offer("ok0", expired)],
            None,
            Utc::now(),
            &mut stats,
        )
        .await;
        assert!(records.is_empty());
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(skipped_ids, vec!["ok0".to_string()]);
    }

    #[tokio::test]
    async fn malformed_offers_count_as_errors() {
        let no_make: OfferEnvelope = serde_json::from_value(json!({
            "inner_id": "x1",
            "change_type": "added",
            "data": { "inner_id": "x1", "model": "Seal" },
        }))
        .unwrap();
        let mut stats = SyncStats::default();
        let (records, _) = normalize_offers(
            &adapter(),
            &NoFetch,
            STORAGE,
            &[no_make],
            None,
            Utc::now(),
            &mut stats,
        )
        .await;
        assert!(records.is_empty());
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn error_taxonomy_drives_retry_and_fatality() {
        assert!(SyncError::transient("feed", "503").is_retryable());
        assert!(SyncError::rate_limited("feed", "429").is_retryable());
        assert!(!SyncError::auth("feed", "401").is_retryable());
        assert!(SyncError::auth("feed", "401").is_fatal());
        assert!(!SyncError::export_unavailable("export", "404").is_retryable());
        assert!(!SyncError::malformed("feed", "bad json").is_retryable());
        assert_eq!(
            SyncError::invalid_input("run", "bad").kind(),
            SyncErrorKind::InvalidInput
        );
    }

    #[test]
    fn export_dates_parse_or_default() {
        assert!(resolve_export_date(Some("2026-08-29")).is_ok());
        assert!(resolve_export_date(Some("29/08/2026")).is_err());
        assert!(resolve_export_date(None).is_ok());
    }
}
