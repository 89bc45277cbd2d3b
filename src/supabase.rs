use crate::diff::VehicleRepository;
use crate::http::build_client;
use crate::models::{Source, SyncMode, SyncStats, VehicleContent, VehicleRecord};
use crate::sync::SyncError;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

/// Cursor row in `sync_config`, keyed by provider slug so providers that
/// share a region (dongchedi, che168) keep separate cursors. Upserted after
/// every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: String,
    #[serde(default)]
    pub last_change_id: Option<i64>,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub total_vehicles: Option<i64>,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SupabaseError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SupabaseError::Unauthorized(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SupabaseError::Request(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }

    /// All stored rows of a source, paged through PostgREST `Range` headers.
    pub async fn fetch_vehicle_contents(
        &self,
        source: Source,
    ) -> Result<Vec<VehicleContent>, SupabaseError> {
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let url = format!(
                "{}/rest/v1/vehicles?source=eq.{}&select=*&order=source_id.asc",
                self.base_url, source
            );
            let response = self
                .request(Method::GET, url)
                .header("Range-Unit", "items")
                .header("Range", format!("{}-{}", offset, offset + PAGE_SIZE - 1))
                .send()
                .await
                .map_err(|err| SupabaseError::Request(err.to_string()))?;
            let page: Vec<VehicleContent> = Self::check(response)
                .await?
                .json()
                .await
                .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        debug!(target = "sync.db", %source, rows = rows.len(), "fetched stored vehicles");
        Ok(rows)
    }

    pub async fn upsert_vehicles(&self, records: &[VehicleRecord]) -> Result<(), SupabaseError> {
        if records.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/rest/v1/vehicles?on_conflict=source,source_id",
            self.base_url
        );
        let response = self
            .request(Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(records)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        Self::check(response).await.map(drop)
    }

    pub async fn delete_vehicles(
        &self,
        source: Source,
        source_ids: &[String],
    ) -> Result<(), SupabaseError> {
        if source_ids.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = source_ids.iter().map(|id| format!("\"{id}\"")).collect();
        let filter = format!("({})", quoted.join(","));
        let url = format!(
            "{}/rest/v1/vehicles?source=eq.{}&source_id=in.{}",
            self.base_url,
            source,
            urlencoding::encode(&filter),
        );
        let response = self
            .request(Method::DELETE, url)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        Self::check(response).await.map(drop)
    }

    async fn patch_vehicle(
        &self,
        source: Source,
        source_id: &str,
        body: serde_json::Value,
    ) -> Result<(), SupabaseError> {
        let url = format!(
            "{}/rest/v1/vehicles?source=eq.{}&source_id=eq.{}",
            self.base_url,
            source,
            urlencoding::encode(source_id),
        );
        let response = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        Self::check(response).await.map(drop)
    }

    pub async fn update_vehicle_price(
        &self,
        source: Source,
        source_id: &str,
        price_usd: i64,
    ) -> Result<(), SupabaseError> {
        self.patch_vehicle(
            source,
            source_id,
            json!({ "current_price_usd": price_usd, "updated_at": Utc::now() }),
        )
        .await
    }

    pub async fn update_vehicle_images(
        &self,
        source: Source,
        source_id: &str,
        images: &[String],
    ) -> Result<(), SupabaseError> {
        self.patch_vehicle(
            source,
            source_id,
            json!({ "images": images, "updated_at": Utc::now() }),
        )
        .await
    }

    /// Removed listings are kept but flagged sold and hidden.
    pub async fn mark_vehicle_sold(
        &self,
        source: Source,
        source_id: &str,
    ) -> Result<(), SupabaseError> {
        self.patch_vehicle(
            source,
            source_id,
            json!({
                "auction_status": "sold",
                "is_visible": false,
                "updated_at": Utc::now(),
            }),
        )
        .await
    }

    pub async fn count_vehicles(&self, source: Source) -> Result<i64, SupabaseError> {
        let url = format!(
            "{}/rest/v1/vehicles?source=eq.{}&select=source_id",
            self.base_url, source
        );
        let response = self
            .request(Method::GET, url)
            .header("Prefer", "count=exact")
            .header("Range", "0-0")
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        let response = Self::check(response).await?;
        let total = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(|range| range.rsplit('/').next())
            .and_then(|total| total.parse::<i64>().ok())
            .ok_or_else(|| SupabaseError::Deserialize("missing content-range".into()))?;
        Ok(total)
    }

    pub async fn get_checkpoint(&self, slug: &str) -> Result<Option<Checkpoint>, SupabaseError> {
        let url = format!(
            "{}/rest/v1/sync_config?source=eq.{}&select=*&limit=1",
            self.base_url,
            urlencoding::encode(slug),
        );
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        let mut rows: Vec<Checkpoint> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        Ok(rows.pop())
    }

    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), SupabaseError> {
        let url = format!("{}/rest/v1/sync_config?on_conflict=source", self.base_url);
        let response = self
            .request(Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(checkpoint)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        Self::check(response).await.map(drop)
    }

    pub async fn create_run(&self, slug: &str, mode: SyncMode) -> Result<String, SupabaseError> {
        let run_id = Uuid::new_v4().to_string();
        let url = format!("{}/rest/v1/sync_runs", self.base_url);
        let response = self
            .request(Method::POST, url)
            .header("Prefer", "return=minimal")
            .json(&json!({
                "id": run_id,
                "source": slug,
                "mode": mode,
                "status": "running",
                "started_at": Utc::now(),
            }))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        Self::check(response).await?;
        Ok(run_id)
    }

    pub async fn finish_run(
        &self,
        run_id: &str,
        status: &str,
        stats: &SyncStats,
    ) -> Result<(), SupabaseError> {
        let url = format!(
            "{}/rest/v1/sync_runs?id=eq.{}",
            self.base_url,
            urlencoding::encode(run_id),
        );
        let response = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=minimal")
            .json(&json!({
                "status": status,
                "finished_at": Utc::now(),
                "stats": stats,
            }))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        Self::check(response).await.map(drop)
    }

    pub async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), SupabaseError> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path);
        let response = self
            .request(Method::POST, url)
            .header("x-upsert", "true")
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        Self::check(response).await.map(drop)
    }

    pub fn public_object_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, bucket, path
        )
    }

    pub fn public_url_prefix(&self, bucket: &str) -> String {
        format!("{}/storage/v1/object/public/{}/", self.base_url, bucket)
    }
}

fn db_error(err: SupabaseError) -> SyncError {
    match err {
        SupabaseError::Unauthorized(detail) => SyncError::auth("db", detail),
        other => SyncError::transient("db", other.to_string()),
    }
}

impl VehicleRepository for SupabaseClient {
    async fn existing_index(&self, source: Source) -> Result<HashMap<String, u64>, SyncError> {
        let rows = self
            .fetch_vehicle_contents(source)
            .await
            .map_err(db_error)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let fingerprint = row.fingerprint();
                (row.source_id, fingerprint)
            })
            .collect())
    }

    async fn upsert_batch(&self, records: &[VehicleRecord]) -> Result<(), SyncError> {
        self.upsert_vehicles(records).await.map_err(db_error)
    }

    async fn delete_by_ids(&self, source: Source, ids: &[String]) -> Result<(), SyncError> {
        self.delete_vehicles(source, ids).await.map_err(db_error)
    }
}
