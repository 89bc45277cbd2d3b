use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DefaultOnError, serde_as};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Marketplace a listing originated from. Serialized as the canonical
/// region string stored in the `vehicles.source` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Korea,
    China,
    Dubai,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Korea => "korea",
            Source::China => "china",
            Source::Dubai => "dubai",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transmission {
    #[default]
    Automatic,
    Manual,
    Cvt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuelType {
    #[default]
    Petrol,
    Diesel,
    Electric,
    Hybrid,
    Lpg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    Suv,
    Sedan,
    Hatchback,
    Minivan,
    Pickup,
    Coupe,
    Convertible,
    Wagon,
    Van,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    Fwd,
    Rwd,
    Awd,
    #[serde(rename = "4wd")]
    FourWd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Ongoing,
    Sold,
    Ended,
}

/// Canonical listing row. `(source, source_id)` is the sole identity used
/// for upsert and removal detection and is immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub source: Source,
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub make: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    pub year: Option<i32>,
    pub mileage: Option<i64>,
    pub engine_cc: Option<i32>,
    pub fuel_type: FuelType,
    pub transmission: Transmission,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_type: Option<DriveType>,
    pub body_type: BodyType,
    pub color: Option<String>,
    pub start_price_usd: Option<i64>,
    pub current_price_usd: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_currency: Option<String>,
    pub auction_status: AuctionStatus,
    /// Set when several marketplaces share one `source` region (che168 and
    /// Dongchedi both write `china`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auction_platform: Option<String>,
    pub is_visible: bool,
    pub images: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VehicleRecord {
    /// Fingerprint over the content fields only (no timestamps), so an
    /// unchanged listing re-seen on the next run hashes identically.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        hash_content(
            &mut hasher,
            self.source,
            &self.source_id,
            &self.make,
            &self.model,
            &self.grade,
            self.year,
            self.mileage,
            self.engine_cc,
            self.fuel_type,
            self.transmission,
            self.drive_type,
            self.body_type,
            &self.color,
            self.start_price_usd,
            self.current_price_usd,
            self.original_price,
            &self.original_currency,
            &self.auction_platform,
            &self.images,
        );
        hasher.finish()
    }
}

/// The subset of stored columns that participates in change detection.
/// Rows written by older tooling may carry non-canonical enum values
/// (`gasoline`, `AT`, ...); those fields decode to the importers' fallback
/// variants instead of failing the whole page, so one legacy row never
/// poisons a run. At worst such a row fingerprints differently and gets
/// rewritten.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct VehicleContent {
    pub source: Source,
    pub source_id: String,
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub mileage: Option<i64>,
    #[serde(default)]
    pub engine_cc: Option<i32>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub fuel_type: FuelType,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub transmission: Transmission,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub drive_type: Option<DriveType>,
    #[serde(default)]
    #[serde_as(as = "DefaultOnError")]
    pub body_type: BodyType,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub start_price_usd: Option<i64>,
    #[serde(default)]
    pub current_price_usd: Option<i64>,
    #[serde(default)]
    pub original_price: Option<f64>,
    #[serde(default)]
    pub original_currency: Option<String>,
    #[serde(default)]
    pub auction_platform: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl VehicleContent {
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        hash_content(
            &mut hasher,
            self.source,
            &self.source_id,
            &self.make,
            &self.model,
            &self.grade,
            self.year,
            self.mileage,
            self.engine_cc,
            self.fuel_type,
            self.transmission,
            self.drive_type,
            self.body_type,
            &self.color,
            self.start_price_usd,
            self.current_price_usd,
            self.original_price,
            &self.original_currency,
            &self.auction_platform,
            &self.images,
        );
        hasher.finish()
    }
}

#[allow(clippy::too_many_arguments)]
fn hash_content(
    hasher: &mut DefaultHasher,
    source: Source,
    source_id: &str,
    make: &str,
    model: &str,
    grade: &Option<String>,
    year: Option<i32>,
    mileage: Option<i64>,
    engine_cc: Option<i32>,
    fuel_type: FuelType,
    transmission: Transmission,
    drive_type: Option<DriveType>,
    body_type: BodyType,
    color: &Option<String>,
    start_price_usd: Option<i64>,
    current_price_usd: Option<i64>,
    original_price: Option<f64>,
    original_currency: &Option<String>,
    auction_platform: &Option<String>,
    images: &[String],
) {
    source.as_str().hash(hasher);
    source_id.hash(hasher);
    make.hash(hasher);
    model.hash(hasher);
    grade.hash(hasher);
    year.hash(hasher);
    mileage.hash(hasher);
    engine_cc.hash(hasher);
    fuel_type.hash(hasher);
    transmission.hash(hasher);
    drive_type.hash(hasher);
    body_type.hash(hasher);
    color.hash(hasher);
    start_price_usd.hash(hasher);
    current_price_usd.hash(hasher);
    original_price.map(f64::to_bits).hash(hasher);
    original_currency.hash(hasher);
    auction_platform.hash(hasher);
    images.hash(hasher);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

/// Body of `POST /sync/{source}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncRequest {
    pub mode: SyncMode,
    pub max_pages: Option<u32>,
    pub batch_size: Option<usize>,
    pub remove_expired: Option<bool>,
    pub change_id: Option<i64>,
    pub date: Option<String>,
}

/// Body of `POST /sync/{source}/photos`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhotoSyncRequest {
    pub date: Option<String>,
    pub limit: Option<usize>,
    pub dry_run: bool,
}

/// Running counters for one sync. Nothing is silently dropped: every record
/// that does not land in the inventory shows up in `skipped` or `errors`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub processed: u64,
    pub deduplicated: u64,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    pub skipped: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    pub source: Source,
    pub mode: SyncMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub stats: SyncStats,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PhotoSyncStats {
    pub total_rows: u64,
    pub valid_rows: u64,
    pub processed: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoSyncResponse {
    pub success: bool,
    pub source: Source,
    pub date: String,
    pub dry_run: bool,
    pub stats: PhotoSyncStats,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// Helpers for the loosely typed provider payloads: the same field arrives
// as a number on one endpoint and a numeric string on another.

pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }
}

pub fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> VehicleRecord {
        VehicleRecord {
            source: Source::China,
            source_id: "10042".into(),
            source_url: Some("https://example.com/10042".into()),
            make: "BYD".into(),
            model: "Seal".into(),
            grade: Some("Premium".into()),
            year: Some(2023),
            mileage: Some(12_000),
            engine_cc: None,
            fuel_type: FuelType::Electric,
            transmission: Transmission::Automatic,
            drive_type: Some(DriveType::Rwd),
            body_type: BodyType::Sedan,
            color: Some("blue".into()),
            start_price_usd: Some(24_500),
            current_price_usd: Some(24_500),
            original_price: Some(175_000.0),
            original_currency: Some("CNY".into()),
            auction_status: AuctionStatus::Ongoing,
            auction_platform: None,
            is_visible: true,
            images: vec!["https://cdn.example.com/a.jpg".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn fingerprint_ignores_timestamps() {
        let a = record();
        let mut b = a.clone();
        b.created_at = Utc::now() + chrono::Duration::days(3);
        b.updated_at = b.created_at;
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_tracks_price_and_images() {
        let a = record();
        let mut b = a.clone();
        b.current_price_usd = Some(23_900);
        assert_ne!(a.fingerprint(), b.fingerprint());

        let mut c = a.clone();
        c.images.push("https://cdn.example.com/b.jpg".into());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn stored_content_matches_record_fingerprint() {
        let rec = record();
        let row = serde_json::to_value(&rec).unwrap();
        let content: VehicleContent = serde_json::from_value(row).unwrap();
        assert_eq!(content.fingerprint(), rec.fingerprint());
    }

    #[test]
    fn legacy_rows_decode_with_fallback_enums() {
        // One pre-migration row in a page must not fail the whole page.
        let page: Vec<VehicleContent> = serde_json::from_value(json!([
            {
                "source": "china",
                "source_id": "ok1",
                "fuel_type": "diesel",
                "transmission": "manual",
                "body_type": "suv",
            },
            {
                "source": "china",
                "source_id": "legacy1",
                "fuel_type": "gasoline",
                "transmission": "AT",
                "drive_type": "4x4",
                "body_type": "SUV",
            },
        ]))
        .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].fuel_type, FuelType::Diesel);
        assert_eq!(page[1].fuel_type, FuelType::Petrol);
        assert_eq!(page[1].transmission, Transmission::Automatic);
        assert_eq!(page[1].drive_type, None);
        assert_eq!(page[1].body_type, BodyType::Other);
    }

    #[test]
    fn drive_type_wire_reprs() {
        assert_eq!(serde_json::to_string(&DriveType::FourWd).unwrap(), "\"4wd\"");
        assert_eq!(
            serde_json::from_str::<DriveType>("\"awd\"").unwrap(),
            DriveType::Awd
        );
    }

    #[test]
    fn sync_request_accepts_camel_case_body() {
        let req: SyncRequest = serde_json::from_value(json!({
            "mode": "incremental",
            "maxPages": 20,
            "removeExpired": false,
        }))
        .unwrap();
        assert_eq!(req.mode, SyncMode::Incremental);
        assert_eq!(req.max_pages, Some(20));
        assert_eq!(req.remove_expired, Some(false));
    }

    #[test]
    fn lenient_value_parsing() {
        assert_eq!(value_to_i64(&json!("2021")), Some(2021));
        assert_eq!(value_to_i64(&json!(2021)), Some(2021));
        assert_eq!(value_to_i64(&json!("12.7")), Some(12));
        assert_eq!(value_to_f64(&json!("1.6")), Some(1.6));
        assert_eq!(value_to_string(&json!(77)), Some("77".to_string()));
        assert_eq!(value_to_string(&json!("  ")), None);
    }
}
