//! Per-provider adapters. Each source speaks the same auto-api.com envelope
//! protocol but with its own field types, currencies and quirks; the adapter
//! owns URL construction and normalization into [`VehicleRecord`].

mod che168;
mod dongchedi;
mod dubicars;
mod encar;

pub use che168::Che168Adapter;
pub use dongchedi::DongchediAdapter;
pub use dubicars::DubicarsAdapter;
pub use encar::EncarAdapter;

use crate::config::SyncConfig;
use crate::feed::OfferEnvelope;
use crate::models::{Source, VehicleRecord};
use crate::photos::LinkValidity;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Why a single offer could not become a canonical record. Rejections are
/// counted, logged and skipped; they never abort a run.
#[derive(Debug, thiserror::Error)]
pub enum RecordReject {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("{0}")]
    Unusable(String),
}

pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    fn slug(&self) -> &'static str {
        self.source().as_str()
    }

    /// Full-snapshot listing page.
    fn offers_url(&self, page: u32) -> String;

    /// Incremental change feed, if the provider has one.
    fn changes_url(&self, change_id: i64) -> Option<String>;

    /// Resolve the first change id on a given date (`YYYY-MM-DD`).
    fn change_id_url(&self, date: &str) -> Option<String>;

    /// Our stable identifier for a provider listing id.
    fn source_id(&self, inner_id: &str) -> String;

    /// Whether a stored `source_id` belongs to this provider. Providers that
    /// share a `source` region override this so one provider's stale-listing
    /// removal never touches the other's rows.
    fn owns_source_id(&self, _source_id: &str) -> bool {
        true
    }

    fn normalize(&self, envelope: &OfferEnvelope) -> Result<VehicleRecord, RecordReject>;

    /// Extract an updated USD price from a `changed` event payload.
    fn price_update(&self, data: &Value) -> Option<i64>;

    /// How an image link of this source should be treated right now. The
    /// default is for providers whose links do not expire.
    fn classify_link(
        &self,
        url: &str,
        _synced_at: Option<DateTime<Utc>>,
        _now: DateTime<Utc>,
        storage_host: &str,
    ) -> LinkValidity {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            LinkValidity::Invalid
        } else if url.starts_with(storage_host) {
            LinkValidity::Durable
        } else {
            LinkValidity::Valid
        }
    }

    /// Path segment of this source on the daily export host, if it has one.
    fn export_provider(&self) -> Option<&'static str> {
        None
    }
}

/// Resolve a route slug to its adapter. Region slugs and provider names are
/// both accepted; `china` means the Dongchedi feed, che168 is addressed by
/// its provider name only.
pub fn adapter_for(
    slug: &str,
    config: &SyncConfig,
) -> Option<Box<dyn SourceAdapter + Send + Sync>> {
    match slug {
        "korea" | "encar" => Some(Box::new(EncarAdapter::new(config.encar.clone()))),
        "china" | "dongchedi" => Some(Box::new(DongchediAdapter::new(
            config.dongchedi.clone(),
            config.photo_expiry_days,
            config.expiring_margin_secs,
        ))),
        "che168" => Some(Box::new(Che168Adapter::new(config.che168.clone()))),
        "dubai" | "dubicars" => Some(Box::new(DubicarsAdapter::new(config.dubicars.clone()))),
        _ => None,
    }
}

/// `{base}{endpoint}?api_key=...&k=v` with values percent-encoded.
pub(crate) fn feed_url(
    base: &str,
    endpoint: &str,
    api_key: &str,
    params: &[(&str, String)],
) -> String {
    let mut url = format!(
        "{}{}?api_key={}",
        base.trim_end_matches('/'),
        endpoint,
        urlencoding::encode(api_key),
    );
    for (key, value) in params {
        url.push_str(&format!("&{key}={}", urlencoding::encode(value)));
    }
    url
}

/// Image lists arrive either as a JSON array or as a JSON array serialized
/// into a string, depending on the provider dialect.
pub(crate) fn parse_images(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(str::to_string)
            .collect(),
        Value::String(raw) => serde_json::from_str::<Vec<String>>(raw).unwrap_or_default(),
        _ => Vec::new(),
    }
}
