use super::{RecordReject, SourceAdapter, feed_url, parse_images};
use crate::config::ProviderConfig;
use crate::feed::OfferEnvelope;
use crate::models::{
    AuctionStatus, BodyType, DriveType, FuelType, Source, Transmission, VehicleRecord,
    value_to_f64, value_to_i64, value_to_string,
};
use crate::photos::{LinkValidity, classify_signed_link};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// Chinese listings from the Dongchedi mirror. Prices are CNY, displacement
/// comes in liters, and image URLs carry expiring CDN signatures, so this is
/// the one adapter with a real link-classification policy.
pub struct DongchediAdapter {
    provider: ProviderConfig,
    photo_expiry_days: i64,
    expiring_margin_secs: i64,
}

const CNY_TO_USD: f64 = 0.14;

impl DongchediAdapter {
    pub fn new(provider: ProviderConfig, photo_expiry_days: i64, expiring_margin_secs: i64) -> Self {
        Self {
            provider,
            photo_expiry_days,
            expiring_margin_secs,
        }
    }
}

impl SourceAdapter for DongchediAdapter {
    fn source(&self) -> Source {
        Source::China
    }

    fn offers_url(&self, page: u32) -> String {
        feed_url(
            &self.provider.api_base,
            "/offers",
            &self.provider.api_key,
            &[("page", page.to_string())],
        )
    }

    fn changes_url(&self, change_id: i64) -> Option<String> {
        Some(feed_url(
            &self.provider.api_base,
            "/changes",
            &self.provider.api_key,
            &[("change_id", change_id.to_string())],
        ))
    }

    fn change_id_url(&self, date: &str) -> Option<String> {
        Some(feed_url(
            &self.provider.api_base,
            "/change_id",
            &self.provider.api_key,
            &[("date", date.to_string())],
        ))
    }

    /// Bare provider id, so rows can be joined against the export file.
    fn source_id(&self, inner_id: &str) -> String {
        inner_id.to_string()
    }

    // che168 rows live in the same `china` region under a `che168_` prefix.
    fn owns_source_id(&self, source_id: &str) -> bool {
        !source_id.starts_with("che168_")
    }

    fn normalize(&self, envelope: &OfferEnvelope) -> Result<VehicleRecord, RecordReject> {
        let data = &envelope.data;
        let inner_id = data
            .get("inner_id")
            .and_then(value_to_string)
            .or_else(|| value_to_string(&envelope.inner_id))
            .ok_or(RecordReject::MissingField("inner_id"))?;
        let make = data
            .get("mark")
            .and_then(value_to_string)
            .ok_or(RecordReject::MissingField("mark"))?;
        let model = data
            .get("model")
            .and_then(value_to_string)
            .ok_or(RecordReject::MissingField("model"))?;

        let price_cny = data.get("price").and_then(value_to_f64);
        let price_usd = price_cny.map(cny_to_usd);
        let now = Utc::now();

        Ok(VehicleRecord {
            source: Source::China,
            source_id: self.source_id(&inner_id),
            source_url: data.get("url").and_then(value_to_string),
            make,
            model,
            grade: data.get("complectation").and_then(value_to_string),
            year: data
                .get("year")
                .and_then(value_to_i64)
                .map(|year| year as i32),
            mileage: data.get("km_age").and_then(value_to_i64),
            engine_cc: data
                .get("displacement")
                .and_then(value_to_f64)
                .map(|liters| (liters * 1000.0).round() as i32),
            fuel_type: map_fuel(data.get("engine_type").and_then(Value::as_str)),
            transmission: map_transmission(data.get("transmission_type").and_then(Value::as_str)),
            drive_type: map_drive(data.get("drive_type").and_then(Value::as_str)),
            body_type: map_body(data.get("body_type").and_then(Value::as_str)),
            color: data
                .get("color")
                .and_then(value_to_string)
                .map(|c| normalize_color(&c)),
            start_price_usd: price_usd,
            current_price_usd: price_usd,
            original_price: price_cny,
            original_currency: price_cny.map(|_| "CNY".to_string()),
            auction_status: AuctionStatus::Ongoing,
            auction_platform: None,
            is_visible: true,
            images: data.get("images").map(parse_images).unwrap_or_default(),
            created_at: now,
            updated_at: now,
        })
    }

    fn price_update(&self, data: &Value) -> Option<i64> {
        data.get("price").and_then(value_to_f64).map(cny_to_usd)
    }

    fn classify_link(
        &self,
        url: &str,
        synced_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        storage_host: &str,
    ) -> LinkValidity {
        classify_signed_link(
            url,
            synced_at,
            now,
            storage_host,
            self.photo_expiry_days,
            Duration::seconds(self.expiring_margin_secs),
        )
    }

    fn export_provider(&self) -> Option<&'static str> {
        Some("dongchedi")
    }
}

fn cny_to_usd(price: f64) -> i64 {
    (price * CNY_TO_USD).round() as i64
}

fn map_transmission(raw: Option<&str>) -> Transmission {
    match raw {
        Some("Manual") => Transmission::Manual,
        Some("CVT") | Some("E-CVT") => Transmission::Cvt,
        // DCT, AMT, DHT, Sequential, Single-Speed
        _ => Transmission::Automatic,
    }
}

fn map_fuel(raw: Option<&str>) -> FuelType {
    match raw {
        Some("Diesel") => FuelType::Diesel,
        Some("Electric") => FuelType::Electric,
        Some("Hybrid") | Some("PHEV") | Some("EREV") => FuelType::Hybrid,
        Some("Bi-Fuel") | Some("CNG") => FuelType::Lpg,
        _ => FuelType::Petrol,
    }
}

fn map_drive(raw: Option<&str>) -> Option<DriveType> {
    match raw {
        Some("FWD") => Some(DriveType::Fwd),
        Some("RWD") => Some(DriveType::Rwd),
        Some("AWD") | Some("all-wheel") => Some(DriveType::Awd),
        Some("4WD") | Some("4x4") => Some(DriveType::FourWd),
        Some(other) if other.to_lowercase().contains("all") => Some(DriveType::Awd),
        _ => None,
    }
}

fn map_body(raw: Option<&str>) -> BodyType {
    match raw {
        Some("SUV") => BodyType::Suv,
        Some("Sedan") => BodyType::Sedan,
        Some("Hatchback") | Some("Liftback") => BodyType::Hatchback,
        Some("Wagon") => BodyType::Wagon,
        Some("Coupe") | Some("Sports Car") => BodyType::Coupe,
        Some("Convertible") => BodyType::Convertible,
        Some("Pickup") | Some("Mini Truck") => BodyType::Pickup,
        Some("Minivan") | Some("Microvan") | Some("Light Commercial") | Some("Motorhome") => {
            BodyType::Van
        }
        _ => BodyType::Other,
    }
}

/// The feed's color strings are free-form marketing names; collapse them
/// onto a small palette where a keyword matches.
fn normalize_color(raw: &str) -> String {
    let lower = raw.to_lowercase();
    for (needle, canonical) in [
        ("white", "white"),
        ("black", "black"),
        ("silver", "silver"),
        ("gray", "gray"),
        ("grey", "gray"),
        ("red", "red"),
        ("blue", "blue"),
        ("green", "green"),
        ("brown", "brown"),
        ("beige", "beige"),
        ("champagne", "beige"),
    ] {
        if lower.contains(needle) {
            return canonical.to_string();
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn adapter() -> DongchediAdapter {
        DongchediAdapter::new(
            ProviderConfig {
                api_base: "https://api1.auto-api.com/api/v2/dongchedi".to_string(),
                api_key: "secret".to_string(),
                export_host: Some("https://autobase-perez.auto-api.com".to_string()),
                export_login: Some("login".to_string()),
                export_password: Some("pass".to_string()),
            },
            6,
            24 * 3600,
        )
    }

    fn envelope(data: Value) -> OfferEnvelope {
        serde_json::from_value(json!({
            "id": 7,
            "inner_id": "7312590",
            "change_type": "added",
            "data": data,
        }))
        .unwrap()
    }

    #[test]
    fn source_id_is_the_bare_inner_id() {
        let record = adapter()
            .normalize(&envelope(json!({
                "inner_id": "7312590",
                "mark": "BYD",
                "model": "Seal",
            })))
            .unwrap();
        assert_eq!(record.source_id, "7312590");
    }

    #[test]
    fn converts_cny_and_liters() {
        let record = adapter()
            .normalize(&envelope(json!({
                "inner_id": "7312590",
                "mark": "BYD",
                "model": "Seal",
                "price": 189_800,
                "displacement": 1.5,
                "drive_type": "all-wheel",
                "transmission_type": "E-CVT",
                "engine_type": "PHEV",
                "body_type": "Liftback",
                "color": "Pearl White",
            })))
            .unwrap();
        assert_eq!(record.current_price_usd, Some(26_572));
        assert_eq!(record.original_price, Some(189_800.0));
        assert_eq!(record.original_currency.as_deref(), Some("CNY"));
        assert_eq!(record.engine_cc, Some(1500));
        assert_eq!(record.drive_type, Some(DriveType::Awd));
        assert_eq!(record.transmission, Transmission::Cvt);
        assert_eq!(record.fuel_type, FuelType::Hybrid);
        assert_eq!(record.body_type, BodyType::Hatchback);
        assert_eq!(record.color.as_deref(), Some("white"));
    }

    #[test]
    fn link_classification_blocks_signed_cdns() {
        let a = adapter();
        let now = Utc.timestamp_opt(1_756_500_000, 0).unwrap();
        let storage = "https://proj.supabase.co/storage/v1/object/public/vehicle-photos/";
        assert_eq!(
            a.classify_link(
                "https://p6-dcd-sign.byteimg.com/x.jpg?x-expires=9999999999",
                None,
                now,
                storage,
            ),
            LinkValidity::Blocked
        );
        assert_eq!(
            a.classify_link(
                &format!("{storage}7312590/0.jpg"),
                None,
                now,
                storage,
            ),
            LinkValidity::Durable
        );
    }
}
