use super::{RecordReject, SourceAdapter, feed_url, parse_images};
use crate::config::ProviderConfig;
use crate::feed::OfferEnvelope;
use crate::models::{
    AuctionStatus, BodyType, DriveType, FuelType, Source, Transmission, VehicleRecord,
    value_to_f64, value_to_i64, value_to_string,
};
use serde_json::Value;

/// Chinese listings from the che168.com mirror. Shares the `china` region
/// with Dongchedi, so its rows carry a `che168_` id prefix and a platform
/// tag to keep the two inventories apart.
pub struct Che168Adapter {
    provider: ProviderConfig,
}

const CNY_TO_USD: f64 = 0.138;
const SOURCE_ID_PREFIX: &str = "che168_";

impl Che168Adapter {
    pub fn new(provider: ProviderConfig) -> Self {
        Self { provider }
    }
}

impl SourceAdapter for Che168Adapter {
    fn source(&self) -> Source {
        Source::China
    }

    fn slug(&self) -> &'static str {
        "che168"
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

    fn source_id(&self, inner_id: &str) -> String {
        format!("{SOURCE_ID_PREFIX}{inner_id}")
    }

    fn owns_source_id(&self, source_id: &str) -> bool {
        source_id.starts_with(SOURCE_ID_PREFIX)
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
        let now = chrono::Utc::now();

        Ok(VehicleRecord {
            source: Source::China,
            source_id: self.source_id(&inner_id),
            source_url: data.get("url").and_then(value_to_string),
            make,
            model,
            grade: data.get("title").and_then(value_to_string),
            year: data
                .get("year")
                .and_then(value_to_i64)
                .map(|year| year as i32),
            mileage: data.get("km_age").and_then(value_to_i64),
            engine_cc: data
                .get("displacement")
                .and_then(value_to_f64)
                .filter(|liters| *liters > 0.0)
                .map(|liters| (liters * 1000.0).round() as i32),
            fuel_type: map_fuel(data.get("engine_type").and_then(Value::as_str)),
            transmission: map_transmission(data.get("transmission_type").and_then(Value::as_str)),
            drive_type: map_drive(data.get("drive_type").and_then(Value::as_str)),
            body_type: map_body(data.get("body_type").and_then(Value::as_str)),
            color: data.get("color").and_then(value_to_string),
            start_price_usd: price_usd,
            current_price_usd: price_usd,
            original_price: price_cny,
            original_currency: price_cny.map(|_| "CNY".to_string()),
            auction_status: AuctionStatus::Ongoing,
            auction_platform: Some("che168".to_string()),
            is_visible: true,
            images: data.get("images").map(parse_images).unwrap_or_default(),
            created_at: now,
            updated_at: now,
        })
    }

    fn price_update(&self, data: &Value) -> Option<i64> {
        data.get("new_price")
            .or_else(|| data.get("price"))
            .and_then(value_to_f64)
            .map(cny_to_usd)
    }
}

fn cny_to_usd(price: f64) -> i64 {
    (price * CNY_TO_USD).round() as i64
}

fn map_transmission(raw: Option<&str>) -> Transmission {
    match raw {
        Some("Manual") => Transmission::Manual,
        _ => Transmission::Automatic,
    }
}

fn map_fuel(raw: Option<&str>) -> FuelType {
    match raw {
        Some("Diesel") => FuelType::Diesel,
        Some("Electric") | Some("Range Extender") | Some("Hydrogen Fuel Cell") => {
            FuelType::Electric
        }
        Some("Hybrid")
        | Some("Plug-in Hybrid")
        | Some("Gasoline + 48V Mild Hybrid")
        | Some("Gasoline + 24V Mild Hybrid") => FuelType::Hybrid,
        Some("CNG") | Some("Gasoline + CNG") => FuelType::Lpg,
        _ => FuelType::Petrol,
    }
}

fn map_drive(raw: Option<&str>) -> Option<DriveType> {
    // Electric variants arrive as "AWD (dual-motor)", "RWD (mid-engine)" etc.
    match raw {
        Some(value) if value.starts_with("FWD") => Some(DriveType::Fwd),
        Some(value) if value.starts_with("RWD") => Some(DriveType::Rwd),
        Some(value) if value.starts_with("AWD") => Some(DriveType::Awd),
        Some("Other") => Some(DriveType::Fwd),
        _ => None,
    }
}

fn map_body(raw: Option<&str>) -> BodyType {
    match raw {
        Some("Crossover/SUV") | Some("SUV") => BodyType::Suv,
        Some("Sedan") => BodyType::Sedan,
        Some("Hatchback") | Some("Mini") => BodyType::Hatchback,
        Some("Minivan") => BodyType::Minivan,
        Some("Pickup") | Some("Light Truck") => BodyType::Pickup,
        Some("Coupe/Roadster") | Some("Sports Car") => BodyType::Coupe,
        Some("Microvan") | Some("Van") => BodyType::Van,
        _ => BodyType::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> Che168Adapter {
        Che168Adapter::new(ProviderConfig {
            api_base: "https://api1.auto-api.com/api/v2/che168".to_string(),
            api_key: "secret".to_string(),
            export_host: None,
            export_login: None,
            export_password: None,
        })
    }

    fn envelope(data: Value) -> OfferEnvelope {
        serde_json::from_value(json!({
            "id": 3,
            "inner_id": "55021",
            "change_type": "added",
            "data": data,
        }))
        .unwrap()
    }

    #[test]
    fn source_id_carries_platform_prefix() {
        let record = adapter()
            .normalize(&envelope(json!({
                "inner_id": "55021",
                "mark": "Geely",
                "model": "Xingyue L",
            })))
            .unwrap();
        assert_eq!(record.source_id, "che168_55021");
        assert_eq!(record.auction_platform.as_deref(), Some("che168"));
        assert_eq!(record.source, Source::China);
        assert!(adapter().owns_source_id(&record.source_id));
        assert!(!adapter().owns_source_id("7312590"));
    }

    #[test]
    fn converts_cny_and_maps_electric_variants() {
        let record = adapter()
            .normalize(&envelope(json!({
                "inner_id": "55021",
                "mark": "NIO",
                "model": "ET5",
                "title": "75 kWh",
                "year": 2023,
                "price": 228_000,
                "km_age": 21_000,
                "engine_type": "Range Extender",
                "transmission_type": "Single-Speed",
                "drive_type": "AWD (dual-motor)",
                "body_type": "Crossover/SUV",
                "displacement": 1.5,
            })))
            .unwrap();
        assert_eq!(record.current_price_usd, Some(31_464));
        assert_eq!(record.original_currency.as_deref(), Some("CNY"));
        assert_eq!(record.grade.as_deref(), Some("75 kWh"));
        assert_eq!(record.fuel_type, FuelType::Electric);
        assert_eq!(record.transmission, Transmission::Automatic);
        assert_eq!(record.drive_type, Some(DriveType::Awd));
        assert_eq!(record.body_type, BodyType::Suv);
        assert_eq!(record.engine_cc, Some(1500));
    }

    #[test]
    fn price_update_prefers_new_price() {
        let a = adapter();
        assert_eq!(
            a.price_update(&json!({ "new_price": 200_000, "price": 228_000 })),
            Some(27_600)
        );
        assert_eq!(a.price_update(&json!({ "price": 100_000 })), Some(13_800));
        assert_eq!(a.price_update(&json!({})), None);
    }

    #[test]
    fn change_feed_urls_are_available() {
        let a = adapter();
        assert_eq!(
            a.changes_url(42).as_deref(),
            Some("https://api1.auto-api.com/api/v2/che168/changes?api_key=secret&change_id=42")
        );
        assert!(a.change_id_url("2026-08-29").is_some());
    }
}
