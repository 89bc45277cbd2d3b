use super::{RecordReject, SourceAdapter, feed_url, parse_images};
use crate::config::ProviderConfig;
use crate::feed::OfferEnvelope;
use crate::models::{
    AuctionStatus, BodyType, FuelType, Source, Transmission, VehicleRecord, value_to_f64,
    value_to_i64, value_to_string,
};
use chrono::Utc;
use serde_json::Value;

/// Korean listings from the Encar mirror. Prices arrive in units of 10,000
/// KRW; displacement is already in cc.
pub struct EncarAdapter {
    provider: ProviderConfig,
}

const KRW_TO_USD: f64 = 0.000_75;

impl EncarAdapter {
    pub fn new(provider: ProviderConfig) -> Self {
        Self { provider }
    }
}

impl SourceAdapter for EncarAdapter {
    fn source(&self) -> Source {
        Source::Korea
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
        format!("encar_{inner_id}")
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

        let price_units = data.get("price").and_then(value_to_f64);
        let price_usd = price_units.map(price_units_to_usd);
        let now = Utc::now();

        Ok(VehicleRecord {
            source: Source::Korea,
            source_id: self.source_id(&inner_id),
            source_url: data.get("url").and_then(value_to_string),
            make,
            model,
            grade: data
                .get("complectation")
                .and_then(value_to_string)
                .or_else(|| data.get("configuration").and_then(value_to_string)),
            year: data
                .get("year")
                .and_then(value_to_i64)
                .map(|year| year as i32),
            mileage: data.get("km_age").and_then(value_to_i64),
            engine_cc: data
                .get("displacement")
                .and_then(value_to_i64)
                .map(|cc| cc as i32),
            fuel_type: map_fuel(data.get("engine_type").and_then(Value::as_str)),
            transmission: map_transmission(data.get("transmission_type").and_then(Value::as_str)),
            drive_type: None,
            body_type: map_body(data.get("body_type").and_then(Value::as_str)),
            color: data.get("color").and_then(value_to_string),
            start_price_usd: price_usd,
            current_price_usd: price_usd,
            original_price: price_units.map(|units| units * 10_000.0),
            original_currency: price_units.map(|_| "KRW".to_string()),
            auction_status: AuctionStatus::Ongoing,
            auction_platform: None,
            is_visible: true,
            images: data.get("images").map(parse_images).unwrap_or_default(),
            created_at: now,
            updated_at: now,
        })
    }

    fn price_update(&self, data: &Value) -> Option<i64> {
        data.get("price")
            .and_then(value_to_f64)
            .map(price_units_to_usd)
    }
}

fn price_units_to_usd(units: f64) -> i64 {
    (units * 10_000.0 * KRW_TO_USD).round() as i64
}

fn map_transmission(raw: Option<&str>) -> Transmission {
    match raw {
        Some("Manual") => Transmission::Manual,
        Some("CVT") => Transmission::Cvt,
        // Automatic, Semi-Automatic, Other
        _ => Transmission::Automatic,
    }
}

fn map_fuel(raw: Option<&str>) -> FuelType {
    match raw {
        Some("Diesel") => FuelType::Diesel,
        Some("Electric") | Some("Hydrogen") => FuelType::Electric,
        Some("Hybrid (Gasoline)") | Some("Hybrid (Diesel)") | Some("LPG + Electric") => {
            FuelType::Hybrid
        }
        Some("LPG") | Some("CNG") | Some("Gasoline + LPG") | Some("Gasoline + CNG") => FuelType::Lpg,
        // Gasoline, Other
        _ => FuelType::Petrol,
    }
}

fn map_body(raw: Option<&str>) -> BodyType {
    match raw {
        Some("SUV") => BodyType::Suv,
        Some("Sedan") => BodyType::Sedan,
        Some("Hatchback") => BodyType::Hatchback,
        Some("Minivan") => BodyType::Minivan,
        Some("Pickup Truck") => BodyType::Pickup,
        Some("Coupe/Roadster") => BodyType::Coupe,
        Some("Microbus") => BodyType::Van,
        _ => BodyType::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> EncarAdapter {
        EncarAdapter::new(ProviderConfig {
            api_base: "https://driveby.auto-api.com/api/v2/encar".to_string(),
            api_key: "secret".to_string(),
            export_host: None,
            export_login: None,
            export_password: None,
        })
    }

    fn envelope(data: Value) -> OfferEnvelope {
        serde_json::from_value(json!({
            "id": 1,
            "inner_id": "38559271",
            "change_type": "added",
            "data": data,
        }))
        .unwrap()
    }

    #[test]
    fn builds_feed_urls_with_api_key() {
        let a = adapter();
        assert_eq!(
            a.offers_url(3),
            "https://driveby.auto-api.com/api/v2/encar/offers?api_key=secret&page=3"
        );
        assert_eq!(
            a.changes_url(987).unwrap(),
            "https://driveby.auto-api.com/api/v2/encar/changes?api_key=secret&change_id=987"
        );
        assert_eq!(
            a.change_id_url("2026-08-29").unwrap(),
            "https://driveby.auto-api.com/api/v2/encar/change_id?api_key=secret&date=2026-08-29"
        );
    }

    #[test]
    fn normalizes_a_full_offer() {
        let record = adapter()
            .normalize(&envelope(json!({
                "inner_id": "38559271",
                "url": "https://encar.example/38559271",
                "mark": "Hyundai",
                "model": "Tucson",
                "complectation": "Premium",
                "year": 2021,
                "km_age": 45120,
                "price": 2450,
                "displacement": "1998",
                "engine_type": "Gasoline",
                "transmission_type": "Automatic",
                "body_type": "SUV",
                "color": "White",
                "images": ["https://img.encar.example/1.jpg"],
            })))
            .unwrap();

        assert_eq!(record.source_id, "encar_38559271");
        assert_eq!(record.make, "Hyundai");
        assert_eq!(record.grade.as_deref(), Some("Premium"));
        assert_eq!(record.engine_cc, Some(1998));
        // 2450 * 10_000 KRW * 0.00075
        assert_eq!(record.current_price_usd, Some(18_375));
        assert_eq!(record.original_price, Some(24_500_000.0));
        assert_eq!(record.original_currency.as_deref(), Some("KRW"));
        assert_eq!(record.body_type, BodyType::Suv);
        assert_eq!(record.fuel_type, FuelType::Petrol);
        assert_eq!(record.auction_status, AuctionStatus::Ongoing);
        assert_eq!(record.images.len(), 1);
    }

    #[test]
    fn unknown_enum_values_fall_back() {
        let record = adapter()
            .normalize(&envelope(json!({
                "inner_id": "1",
                "mark": "Kia",
                "model": "Ray",
                "engine_type": "Gasoline + LPG",
                "transmission_type": "Semi-Automatic",
                "body_type": "RV",
            })))
            .unwrap();
        assert_eq!(record.fuel_type, FuelType::Lpg);
        assert_eq!(record.transmission, Transmission::Automatic);
        assert_eq!(record.body_type, BodyType::Other);
        assert_eq!(record.current_price_usd, None);
    }

    #[test]
    fn missing_make_is_rejected() {
        let err = adapter()
            .normalize(&envelope(json!({ "inner_id": "1", "model": "Ray" })))
            .unwrap_err();
        assert!(matches!(err, RecordReject::MissingField("mark")));
    }

    #[test]
    fn envelope_level_inner_id_is_a_fallback() {
        let record = adapter()
            .normalize(&envelope(json!({ "mark": "Kia", "model": "Ray" })))
            .unwrap();
        assert_eq!(record.source_id, "encar_38559271");
    }

    #[test]
    fn price_update_converts_currency() {
        assert_eq!(adapter().price_update(&json!({ "price": 1000 })), Some(7500));
        assert_eq!(adapter().price_update(&json!({})), None);
    }
}
