use super::{RecordReject, SourceAdapter, feed_url, parse_images};
use crate::config::ProviderConfig;
use crate::feed::OfferEnvelope;
use crate::models::{
    AuctionStatus, BodyType, DriveType, FuelType, Source, Transmission, VehicleRecord,
    value_to_f64,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use serde_with::{DefaultOnError, DisplayFromStr, serde_as};

/// UAE listings from the Dubicars mirror. Everything numeric arrives as a
/// string on this dialect, including the `-1` sentinel for "price on
/// request", and the image list is a JSON array inside a string.
pub struct DubicarsAdapter {
    provider: ProviderConfig,
}

// Pegged rate.
const AED_TO_USD: f64 = 0.2723;

/// Typed view of `data`. Numeric strings parse through `DisplayFromStr`;
/// anything unparsable degrades to `None` instead of rejecting the offer.
#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DubicarsOffer {
    inner_id: Option<String>,
    url: Option<String>,
    mark: Option<String>,
    model: Option<String>,
    configuration: Option<String>,
    #[serde_as(as = "DefaultOnError<Option<DisplayFromStr>>")]
    year: Option<i32>,
    #[serde_as(as = "DefaultOnError<Option<DisplayFromStr>>")]
    price: Option<f64>,
    #[serde_as(as = "DefaultOnError<Option<DisplayFromStr>>")]
    km_age: Option<i64>,
    color: Option<String>,
    engine_type: Option<String>,
    body_type: Option<String>,
    transmission_type: Option<String>,
    drive_type: Option<String>,
    #[serde_as(as = "DefaultOnError<Option<DisplayFromStr>>")]
    displacement: Option<f64>,
    images: Value,
}

impl DubicarsAdapter {
    pub fn new(provider: ProviderConfig) -> Self {
        Self { provider }
    }
}

impl SourceAdapter for DubicarsAdapter {
    fn source(&self) -> Source {
        Source::Dubai
    }

    fn offers_url(&self, page: u32) -> String {
        feed_url(
            &self.provider.api_base,
            "/offers",
            &self.provider.api_key,
            &[("page", page.to_string())],
        )
    }

    // Snapshot-only provider: no change feed.
    fn changes_url(&self, _change_id: i64) -> Option<String> {
        None
    }

    fn change_id_url(&self, _date: &str) -> Option<String> {
        None
    }

    fn source_id(&self, inner_id: &str) -> String {
        format!("dubicars_{inner_id}")
    }

    fn normalize(&self, envelope: &OfferEnvelope) -> Result<VehicleRecord, RecordReject> {
        let offer: DubicarsOffer = serde_json::from_value(envelope.data.clone())
            .map_err(|err| RecordReject::Unusable(format!("undecodable offer: {err}")))?;

        let inner_id = offer
            .inner_id
            .filter(|id| !id.is_empty())
            .ok_or(RecordReject::MissingField("inner_id"))?;
        let make = offer
            .mark
            .filter(|m| !m.is_empty())
            .ok_or(RecordReject::MissingField("mark"))?;
        let model = offer
            .model
            .filter(|m| !m.is_empty())
            .ok_or(RecordReject::MissingField("model"))?;

        let price_aed = offer.price.filter(|price| *price > 0.0);
        let price_usd = price_aed.map(aed_to_usd);
        let now = Utc::now();

        Ok(VehicleRecord {
            source: Source::Dubai,
            source_id: self.source_id(&inner_id),
            source_url: offer.url,
            make,
            model,
            grade: offer.configuration.filter(|g| !g.is_empty()),
            year: offer.year,
            mileage: offer.km_age,
            engine_cc: offer.displacement.map(normalize_displacement),
            fuel_type: map_fuel(offer.engine_type.as_deref()),
            transmission: map_transmission(offer.transmission_type.as_deref()),
            drive_type: map_drive(offer.drive_type.as_deref()),
            body_type: map_body(offer.body_type.as_deref()),
            color: offer.color.filter(|c| !c.is_empty()),
            start_price_usd: price_usd,
            current_price_usd: price_usd,
            original_price: price_aed,
            original_currency: price_aed.map(|_| "AED".to_string()),
            auction_status: AuctionStatus::Ongoing,
            auction_platform: None,
            is_visible: true,
            images: parse_images(&offer.images),
            created_at: now,
            updated_at: now,
        })
    }

    fn price_update(&self, data: &Value) -> Option<i64> {
        data.get("price")
            .and_then(value_to_f64)
            .filter(|price| *price > 0.0)
            .map(aed_to_usd)
    }
}

fn aed_to_usd(price: f64) -> i64 {
    (price * AED_TO_USD).round() as i64
}

/// Displacement under 100 is liters, otherwise it is already cc.
fn normalize_displacement(displacement: f64) -> i32 {
    if displacement < 100.0 {
        (displacement * 1000.0).round() as i32
    } else {
        displacement.round() as i32
    }
}

fn map_transmission(raw: Option<&str>) -> Transmission {
    match raw {
        Some("Manual") => Transmission::Manual,
        Some("CVT") => Transmission::Cvt,
        _ => Transmission::Automatic,
    }
}

fn map_fuel(raw: Option<&str>) -> FuelType {
    match raw {
        Some("Diesel") => FuelType::Diesel,
        Some("Electric") => FuelType::Electric,
        Some("Hybrid") | Some("Plug-in Hybrid") => FuelType::Hybrid,
        Some("LPG") | Some("CNG") => FuelType::Lpg,
        _ => FuelType::Petrol,
    }
}

fn map_drive(raw: Option<&str>) -> Option<DriveType> {
    match raw {
        Some("Front Wheel Drive") | Some("FWD") => Some(DriveType::Fwd),
        Some("Rear Wheel Drive") | Some("RWD") => Some(DriveType::Rwd),
        Some("All Wheel Drive") | Some("AWD") => Some(DriveType::Awd),
        Some("4WD") | Some("Four Wheel Drive") => Some(DriveType::FourWd),
        _ => None,
    }
}

fn map_body(raw: Option<&str>) -> BodyType {
    match raw {
        Some("SUV/Crossover") | Some("SUV") | Some("Crossover") => BodyType::Suv,
        Some("Sedan") | Some("Luxury") => BodyType::Sedan,
        Some("Hatchback") => BodyType::Hatchback,
        Some("Coupe") | Some("Sports Car") => BodyType::Coupe,
        Some("Convertible") => BodyType::Convertible,
        Some("Wagon") => BodyType::Wagon,
        Some("Van") | Some("Minivan") => BodyType::Van,
        Some("Pick Up Truck") | Some("Pickup") => BodyType::Pickup,
        _ => BodyType::Other,
    }
}
