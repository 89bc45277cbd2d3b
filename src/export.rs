use crate::config::ProviderConfig;
use crate::http::build_client;
use crate::sync::SyncError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use reqwest::{Client, StatusCode, header::AUTHORIZATION};
use std::collections::HashMap;
use tracing::{debug, info};

/// One row of a provider's daily `active_offer` export: the listing id, its
/// currently-signed image URLs, and when the provider last refreshed them.
#[derive(Debug, Clone)]
pub struct ExportRow {
    pub inner_id: String,
    pub images: Vec<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Downloads and parses the pipe-delimited daily export files some providers
/// publish behind HTTP Basic auth. Only sources with export credentials
/// configured get one of these.
pub struct ExportClient {
    client: Client,
    host: String,
    login: String,
    password: String,
}

impl ExportClient {
    pub fn from_provider(provider: &ProviderConfig) -> Option<Self> {
        let host = provider.export_host.clone()?;
        let login = provider.export_login.clone()?;
        let password = provider.export_password.clone()?;
        Some(Self {
            client: build_client(),
            host,
            login,
            password,
        })
    }

    /// Fetch `{host}/{provider}/{date}/active_offer.csv` and index it by
    /// `inner_id`. A 404 means the file for that date has not been published
    /// yet and is not worth retrying.
    pub async fn fetch_active_offers(
        &self,
        provider: &str,
        date: NaiveDate,
    ) -> Result<HashMap<String, ExportRow>, SyncError> {
        let url = format!(
            "{}/{}/{}/active_offer.csv",
            self.host.trim_end_matches('/'),
            provider,
            date.format("%Y-%m-%d"),
        );
        debug!(target = "sync.photos", %url, "downloading export file");

        let credentials = BASE64.encode(format!("{}:{}", self.login, self.password));
        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Basic {credentials}"))
            .send()
            .await
            .map_err(|err| SyncError::transient("export", err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::export_unavailable(
                "export",
                format!("no export published for {date}"),
            ));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::auth("export", format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(SyncError::transient("export", format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|err| SyncError::transient("export", err.to_string()))?;
        let rows = parse_export(&body);
        info!(
            target = "sync.photos",
            provider,
            date = %date,
            rows = rows.len(),
            "export file loaded"
        );
        Ok(rows)
    }
}

/// The export date a sync running at `now` should ask for. Files for a given
/// day are published around 06:00 UTC, so before that we fall back one more
/// day to yesterday's-yesterday.
pub fn export_date(now: DateTime<Utc>) -> NaiveDate {
    let lag = if now.hour() < 6 { 2 } else { 1 };
    (now - Duration::days(lag)).date_naive()
}

/// Parse the pipe-delimited export body. The first line is a header naming
/// the columns; `images` arrives as a JSON array serialized into a CSV-style
/// quoted cell.
pub fn parse_export(body: &str) -> HashMap<String, ExportRow> {
    let mut lines = body.lines();
    let Some(header) = lines.next() else {
        return HashMap::new();
    };
    let columns: Vec<&str> = header.split('|').map(str::trim).collect();
    let find = |name: &str| columns.iter().position(|c| *c == name);
    let (Some(id_col), Some(images_col)) = (find("inner_id"), find("images")) else {
        return HashMap::new();
    };
    let synced_col = find("synced_at");

    let mut rows = HashMap::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let cells: Vec<&str> = line.split('|').collect();
        let Some(inner_id) = cells.get(id_col).map(|c| c.trim()) else {
            continue;
        };
        if inner_id.is_empty() {
            continue;
        }
        let images = cells
            .get(images_col)
            .map(|cell| parse_images_cell(cell))
            .unwrap_or_default();
        let synced_at = synced_col
            .and_then(|col| cells.get(col))
            .and_then(|cell| parse_timestamp(cell.trim()));
        rows.insert(
            inner_id.to_string(),
            ExportRow {
                inner_id: inner_id.to_string(),
                images,
                synced_at,
            },
        );
    }
    rows
}

/// Unwrap a CSV-style quoted cell (doubled quotes inside) and parse the JSON
/// array it holds. Non-array or unparsable cells yield no images rather than
/// failing the row.
fn parse_images_cell(cell: &str) -> Vec<String> {
    let trimmed = cell.trim();
    let unquoted = if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].replace("\"\"", "\"")
    } else {
        trimmed.to_string()
    };
    match serde_json::from_str::<Vec<String>>(&unquoted) {
        Ok(urls) => urls,
        Err(_) => Vec::new(),
    }
}

fn parse_timestamp(cell: &str) -> Option<DateTime<Utc>> {
    if cell.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(cell) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(cell, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_quoted_json_image_cells() {
        let body = concat!(
            "inner_id|images|synced_at\n",
            "7312590|\"[\"\"https://p1.example.com/a.jpg\"\",\"\"https://p1.example.com/b.jpg\"\"]\"|2026-08-28 05:12:44\n",
            "7312591|[]|\n",
        );
        let rows = parse_export(body);
        assert_eq!(rows.len(), 2);
        let row = &rows["7312590"];
        assert_eq!(row.images.len(), 2);
        assert_eq!(row.images[0], "https://p1.example.com/a.jpg");
        assert!(row.synced_at.is_some());
        assert!(rows["7312591"].images.is_empty());
        assert!(rows["7312591"].synced_at.is_none());
    }

    #[test]
    fn tolerates_reordered_columns_and_blank_lines() {
        let body = "synced_at|inner_id|images\n2026-08-28T01:00:00Z|abc|[\"u\"]\n\n";
        let rows = parse_export(body);
        assert_eq!(rows["abc"].images, vec!["u".to_string()]);
    }

    #[test]
    fn missing_required_columns_yields_nothing() {
        assert!(parse_export("foo|bar\n1|2\n").is_empty());
        assert!(parse_export("").is_empty());
    }

    #[test]
    fn export_date_lags_one_extra_day_before_publication_hour() {
        let early = Utc.with_ymd_and_hms(2026, 8, 30, 4, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 8, 30, 9, 0, 0).unwrap();
        assert_eq!(
            export_date(early),
            NaiveDate::from_ymd_opt(2026, 8, 28).unwrap()
        );
        assert_eq!(
            export_date(late),
            NaiveDate::from_ymd_opt(2026, 8, 29).unwrap()
        );
    }
}
