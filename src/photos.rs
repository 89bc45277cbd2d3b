use crate::config::SyncConfig;
use crate::http::build_client;
use crate::supabase::SupabaseClient;
use crate::sync::SyncError;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};

/// CDN hosts whose signed URLs reject any requester outside the provider's
/// own frontend. Nothing served from these is worth storing.
const BLOCKED_CDN_HOSTS: &[&str] = &[
    "p1-dcd-sign.byteimg.com",
    "p3-dcd-sign.byteimg.com",
    "p6-dcd-sign.byteimg.com",
];

/// How a single image link should be treated right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkValidity {
    /// Already on our own storage; never refetch.
    Durable,
    /// Externally hosted but safe to serve as-is for now.
    Valid,
    /// Signed link that has expired or will within the safety margin.
    Expiring,
    /// Hosted on a CDN that rejects us outright.
    Blocked,
    /// Not a usable http(s) URL.
    Invalid,
}

/// Unix expiry timestamp embedded in a signed URL's `x-expires` parameter,
/// if present anywhere in the query string.
pub fn signed_url_expiry(url: &str) -> Option<i64> {
    let idx = url.find("x-expires=")?;
    let digits: String = url[idx + "x-expires=".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Undo the mangling export files apply to signed URLs: double-encoded
/// percent escapes (`%25XX`) collapse back to `%XX`, and a literal `+` in
/// the query string becomes `%2B` so the signature survives re-parsing.
pub fn normalize_image_url(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let query_start = url.find('?').unwrap_or(url.len());
    let mut chars = url.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '%'
            && url[i + 1..].starts_with("25")
            && url.as_bytes().get(i + 3).is_some_and(u8::is_ascii_hexdigit)
            && url.as_bytes().get(i + 4).is_some_and(u8::is_ascii_hexdigit)
        {
            out.push('%');
            chars.next();
            chars.next();
        } else if c == '+' && i > query_start {
            out.push_str("%2B");
        } else {
            out.push(c);
        }
    }
    out
}

/// Classify a link from a signed-CDN source. Blocklist wins over everything,
/// our own storage host short-circuits as durable, then the embedded
/// signature expiry, then the export row's sync age as a fallback signal.
pub fn classify_signed_link(
    url: &str,
    synced_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    storage_host: &str,
    expiry_days: i64,
    margin: Duration,
) -> LinkValidity {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return LinkValidity::Invalid;
    }
    if BLOCKED_CDN_HOSTS.iter().any(|host| url.contains(host)) {
        return LinkValidity::Blocked;
    }
    if url.starts_with(storage_host) {
        return LinkValidity::Durable;
    }
    if let Some(expiry) = signed_url_expiry(url) {
        return if now.timestamp() + margin.num_seconds() < expiry {
            LinkValidity::Valid
        } else {
            LinkValidity::Expiring
        };
    }
    match synced_at {
        Some(synced) if now - synced < Duration::days(expiry_days) - margin => LinkValidity::Valid,
        Some(_) => LinkValidity::Expiring,
        // No signature and no sync age: nothing proves this link will hold.
        None => LinkValidity::Invalid,
    }
}

/// What to do with each image slot of one vehicle, in display order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageAction {
    Keep(String),
    Fetch(String),
    Drop,
}

#[derive(Debug, Default)]
pub struct RefreshPlan {
    pub actions: Vec<ImageAction>,
    pub blocked: u64,
    pub invalid: u64,
    pub to_fetch: u64,
}

/// Decide per image whether to keep the current URL, re-download it, or drop
/// it. Pure so the ordering rules stay testable without any network.
pub fn plan_refresh(images: &[String], classify: impl Fn(&str) -> LinkValidity) -> RefreshPlan {
    let mut plan = RefreshPlan::default();
    for url in images {
        let normalized = normalize_image_url(url);
        match classify(&normalized) {
            LinkValidity::Durable | LinkValidity::Valid => {
                plan.actions.push(ImageAction::Keep(normalized));
            }
            LinkValidity::Expiring => {
                plan.to_fetch += 1;
                plan.actions.push(ImageAction::Fetch(normalized));
            }
            LinkValidity::Blocked => {
                plan.blocked += 1;
                plan.actions.push(ImageAction::Drop);
            }
            LinkValidity::Invalid => {
                plan.invalid += 1;
                plan.actions.push(ImageAction::Drop);
            }
        }
    }
    plan
}

/// Combine a plan with the outcome of its fetches into the final image list.
/// Failed fetches drop out; relative order of survivors is preserved.
pub fn finalize_refresh(plan: &RefreshPlan, mut fetched: Vec<Option<String>>) -> Vec<String> {
    let mut fetched_iter = fetched.drain(..);
    let mut images = Vec::new();
    for action in &plan.actions {
        match action {
            ImageAction::Keep(url) => images.push(url.clone()),
            ImageAction::Fetch(_) => {
                if let Some(Some(url)) = fetched_iter.next() {
                    images.push(url);
                }
            }
            ImageAction::Drop => {}
        }
    }
    images
}

/// Downloads expiring images and re-homes them in Supabase storage under
/// `{source_id}/{index}.{ext}`.
pub struct PhotoCache {
    client: Client,
    supabase: Arc<SupabaseClient>,
    bucket: String,
    image_delay: std::time::Duration,
    max_image_bytes: usize,
}

impl PhotoCache {
    pub fn new(config: &SyncConfig, supabase: Arc<SupabaseClient>) -> Self {
        Self {
            client: build_client(),
            supabase,
            bucket: config.photo_bucket.clone(),
            image_delay: std::time::Duration::from_millis(config.image_delay_ms),
            max_image_bytes: config.max_image_bytes,
        }
    }

    /// Host prefix of public objects in our bucket, used to recognize links
    /// that are already durable.
    pub fn storage_host(&self) -> String {
        self.supabase.public_url_prefix(&self.bucket)
    }

    /// Execute the fetch slots of a plan for one vehicle. Each failure is
    /// logged and skipped so one dead link never sinks the whole set.
    pub async fn execute(
        &self,
        source_id: &str,
        plan: &RefreshPlan,
    ) -> Result<(Vec<String>, u64, u64), SyncError> {
        let mut fetched = Vec::new();
        let mut uploaded = 0u64;
        let mut errors = 0u64;
        let mut index = 0usize;
        for action in &plan.actions {
            let ImageAction::Fetch(url) = action else {
                if matches!(action, ImageAction::Keep(_)) {
                    index += 1;
                }
                continue;
            };
            match self.cache_one(source_id, index, url).await {
                Ok(public_url) => {
                    uploaded += 1;
                    fetched.push(Some(public_url));
                }
                Err(err) => {
                    warn!(
                        target = "sync.photos",
                        source_id,
                        index,
                        error = %err,
                        "image refresh failed"
                    );
                    errors += 1;
                    fetched.push(None);
                }
            }
            index += 1;
            sleep(self.image_delay).await;
        }
        Ok((finalize_refresh(plan, fetched), uploaded, errors))
    }

    async fn cache_one(
        &self,
        source_id: &str,
        index: usize,
        url: &str,
    ) -> Result<String, SyncError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| SyncError::transient("photos", err.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::transient(
                "photos",
                format!("HTTP {} fetching image", response.status()),
            ));
        }
        if let Some(length) = response.content_length() {
            if length as usize > self.max_image_bytes {
                return Err(SyncError::storage(
                    "photos",
                    format!("image of {length} bytes exceeds cap"),
                ));
            }
        }
        let ext = extension_for(
            response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(""),
        );
        // Drain the body chunk by chunk so an oversized or unbounded
        // response is dropped at the cap instead of buffered in full.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| SyncError::transient("photos", err.to_string()))?
        {
            if !append_within_cap(&mut body, &chunk, self.max_image_bytes) {
                return Err(SyncError::storage(
                    "photos",
                    format!("image exceeds cap of {} bytes", self.max_image_bytes),
                ));
            }
        }
        let path = format!("{source_id}/{index}.{ext}");
        self.supabase
            .upload_object(&self.bucket, &path, body, &format!("image/{ext}"))
            .await
            .map_err(|err| SyncError::storage("photos", err.to_string()))?;
        let public = self.supabase.public_object_url(&self.bucket, &path);
        debug!(target = "sync.photos", source_id, index, "image cached");
        Ok(public)
    }
}

/// Appends `chunk` to `body` unless that would push it past `cap`.
fn append_within_cap(body: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    if body.len() + chunk.len() > cap {
        return false;
    }
    body.extend_from_slice(chunk);
    true
}

fn extension_for(content_type: &str) -> &'static str {
    if content_type.contains("png") {
        "png"
    } else if content_type.contains("webp") {
        "webp"
    } else {
        "jpg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn classify(url: &str, synced_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> LinkValidity {
        classify_signed_link(
            url,
            synced_at,
            now,
            "https://proj.supabase.co/storage/v1/object/public/vehicle-photos/",
            6,
            Duration::hours(24),
        )
    }

    #[test]
    fn extracts_x_expires_from_query() {
        assert_eq!(
            signed_url_expiry("https://cdn.example.com/a.jpg?x-expires=1756500000&sig=ab"),
            Some(1_756_500_000)
        );
        assert_eq!(signed_url_expiry("https://cdn.example.com/a.jpg"), None);
    }

    #[test]
    fn normalizes_double_encoding_and_query_plus() {
        assert_eq!(
            normalize_image_url("https://h/p%252Fx.jpg?sig=a+b"),
            "https://h/p%2Fx.jpg?sig=a%2Bb"
        );
        // A plus in the path is left alone.
        assert_eq!(normalize_image_url("https://h/a+b.jpg"), "https://h/a+b.jpg");
        // %25 not followed by hex digits is not an escape.
        assert_eq!(normalize_image_url("https://h/a%25zz"), "https://h/a%25zz");
    }

    #[test]
    fn blocklist_wins_even_with_far_future_signature() {
        let url = "https://p3-dcd-sign.byteimg.com/img.jpg?x-expires=9999999999";
        assert_eq!(classify(url, None, at(1_000)), LinkValidity::Blocked);
    }

    #[test]
    fn storage_links_are_durable() {
        let url = "https://proj.supabase.co/storage/v1/object/public/vehicle-photos/encar_1/0.jpg";
        assert_eq!(classify(url, None, at(1_000)), LinkValidity::Durable);
    }

    #[test]
    fn signature_expiry_honors_safety_margin() {
        let now = at(1_000_000);
        let soon = format!("https://cdn.x.com/a.jpg?x-expires={}", 1_000_000 + 3_600);
        let far = format!(
            "https://cdn.x.com/a.jpg?x-expires={}",
            1_000_000 + 3 * 86_400
        );
        assert_eq!(classify(&soon, None, now), LinkValidity::Expiring);
        assert_eq!(classify(&far, None, now), LinkValidity::Valid);
    }

    #[test]
    fn unsigned_links_fall_back_to_sync_age() {
        let now = at(10 * 86_400);
        let fresh = Some(at(9 * 86_400));
        let stale = Some(at(3 * 86_400));
        let url = "https://cdn.x.com/a.jpg";
        assert_eq!(classify(url, fresh, now), LinkValidity::Valid);
        assert_eq!(classify(url, stale, now), LinkValidity::Expiring);
        assert_eq!(classify(url, None, now), LinkValidity::Invalid);
        assert_eq!(classify("not a url", fresh, now), LinkValidity::Invalid);
    }

    #[test]
    fn sole_blocked_image_plans_to_empty() {
        let images = vec!["https://p1-dcd-sign.byteimg.com/only.jpg".to_string()];
        let plan = plan_refresh(&images, |_| LinkValidity::Blocked);
        assert_eq!(plan.blocked, 1);
        assert_eq!(finalize_refresh(&plan, vec![]), Vec::<String>::new());
    }

    #[test]
    fn failed_fetch_of_sole_expiring_image_yields_empty() {
        let images = vec!["https://cdn.x.com/a.jpg?x-expires=1".to_string()];
        let plan = plan_refresh(&images, |_| LinkValidity::Expiring);
        assert_eq!(plan.to_fetch, 1);
        assert_eq!(finalize_refresh(&plan, vec![None]), Vec::<String>::new());
    }

    #[test]
    fn finalize_preserves_display_order() {
        let images = vec![
            "https://k/0.jpg".to_string(),
            "https://e/1.jpg".to_string(),
            "https://b/2.jpg".to_string(),
            "https://e/3.jpg".to_string(),
        ];
        let plan = plan_refresh(&images, |url| {
            if url.contains("//k/") {
                LinkValidity::Valid
            } else if url.contains("//b/") {
                LinkValidity::Blocked
            } else {
                LinkValidity::Expiring
            }
        });
        let result = finalize_refresh(
            &plan,
            vec![Some("https://s/1.jpg".to_string()), None],
        );
        assert_eq!(result, vec!["https://k/0.jpg", "https://s/1.jpg"]);
    }

    #[test]
    fn download_stops_at_the_size_cap_mid_stream() {
        let mut body = Vec::new();
        assert!(append_within_cap(&mut body, &[0u8; 600], 1_000));
        // The chunk that would cross the cap is refused and not buffered.
        assert!(!append_within_cap(&mut body, &[0u8; 600], 1_000));
        assert_eq!(body.len(), 600);
        assert!(append_within_cap(&mut body, &[0u8; 400], 1_000));
        assert_eq!(body.len(), 1_000);
    }
}
