use std::env;

/// Everything the pipeline components need, resolved once at startup and
/// passed into every constructor. No component reads the environment on
/// its own past this point.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub encar: ProviderConfig,
    pub dongchedi: ProviderConfig,
    pub che168: ProviderConfig,
    pub dubicars: ProviderConfig,

    /// Minimum delay between page fetches against one provider.
    pub page_delay_ms: u64,
    /// Minimum delay between per-image downloads.
    pub image_delay_ms: u64,
    /// Bounded retries for 429/5xx/transport failures on a page fetch.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Consecutive empty pages before a snapshot loop gives up.
    pub empty_page_limit: u32,

    pub default_max_pages: u32,
    pub hard_max_pages: u32,
    pub default_batch_size: usize,

    pub photo_bucket: String,
    pub photo_expiry_days: i64,
    /// Signed URLs expiring within this window are re-hosted proactively.
    pub expiring_margin_secs: i64,
    pub max_image_bytes: usize,
    pub photo_sync_limit: usize,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_base: String,
    pub api_key: String,
    pub export_host: Option<String>,
    pub export_login: Option<String>,
    pub export_password: Option<String>,
}

impl ProviderConfig {
    pub fn has_export(&self) -> bool {
        self.export_host.is_some() && self.export_login.is_some() && self.export_password.is_some()
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let encar_access = env_str("ENCAR_ACCESS_NAME").unwrap_or_else(|| "driveby".to_string());
        let encar_key = env_str("ENCAR_API_KEY").unwrap_or_default();
        Self {
            encar: ProviderConfig {
                api_base: format!("https://{encar_access}.auto-api.com/api/v2/encar"),
                api_key: encar_key.clone(),
                export_host: None,
                export_login: None,
                export_password: None,
            },
            dongchedi: ProviderConfig {
                api_base: env_str("DONGCHEDI_API_BASE")
                    .unwrap_or_else(|| "https://api1.auto-api.com/api/v2/dongchedi".to_string()),
                api_key: env_str("DONGCHEDI_API_KEY").unwrap_or_default(),
                export_host: Some(
                    env_str("DONGCHEDI_EXPORT_HOST")
                        .unwrap_or_else(|| "https://autobase-perez.auto-api.com".to_string()),
                ),
                export_login: env_str("DONGCHEDI_EXPORT_LOGIN"),
                export_password: env_str("DONGCHEDI_EXPORT_PASSWORD"),
            },
            che168: ProviderConfig {
                api_base: {
                    let access = env_str("CHE168_ACCESS_NAME")
                        .or_else(|| env_str("ENCAR_ACCESS_NAME"))
                        .unwrap_or_else(|| "api1".to_string());
                    format!("https://{access}.auto-api.com/api/v2/che168")
                },
                // served under the same account as Encar
                api_key: env_str("CHE168_API_KEY").unwrap_or_else(|| encar_key.clone()),
                export_host: None,
                export_login: None,
                export_password: None,
            },
            dubicars: ProviderConfig {
                api_base: env_str("DUBICARS_API_BASE")
                    .unwrap_or_else(|| "https://api1.auto-api.com/api/v2/dubicars".to_string()),
                // the Dubicars feed is served under the same account as Encar
                api_key: env_str("DUBICARS_API_KEY").unwrap_or(encar_key),
                export_host: None,
                export_login: None,
                export_password: None,
            },
            page_delay_ms: env_u64("SYNC_PAGE_DELAY_MS", 50),
            image_delay_ms: env_u64("SYNC_IMAGE_DELAY_MS", 50),
            max_retries: env_u64("SYNC_MAX_RETRIES", 3) as u32,
            retry_base_delay_ms: env_u64("SYNC_RETRY_BASE_DELAY_MS", 500),
            empty_page_limit: env_u64("SYNC_EMPTY_PAGE_LIMIT", 3) as u32,
            default_max_pages: env_u64("SYNC_DEFAULT_MAX_PAGES", 500) as u32,
            hard_max_pages: env_u64("SYNC_HARD_MAX_PAGES", 2000) as u32,
            default_batch_size: env_u64("SYNC_BATCH_SIZE", 100) as usize,
            photo_bucket: env_str("PHOTO_CACHE_BUCKET")
                .unwrap_or_else(|| "vehicle-photos".to_string()),
            photo_expiry_days: env_u64("PHOTO_EXPIRY_DAYS", 6) as i64,
            expiring_margin_secs: env_u64("PHOTO_EXPIRING_MARGIN_SECS", 24 * 3600) as i64,
            max_image_bytes: env_u64("PHOTO_MAX_IMAGE_BYTES", 5 * 1024 * 1024) as usize,
            photo_sync_limit: env_u64("PHOTO_SYNC_LIMIT", 100) as usize,
        }
    }

    pub fn provider(&self, source: crate::models::Source) -> &ProviderConfig {
        match source {
            crate::models::Source::Korea => &self.encar,
            crate::models::Source::China => &self.dongchedi,
            crate::models::Source::Dubai => &self.dubicars,
        }
    }

    pub fn clamp_max_pages(&self, requested: Option<u32>) -> u32 {
        requested
            .filter(|v| *v > 0)
            .unwrap_or(self.default_max_pages)
            .min(self.hard_max_pages)
    }

    pub fn clamp_batch_size(&self, requested: Option<usize>) -> usize {
        requested
            .filter(|v| *v > 0)
            .unwrap_or(self.default_batch_size)
            .min(1000)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_cap_is_clamped() {
        let config = SyncConfig::from_env();
        assert_eq!(config.clamp_max_pages(None), config.default_max_pages);
        assert_eq!(config.clamp_max_pages(Some(0)), config.default_max_pages);
        assert_eq!(
            config.clamp_max_pages(Some(u32::MAX)),
            config.hard_max_pages
        );
        assert_eq!(config.clamp_max_pages(Some(10)), 10);
    }

    #[test]
    fn batch_size_defaults() {
        let config = SyncConfig::from_env();
        assert_eq!(config.clamp_batch_size(None), config.default_batch_size);
        assert_eq!(config.clamp_batch_size(Some(5000)), 1000);
    }
}
