// Per-shard issuer metadata
//
// Accumulates issuer distinguished names and CRL distribution point URLs
// into duplicate-tolerant sorted sets. The existence check on the issuer key
// doubles as the shard-first signal the database uses to allocate markers.

use crate::cache::{crls_key, issuers_key, RemoteCache};
use crate::ids::{ExpDate, Issuer};
use crate::known::EXPIRY_SLACK_DAYS;
use crate::Result;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};

/// Result of folding one certificate into a shard's metadata.
#[derive(Debug, Clone, Copy)]
pub struct Accumulated {
    /// Whether the shard existed before this call; false is the shard-first
    /// signal that drives marker allocation.
    pub seen_before: bool,
    /// CRL distribution points newly added by this call.
    pub crls_added: u64,
}

pub struct IssuerMetadata {
    exp_date: ExpDate,
    issuers_key: String,
    crls_key: String,
    cache: Arc<dyn RemoteCache>,
}

impl IssuerMetadata {
    pub fn new(exp_date: ExpDate, issuer: &Issuer, cache: Arc<dyn RemoteCache>) -> IssuerMetadata {
        IssuerMetadata {
            exp_date,
            issuers_key: issuers_key(&exp_date, issuer),
            crls_key: crls_key(&exp_date, issuer),
            cache,
        }
    }

    /// Fold one certificate into the shard's metadata. Must tolerate
    /// duplicate information. `seen_before` reports whether the shard had
    /// been touched before this call.
    pub async fn accumulate(&self, cert: &X509Certificate<'_>) -> Result<Accumulated> {
        let seen_before = self.cache.exists(&self.issuers_key).await?;
        let mut crls_added = 0u64;

        for dp in crl_distribution_urls(cert) {
            let parsed = match Url::parse(&dp) {
                Ok(u) => u,
                Err(e) => {
                    warn!("Not a valid CRL DP URL: {} {}", dp, e);
                    continue;
                }
            };
            match parsed.scheme() {
                "http" | "https" => {
                    if self.cache.sorted_insert(&self.crls_key, &dp).await? {
                        crls_added += 1;
                    }
                }
                "ldap" | "ldaps" => continue,
                other => {
                    debug!("Ignoring unknown CRL scheme {}: {}", other, dp);
                }
            }
        }

        self.cache
            .sorted_insert(&self.issuers_key, &cert.issuer().to_string())
            .await?;

        Ok(Accumulated { seen_before, crls_added })
    }

    /// Attach the shard TTL to both metadata keys.
    pub async fn set_expiry_flag(&self) -> Result<()> {
        let deadline = self.exp_date.expiry_deadline(Duration::days(EXPIRY_SLACK_DAYS));
        self.cache.expire_at(&self.issuers_key, deadline).await?;
        self.cache.expire_at(&self.crls_key, deadline).await
    }

    /// Issuer DN strings seen so far, in sort order.
    pub async fn issuers(&self) -> Result<Vec<String>> {
        self.cache.sorted_list(&self.issuers_key).await
    }

    /// CRL distribution point URLs seen so far, in sort order.
    pub async fn crls(&self) -> Result<Vec<String>> {
        self.cache.sorted_list(&self.crls_key).await
    }
}

/// URI-form CRL distribution points of a certificate.
fn crl_distribution_urls(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut urls = Vec::new();
    for ext in cert.extensions() {
        let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() else {
            continue;
        };
        for point in points.points.iter() {
            let Some(DistributionPointName::FullName(names)) = &point.distribution_point else {
                continue;
            };
            for name in names {
                if let GeneralName::URI(uri) = name {
                    urls.push((*uri).to_string());
                }
            }
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn metadata(cache: &Arc<MemoryCache>) -> IssuerMetadata {
        IssuerMetadata::new(
            ExpDate::parse("2026-08-08").unwrap(),
            &Issuer::from_id("iss"),
            Arc::clone(cache) as Arc<dyn RemoteCache>,
        )
    }

    #[tokio::test]
    async fn test_first_touch_reports_unseen() {
        let cache = Arc::new(MemoryCache::new());
        let md = metadata(&cache);
        // No certificate parsing needed to observe the shard-first signal:
        // the issuers key does not exist until the first accumulate.
        assert!(!cache.exists("issuer::2026-08-08::iss").await.unwrap());
        cache
            .sorted_insert("issuer::2026-08-08::iss", "CN=Example CA")
            .await
            .unwrap();
        assert!(cache.exists("issuer::2026-08-08::iss").await.unwrap());
        assert_eq!(md.issuers().await.unwrap(), vec!["CN=Example CA"]);
    }

    #[tokio::test]
    async fn test_crls_listed_sorted_and_deduplicated() {
        let cache = Arc::new(MemoryCache::new());
        let md = metadata(&cache);
        for url in ["https://c/crl", "http://a/crl", "http://a/crl"] {
            cache.sorted_insert(&md.crls_key, url).await.unwrap();
        }
        assert_eq!(md.crls().await.unwrap(), vec!["http://a/crl", "https://c/crl"]);
    }
}
