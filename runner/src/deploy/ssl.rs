//! SSL reconciliation for one domain.
//!
//! Weighs the requested mode, wildcard-certificate eligibility, a forced
//! renewal and the certificate expiry, then touches the web-server config at
//! most once.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{Months, Utc};
use serde_json::json;
use tracing::debug;

use crate::collab::registry::{DomainRecord, DomainRegistry};
use crate::collab::webserver::{SiteInfo, WebServerConfig};
use crate::errors::RunnerError;
use crate::gateway::{Operation, PrivilegedGateway};
use crate::output::LogWriter;
use crate::storage::settings::SharedCertificate;

/// Days of validity left under which a Let's Encrypt certificate is renewed
const RENEWAL_WINDOW_DAYS: i64 = 30;

/// What an `ssl` directive asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslRequest {
    /// No explicit mode: keep a valid certificate, issue one when missing
    Auto,
    /// Listener mode `off`, `always` or `on`
    Mode(&'static str),
    /// Force a new Let's Encrypt certificate
    Renew,
    SelfSign,
}

impl SslRequest {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "off" => SslRequest::Mode("off"),
            "always" => SslRequest::Mode("always"),
            "on" => SslRequest::Mode("on"),
            "letsencrypt" | "lets-encrypt" | "renew" => SslRequest::Renew,
            "selfsign" | "self-sign" => SslRequest::SelfSign,
            _ => SslRequest::Auto,
        }
    }
}

/// Wildcard certificate covering `domain`, if one is configured for its parent
pub fn shared_certificate<'a>(
    shared: &'a [SharedCertificate],
    domain: &str,
) -> Option<&'a SharedCertificate> {
    let (_, parent) = domain.split_once('.')?;
    shared.iter().find(|cert| cert.domain == parent)
}

fn cert_path(cert: &SharedCertificate, file: &str) -> String {
    Path::new(&cert.path).join(file).to_string_lossy().into_owned()
}

/// Collaborators the reconciliation talks to
pub struct SslReconciler<'a> {
    pub registry: &'a dyn DomainRegistry,
    pub webserver: &'a dyn WebServerConfig,
    pub gateway: &'a dyn PrivilegedGateway,
    pub shared: &'a [SharedCertificate],
    pub log: &'a LogWriter,
    /// Pause after breaking a share so the panel rewrites its paths
    pub settle: Duration,
}

impl SslReconciler<'_> {
    /// Bring the SSL state of `domain` in line with `request`.
    ///
    /// `record` is refreshed in place when the panel changes it.
    pub async fn reconcile(
        &self,
        domain: &str,
        record: &mut DomainRecord,
        request: SslRequest,
    ) -> Result<(), RunnerError> {
        let renew = request == SslRequest::Renew;
        let self_sign = request == SslRequest::SelfSign;
        let mut mode = match request {
            SslRequest::Mode(m) => Some(m),
            _ => None,
        };

        let shared = if renew {
            None
        } else {
            shared_certificate(self.shared, domain)
        };
        let mut info = self.webserver.info(domain).await?;

        let (mut expect_cert, mut expect_key) = self.expected_files(shared, record);
        if (expect_cert.is_none() || expect_key.is_none()) && !renew {
            mode = Some("off");
        }

        let auto = mode.is_none() && !self_sign;
        if renew || auto || expect_cert != info.ssl_certificate {
            let breaks_share = record
                .ssl_shared_with()
                .is_some_and(|with| shared.is_none_or(|cert| cert.domain != with));
            if breaks_share {
                self.log.line("$> Breaking ssl cert sharing");
                self.registry
                    .execute(
                        "modify-web",
                        &[&json!({"domain": domain, "break-ssl-cert": true})],
                        self.log,
                    )
                    .await?;
                tokio::time::sleep(self.settle).await;
                *record = self
                    .registry
                    .domain_info(domain)
                    .await?
                    .ok_or_else(|| RunnerError::NotFound(domain.to_string()))?;
                info = self.webserver.info(domain).await?;
                if shared.is_none() {
                    (expect_cert, expect_key) = self.expected_files(None, record);
                }
            }
        }

        let mut changed = false;
        if expect_cert != info.ssl_certificate {
            info.ssl_certificate = expect_cert;
            changed = true;
        }
        if expect_key != info.ssl_certificate_key {
            info.ssl_certificate_key = expect_key;
            changed = true;
        }
        let html = Some(record.html_dir().to_string());
        if html != info.root {
            info.root = html;
            changed = true;
        }
        if let Some(mode) = mode {
            if mode != info.ssl_mode() {
                info.set_ssl_mode(mode);
                changed = true;
            }
        }
        let link_share = shared.filter(|cert| record.ssl_shared_with() != Some(cert.domain.as_str()));
        if link_share.is_some() {
            changed = true;
        }

        let mut issued = false;
        if shared.is_none() && (renew || auto) {
            issued = self.letsencrypt(domain, record, renew).await?;
        } else if self_sign
            || mode == Some("off")
            || (shared.is_some() && record.ssl_shared_with().is_none() && mode.is_none())
        {
            if record.ssl_shared_with().is_some() {
                return Err(RunnerError::InvalidInput(
                    "Cannot turn off SSL while using shared domain!".to_string(),
                ));
            }
            self.log
                .line("$> Generating self signed cert and turning off let's encrypt renewal");
            self.registry
                .execute(
                    "generate-cert",
                    &[&json!({"domain": domain, "self": true})],
                    self.log,
                )
                .await?;
            record.remove("Lets Encrypt renewal");
            issued = true;
        }

        if !changed && !issued {
            self.log.line("$> SSL config seems OK, nothing changed");
            return Ok(());
        }

        self.apply(domain, record, &info, link_share).await
    }

    fn expected_files(
        &self,
        shared: Option<&SharedCertificate>,
        record: &DomainRecord,
    ) -> (Option<String>, Option<String>) {
        match shared {
            Some(cert) => (
                Some(cert_path(cert, "ssl.combined")),
                Some(cert_path(cert, "ssl.key")),
            ),
            None => (
                record.ssl_cert_file().map(str::to_string),
                record.ssl_key_file().map(str::to_string),
            ),
        }
    }

    /// Returns whether a certificate was requested
    async fn letsencrypt(
        &self,
        domain: &str,
        record: &mut DomainRecord,
        force: bool,
    ) -> Result<bool, RunnerError> {
        let remaining = record
            .ssl_expiry()
            .map(|at| (at - Utc::now()).num_days())
            .unwrap_or(0);
        let covers_domain = record.ssl_candidate_hostnames() == Some(domain);

        if !force && covers_domain && record.letsencrypt_renewal() && remaining > RENEWAL_WINDOW_DAYS {
            self.log.line(format!(
                "$> SSL cert expiry is {} days away so skipping renewal",
                remaining
            ));
            self.log.line("$> To enforce renewal please use 'ssl renew'");
            return Ok(false);
        }

        self.log.line("$> Generating SSL cert with Let's Encrypt");
        self.gateway
            .invoke(Operation::OpensslClean, &[], None)
            .await?
            .check(Operation::OpensslClean)?;
        self.registry
            .execute(
                "generate-letsencrypt-cert",
                &[&json!({
                    "domain": domain,
                    "renew": 2,
                    "web": true,
                    "validate-first": true,
                })],
                self.log,
            )
            .await?;
        if let Some(next) = Utc::now().checked_add_months(Months::new(3)) {
            record.set("SSL cert expiry", next.to_rfc3339());
        }
        Ok(true)
    }

    async fn apply(
        &self,
        domain: &str,
        record: &mut DomainRecord,
        info: &SiteInfo,
        link_share: Option<&SharedCertificate>,
    ) -> Result<(), RunnerError> {
        self.log
            .line(format!("$> Applying nginx ssl config on {}", domain));
        self.log.line(self.webserver.set(domain, info).await?);

        if let Some(cert) = link_share {
            self.log.line("$> Applying SSL links with global domain");
            let links: BTreeMap<String, String> = [
                ("ssl_same", cert.id.clone()),
                ("ssl_key", cert_path(cert, "ssl.key")),
                ("ssl_cert", cert_path(cert, "ssl.cert")),
                ("ssl_chain", cert_path(cert, "ssl.ca")),
                ("ssl_combined", cert_path(cert, "ssl.combined")),
                ("ssl_everything", cert_path(cert, "ssl.everything")),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
            let status = self.registry.push_server_config(record.id(), &links).await?;
            self.log.line(status);
            record.set("SSL shared with", cert.domain.clone());
            debug!("Linked {} to shared certificate {}", domain, cert.domain);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        assert_eq!(SslRequest::parse("always"), SslRequest::Mode("always"));
        assert_eq!(SslRequest::parse("lets-encrypt"), SslRequest::Renew);
        assert_eq!(SslRequest::parse("self-sign"), SslRequest::SelfSign);
        assert_eq!(SslRequest::parse(""), SslRequest::Auto);
        assert_eq!(SslRequest::parse("yes"), SslRequest::Auto);
    }

    #[test]
    fn test_shared_certificate_matches_direct_children_only() {
        let shared = vec![SharedCertificate {
            domain: "example.com".into(),
            id: "42".into(),
            path: "/home/wild/ssl".into(),
        }];
        assert_eq!(shared_certificate(&shared, "app.example.com").map(|c| c.id.as_str()), Some("42"));
        assert!(shared_certificate(&shared, "a.b.example.com").is_none());
        assert!(shared_certificate(&shared, "example.com").is_none());
        assert_eq!(cert_path(&shared[0], "ssl.key"), "/home/wild/ssl/ssl.key");
    }
}
