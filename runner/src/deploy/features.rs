//! Per-scope feature handlers: databases, DNS, PHP, HTTP version, www
//! redirects, document root, SSL and subdomain lifecycle.

use std::path::Path;

use serde_json::{json, Value};
use tracing::debug;

use crate::collab::dns::DnsChange;
use crate::deploy::config::{DbEngine, Directive, DirectiveKind};
use crate::deploy::pipeline::{Flow, Run, Scope};
use crate::deploy::ssl::{SslReconciler, SslRequest};
use crate::errors::RunnerError;
use crate::storage::settings::PromptStyle;
use crate::utils::{db_name, shell_escape};

/// Scalar directive value as text; `{http: 3}` reads as `3`
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "on".to_string(),
        Value::Bool(false) => "off".to_string(),
        _ => String::new(),
    }
}

impl Run<'_> {
    /// Dispatch one directive inside `scope`.
    ///
    /// Lifecycle verbs act on the scope's own domain; the other account-level
    /// directives act on the account user whichever scope lists them.
    pub(crate) async fn apply_feature(
        &mut self,
        scope: &mut Scope,
        directive: &Directive,
    ) -> Result<Flow, RunnerError> {
        match directive.kind {
            kind if kind.is_lifecycle() && scope.root => {
                self.record = scope.record.clone();
                let flow = self.apply_account(directive).await?;
                // a rename moves the root scope along
                scope.domain = self.domain.clone();
                scope.record = self.record.clone();
                Ok(flow)
            }
            kind if kind.is_lifecycle() => {
                if self.sandbox {
                    return Ok(Flow::Continue);
                }
                self.sub_lifecycle(scope, directive).await
            }
            kind if kind.is_account_level() => self.apply_account(directive).await,
            DirectiveKind::Database(engine) => {
                self.database(scope, engine, &value_text(&directive.value))
                    .await?;
                Ok(Flow::Continue)
            }
            DirectiveKind::Dns => {
                self.dns(scope, &directive.value).await?;
                Ok(Flow::Continue)
            }
            DirectiveKind::Php => {
                self.php(scope, &value_text(&directive.value)).await?;
                Ok(Flow::Continue)
            }
            DirectiveKind::Http => {
                self.http(scope, &value_text(&directive.value)).await?;
                Ok(Flow::Continue)
            }
            DirectiveKind::Www => {
                self.www(scope, &value_text(&directive.value)).await?;
                Ok(Flow::Continue)
            }
            DirectiveKind::Root => {
                self.change_root(scope, &value_text(&directive.value))
                    .await?;
                Ok(Flow::Continue)
            }
            DirectiveKind::Ssl => {
                self.ssl(scope, directive).await?;
                Ok(Flow::Continue)
            }
            _ => Ok(Flow::Continue),
        }
    }

    async fn sub_lifecycle(
        &mut self,
        scope: &mut Scope,
        directive: &Directive,
    ) -> Result<Flow, RunnerError> {
        let value = &directive.value;
        let target = json!({"domain": scope.domain});
        match directive.kind {
            DirectiveKind::Modify => {
                self.log.line("$> virtualmin modify-domain");
                self.virt("modify-domain", &[value, &target]).await?;
            }
            DirectiveKind::Rename => {
                self.log.line("$> virtualmin rename-domain");
                let new_domain = value.get("new-domain").and_then(Value::as_str);
                if let (Some(new_domain), Some(parent)) = (new_domain, scope.record.parent_domain()) {
                    if !new_domain.ends_with(&format!(".{}", parent)) {
                        return Err(RunnerError::InvalidInput(
                            "The new domain name must ends with parent domain".to_string(),
                        ));
                    }
                }
                if value.get("new-user").is_some_and(Value::is_string) {
                    return Err(RunnerError::InvalidInput(
                        "Can't rename username for subserver".to_string(),
                    ));
                }
                self.virt("rename-domain", &[value, &target]).await?;
                if let Some(new_domain) = new_domain {
                    scope.domain = new_domain.to_string();
                }
                tokio::time::sleep(self.deployer.timing.settle).await;
                scope.record = self
                    .collab()
                    .registry
                    .domain_info(&scope.domain)
                    .await?
                    .ok_or_else(|| RunnerError::NotFound(scope.domain.clone()))?;
            }
            DirectiveKind::Delete => {
                self.log.line("$> virtualmin delete-domain");
                self.virt("delete-domain", &[value, &target]).await?;
                return Ok(Flow::Stop);
            }
            _ => debug!("{} is not available for subdomains", directive.key),
        }
        Ok(Flow::Continue)
    }

    /// Database name under the account, prefixed by the subdomain label
    fn qualified_db(&self, scope: &Scope, name: &str) -> String {
        let name = if scope.db_prefix == "db" {
            name.to_string()
        } else {
            format!("{}_{}", scope.db_prefix, name)
        };
        db_name(self.record.username(), &name)
    }

    async fn database(
        &mut self,
        scope: &mut Scope,
        engine: DbEngine,
        value: &str,
    ) -> Result<(), RunnerError> {
        let feature = engine.feature();
        let name = engine.display_name();
        if !scope.root && !self.record.has_feature(feature) {
            self.log.line(format!(
                "Problem: Can't manage {} while it is disabled in parent domain",
                name
            ));
            return Ok(());
        }
        let mut target = json!({"domain": scope.domain});
        target[feature] = Value::Bool(true);

        if value == "off" {
            self.log.line(format!("$> Disabling {}", name));
            if self.sandbox {
                self.log.line(format!("$> turning off {} is denied", name));
            } else if scope.record.has_feature(feature) {
                self.virt("disable-feature", &[&target]).await?;
                scope.record.remove_feature(feature);
            } else {
                self.log.line("Already disabled");
            }
            return Ok(());
        }

        let mut dbname = db_name(self.record.username(), &scope.db_prefix);
        let mut need_create = false;
        if !scope.record.has_feature(feature) {
            self.log.line(format!("$> Enabling {}", name));
            self.virt("enable-feature", &[&target]).await?;
            need_create = true;
            if let Some(record) = self.collab().registry.domain_info(&scope.domain).await? {
                scope.record = record;
            }
            scope.record.add_feature(feature);
            let password = scope.record.password(feature).unwrap_or_default();
            let export = format!(" {}={}", engine.password_var(), shell_escape(password));
            self.exec_quiet(&export).await?;
        }
        if let Some(new_db) = value.strip_prefix("create ") {
            dbname = self.qualified_db(scope, new_db.trim());
            need_create = true;
        }

        if need_create {
            self.log
                .line(format!("$> Creating db instance {} on {}", dbname, name));
            self.virt(
                "create-database",
                &[&json!({"domain": scope.domain, "name": dbname, "type": feature})],
            )
            .await?;
        } else if self.sandbox && !value.is_empty() {
            self.log
                .line(format!("$> managing {} database is denied", name));
        } else if let Some(drop_db) = value.strip_prefix("drop ") {
            let dbname = self.qualified_db(scope, drop_db.trim());
            self.virt(
                "delete-database",
                &[&json!({"domain": scope.domain, "name": dbname, "type": feature})],
            )
            .await?;
        } else if let Some(pass) = value.strip_prefix("modify-pass ") {
            let pass = pass.trim();
            if !pass.is_empty() {
                self.virt(
                    "modify-database-pass",
                    &[&json!({"domain": scope.domain, "pass": pass, "type": feature})],
                )
                .await?;
                scope
                    .record
                    .set(&format!("Password for {}", feature), pass);
                let export = format!(" {}={}", engine.password_var(), shell_escape(pass));
                self.exec_quiet(&export).await?;
            }
        } else if value.is_empty() {
            self.log.line(format!(
                "$> {} is already initialized. To create another database, use \"{} create dbname\"",
                name, feature
            ));
        }
        Ok(())
    }

    async fn dns(&mut self, scope: &mut Scope, value: &Value) -> Result<(), RunnerError> {
        if !scope.root && !self.record.has_feature("dns") {
            self.log
                .line("Problem: Can't manage DNS while it is disabled in parent domain");
            return Ok(());
        }
        let target = json!({"domain": scope.domain, "dns": true});

        if value.as_str().map(str::trim) == Some("off") {
            self.log.line("$> Disabling DNS feature");
            if self.sandbox {
                self.log.line("$> turning off DNS feature is denied");
            } else if scope.record.has_feature("dns") {
                self.virt("disable-feature", &[&target]).await?;
                scope.record.remove_feature("dns");
            } else {
                self.log.line("Already disabled");
            }
            return Ok(());
        }

        if !scope.record.has_feature("dns") {
            self.log.line("$> Enabling DNS feature");
            self.virt("enable-feature", &[&target]).await?;
            scope.record.add_feature("dns");
        }

        let Value::Array(records) = value else {
            return Ok(());
        };
        if !scope.root {
            self.log.line("Problem: Can't manage DNS records on subdomain");
            return Ok(());
        }
        let changes = records
            .iter()
            .map(DnsChange::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        self.log.line("$> Applying DNS records");
        let status = self.collab().dns.set(&scope.domain, &changes).await?;
        self.log.line(status);
        Ok(())
    }

    async fn php(&mut self, scope: &mut Scope, value: &str) -> Result<(), RunnerError> {
        if value == "off" || value.ends_with(".sock") {
            if scope.record.php_mode() != "none" {
                self.log.line("$> Turning off PHP engine");
                self.virt(
                    "modify-web",
                    &[&json!({"domain": scope.domain, "mode": "none"})],
                )
                .await?;
                scope.record.set("PHP execution mode", "none");
            }
            if value == "off" {
                self.exec_quiet("rm -f ~/.local/bin/php").await?;
            }
            self.log.line("$> Updating nginx config");
            let mut info = self.collab().webserver.info(&scope.domain).await?;
            if value != "off" {
                let socket = Path::new("/home").join(self.record.username()).join(value.trim_start_matches('/'));
                info.fcgi = Some(format!("unix:{}", socket.display()));
            }
            let status = self.collab().webserver.set(&scope.domain, &info).await?;
            self.log.line(status);
            return Ok(());
        }

        let version = self.deployer.catalog.php(value)?;
        self.log
            .line(format!("$> Changing PHP engine to {}", version));
        if scope.record.php_mode() == "none" {
            self.virt(
                "modify-web",
                &[&json!({
                    "domain": scope.domain,
                    "mode": "fpm",
                    "php-fpm-mode": "ondemand",
                })],
            )
            .await?;
            scope.record.set("PHP execution mode", "fpm");
        }
        self.virt(
            "modify-web",
            &[&json!({"domain": scope.domain, "php-version": version})],
        )
        .await?;

        let binary = match self.deployer.prompt_style {
            PromptStyle::Debian => version.clone(),
            PromptStyle::Redhat => version.replace('.', ""),
        };
        self.exec_quiet(&format!(
            r#"mkdir -p ~/.local/bin; echo -e "\u23\u21/bin/bash\n$(which php{}) \u22\u24\u40\u22" > ~/.local/bin/php; chmod +x ~/.local/bin/php"#,
            binary
        ))
        .await
    }

    async fn http(&mut self, scope: &mut Scope, value: &str) -> Result<(), RunnerError> {
        let wanted = match value {
            "1" => 1,
            "3" => 3,
            _ => {
                return Err(RunnerError::InvalidInput(
                    "http option invalid. specify \"http 1\" or \"http 3\"".to_string(),
                ))
            }
        };
        let mut info = self.collab().webserver.info(&scope.domain).await?;
        if info.http == wanted {
            self.log.line("$> http version config is set unchanged");
            return Ok(());
        }
        info.config.http = Some(wanted);
        self.log
            .line(format!("$> Applying nginx http config on {}", scope.domain));
        let status = self.collab().webserver.set(&scope.domain, &info).await?;
        self.log.line(status);
        Ok(())
    }

    async fn www(&mut self, scope: &mut Scope, value: &str) -> Result<(), RunnerError> {
        if !matches!(value, "off" | "on" | "enforce" | "always") {
            return Err(RunnerError::InvalidInput(
                "www option invalid. specify \"www on\" or \"www off\" or \"www always\"".to_string(),
            ));
        }
        let mut info = self.collab().webserver.info(&scope.domain).await?;
        if info.www.as_deref() == Some(value) {
            self.log.line("$> www version config is set unchanged");
            return Ok(());
        }
        info.config.www = Some(value.to_string());
        self.log
            .line(format!("$> Applying nginx www config on {}", scope.domain));
        let status = self.collab().webserver.set(&scope.domain, &info).await?;
        self.log.line(status);
        Ok(())
    }

    /// Point the document root at `value`, relative to the home directory
    pub(crate) async fn change_root(&mut self, scope: &mut Scope, value: &str) -> Result<(), RunnerError> {
        let mut value = value.trim_matches('/');
        let prefix = format!("domains/{}/", scope.domain);
        if !scope.root {
            value = value.strip_prefix(&prefix).unwrap_or(value);
        }
        let home = scope.record.home_dir().trim_end_matches('/');
        let absolute = if value.is_empty() {
            home.to_string()
        } else {
            format!("{}/{}", home, value)
        };

        if absolute == scope.record.html_dir() {
            self.log.line("$> root path is set unchanged");
            return Ok(());
        }
        self.log.line(format!("$> Changing root path to {}", value));
        self.exec(&format!("mkdir -p {}", shell_escape(&absolute)))
            .await?;
        self.virt(
            "modify-web",
            &[&json!({"domain": scope.domain, "document-dir": value})],
        )
        .await?;
        scope.record.set("HTML directory", absolute);
        Ok(())
    }

    pub(crate) async fn ssl(&mut self, scope: &mut Scope, directive: &Directive) -> Result<(), RunnerError> {
        let request = SslRequest::parse(&value_text(&directive.value));
        let collab = self.collab();
        let reconciler = SslReconciler {
            registry: collab.registry.as_ref(),
            webserver: collab.webserver.as_ref(),
            gateway: collab.gateway.as_ref(),
            shared: &self.deployer.shared_certs,
            log: self.log,
            settle: self.deployer.timing.settle,
        };
        reconciler
            .reconcile(&scope.domain, &mut scope.record, request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_text() {
        assert_eq!(value_text(&json!(" 8.3 ")), "8.3");
        assert_eq!(value_text(&json!(3)), "3");
        assert_eq!(value_text(&json!(false)), "off");
        assert_eq!(value_text(&json!(["a"])), "");
    }
}
