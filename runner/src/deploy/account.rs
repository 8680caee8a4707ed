//! Directives acting on the hosting account as a whole: domain lifecycle,
//! egress firewall, rootless containers and language runtimes.

use serde_json::json;
use tracing::debug;

use crate::deploy::config::{Directive, DirectiveKind};
use crate::deploy::pipeline::{Flow, Run};
use crate::deploy::runtimes::{self, docker_setup, docker_teardown};
use crate::errors::RunnerError;
use crate::gateway::Operation;

impl Run<'_> {
    pub(crate) async fn apply_account(&mut self, directive: &Directive) -> Result<Flow, RunnerError> {
        match directive.kind {
            DirectiveKind::Create => Ok(Flow::Continue),
            kind if kind.is_lifecycle() => {
                if self.sandbox {
                    debug!("sandbox: skipping {}", directive.key);
                    return Ok(Flow::Continue);
                }
                self.lifecycle(directive).await
            }
            DirectiveKind::Firewall => {
                self.firewall(directive.text()).await?;
                Ok(Flow::Continue)
            }
            DirectiveKind::Docker => {
                self.docker(directive.text()).await?;
                Ok(Flow::Continue)
            }
            DirectiveKind::Runtime(runtime) => {
                let recipe = runtimes::recipe(runtime, directive.text(), &self.deployer.catalog)?;
                self.log.line(&recipe.note);
                self.exec_steps(&recipe.steps).await?;
                Ok(Flow::Continue)
            }
            _ => Ok(Flow::Continue),
        }
    }

    async fn lifecycle(&mut self, directive: &Directive) -> Result<Flow, RunnerError> {
        let domain = json!({"domain": self.domain});
        let value = &directive.value;
        match directive.kind {
            DirectiveKind::Modify => {
                self.log.line("$> virtualmin modify-domain");
                self.virt("modify-domain", &[value, &domain]).await?;
            }
            DirectiveKind::Rename => self.rename(directive).await?,
            DirectiveKind::Disable => {
                self.log.line("$> virtualmin disable-domain");
                self.virt("disable-domain", &[value, &domain]).await?;
            }
            DirectiveKind::Enable => {
                self.log.line("$> virtualmin enable-domain");
                self.virt("enable-domain", &[value, &domain]).await?;
            }
            DirectiveKind::Backup => {
                self.log.line("$> virtualmin backup-domain");
                let fixed = json!({
                    "domain": self.domain,
                    "all-features": value.get("features").is_none(),
                    "as-owner": true,
                });
                self.virt("backup-domain", &[value, &fixed]).await?;
            }
            DirectiveKind::Restore => {
                self.log.line("$> virtualmin restore-domain");
                let fixed = json!({"domain": self.domain, "reuid": true});
                self.virt("restore-domain", &[value, &fixed]).await?;
            }
            DirectiveKind::Delete => {
                let user = self.record.username().to_string();
                self.log.line("$> virtualmin delete-domain");
                let killed = self
                    .collab()
                    .gateway
                    .invoke(
                        Operation::ShellSudo,
                        &[user.clone(), "killall".into(), "-u".into(), user.clone()],
                        None,
                    )
                    .await?;
                debug!("killall for {} exited with {}", user, killed.code);
                self.virt("delete-domain", &[value, &json!({"user": user})])
                    .await?;
                let cleaned = self
                    .collab()
                    .gateway
                    .invoke(Operation::PhpfpmClean, &[self.record.id().to_string()], None)
                    .await?;
                debug!("php-fpm cleanup exited with {}", cleaned.code);
                return Ok(Flow::Stop);
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    async fn rename(&mut self, directive: &Directive) -> Result<(), RunnerError> {
        let value = &directive.value;
        let new_user = value.get("new-user").and_then(|v| v.as_str());
        let restricted = match new_user {
            Some(_) => self.firewall_status().await?,
            None => false,
        };
        let uid = self.record.uid().to_string();
        if restricted {
            let status = self
                .collab()
                .firewall
                .set_del_user(self.record.username(), &uid)
                .await?;
            self.log.line(status);
        }

        self.log.line("$> virtualmin rename-domain");
        self.virt("rename-domain", &[value, &json!({"domain": self.domain})])
            .await?;
        if let Some(new_domain) = value.get("new-domain").and_then(|v| v.as_str()) {
            self.domain = new_domain.to_string();
        }
        tokio::time::sleep(self.deployer.timing.settle).await;

        self.record = self
            .collab()
            .registry
            .domain_info(&self.domain)
            .await?
            .ok_or_else(|| RunnerError::NotFound(self.domain.clone()))?;
        if restricted {
            let status = self
                .collab()
                .firewall
                .set_add_user(self.record.username(), &uid)
                .await?;
            self.log.line(status);
        }
        Ok(())
    }

    async fn firewall(&mut self, value: &str) -> Result<(), RunnerError> {
        let (user, uid) = (
            self.record.username().to_string(),
            self.record.uid().to_string(),
        );
        match value {
            "" | "on" => {
                self.log.line("$> Changing firewall protection to on");
                let status = self.collab().firewall.set_add_user(&user, &uid).await?;
                self.log.line(status);
                self.firewall = Some(true);
            }
            "off" => {
                self.log.line("$> Changing firewall protection to off");
                let status = self.collab().firewall.set_del_user(&user, &uid).await?;
                self.log.line(status);
                self.firewall = Some(false);
            }
            other => {
                return Err(RunnerError::InvalidInput(format!(
                    "firewall option '{}' invalid. specify \"firewall on\" or \"firewall off\"",
                    other
                )))
            }
        }
        Ok(())
    }

    async fn docker(&mut self, value: &str) -> Result<(), RunnerError> {
        let user = self.record.username().to_string();
        match value {
            "" | "on" => {
                self.log.line("$> Enabling docker features");
                let out = self
                    .collab()
                    .gateway
                    .invoke(Operation::LingerEnable, &[user], None)
                    .await?
                    .check(Operation::LingerEnable)?;
                if !out.stdout.trim().is_empty() {
                    self.log.line(out.stdout.trim());
                }
                self.exec_steps(&docker_setup()).await
            }
            "off" => {
                self.log.line("$> Disabling docker features");
                self.exec_steps(&docker_teardown()).await?;
                let out = self
                    .collab()
                    .gateway
                    .invoke(Operation::LingerDisable, &[user], None)
                    .await?
                    .check(Operation::LingerDisable)?;
                if !out.stdout.trim().is_empty() {
                    self.log.line(out.stdout.trim());
                }
                Ok(())
            }
            other => Err(RunnerError::InvalidInput(format!(
                "docker option '{}' invalid. specify \"docker on\" or \"docker off\"",
                other
            ))),
        }
    }
}
