//! Deployment pipeline: one configuration against one domain.
//!
//! Every scope (the root domain and its subdomains) applies its features in
//! configuration order, then its source, commands and services. Account-level
//! directives are routed to the account whatever scope lists them. SSL
//! directives of a scope run last, also when the scope failed.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::collab::compose::ServicesSpec;
use crate::collab::registry::DomainRecord;
use crate::collab::Collaborators;
use crate::deploy::catalog::VersionCatalog;
use crate::deploy::config::{Command, DeploymentConfig, Directive, SourceSpec};
use crate::deploy::runtimes::Step;
use crate::deploy::source;
use crate::errors::RunnerError;
use crate::gateway::Operation;
use crate::output::LogWriter;
use crate::shell::{Shell, ShellLauncher};
use crate::storage::settings::{PromptStyle, SharedCertificate};
use crate::utils::{db_name, shell_escape, version_info};

/// Waits and retry counts of the pipeline
#[derive(Debug, Clone)]
pub struct PipelineTiming {
    /// Registry polls after `create` before giving up
    pub create_attempts: u32,
    pub poll_interval: Duration,
    /// Pause after renames and certificate changes
    pub settle: Duration,
}

impl Default for PipelineTiming {
    fn default() -> Self {
        Self {
            create_attempts: 10,
            poll_interval: Duration::from_secs(3),
            settle: Duration::from_secs(1),
        }
    }
}

/// Whether the pipeline goes on after a directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// The domain was deleted
    Stop,
}

/// Runs deployment configurations
pub struct Deployer {
    pub(crate) collab: Collaborators,
    pub(crate) catalog: Arc<VersionCatalog>,
    launcher: Arc<dyn ShellLauncher>,
    pub(crate) shared_certs: Vec<SharedCertificate>,
    pub(crate) prompt_style: PromptStyle,
    pub(crate) timing: PipelineTiming,
}

impl Deployer {
    pub fn new(
        collab: Collaborators,
        catalog: Arc<VersionCatalog>,
        launcher: Arc<dyn ShellLauncher>,
    ) -> Self {
        Self {
            collab,
            catalog,
            launcher,
            shared_certs: Vec::new(),
            prompt_style: PromptStyle::default(),
            timing: PipelineTiming::default(),
        }
    }

    pub fn with_shared_certificates(mut self, certs: Vec<SharedCertificate>) -> Self {
        self.shared_certs = certs;
        self
    }

    pub fn with_prompt_style(mut self, style: PromptStyle) -> Self {
        self.prompt_style = style;
        self
    }

    pub fn with_timing(mut self, timing: PipelineTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Apply `body` to `domain`, writing progress to `log`.
    ///
    /// In sandbox mode lifecycle and destructive operations are skipped.
    pub async fn run(
        &self,
        body: Value,
        domain: &str,
        sandbox: bool,
        log: &LogWriter,
    ) -> Result<(), RunnerError> {
        let version = version_info();
        log.line(format!(
            "hostrunner v{} ref {} in {} at {}",
            version.version,
            version.git_hash,
            domain,
            Utc::now().to_rfc3339()
        ));

        let config = DeploymentConfig::from_value(body)?;
        if let Some(create) = config.create_request() {
            if !sandbox {
                self.create_domain(domain, create, log).await?;
            }
        }

        let Some(record) = self.collab.registry.domain_info(domain).await? else {
            log.line("\n$> Server is not exist. Finishing execution");
            return Ok(());
        };
        info!("Deploying {} as {}", domain, record.username());

        let shell = self
            .launcher
            .launch(record.username(), log.clone())
            .await?;
        let mut run = Run {
            deployer: self,
            log,
            shell,
            sandbox,
            domain: domain.to_string(),
            record,
            firewall: None,
        };
        let result = run.execute(&config).await;
        run.shell.close().await;
        result
    }

    async fn create_domain(
        &self,
        domain: &str,
        create: &Directive,
        log: &LogWriter,
    ) -> Result<(), RunnerError> {
        log.line("$> virtualmin create-domain");
        log.line("Creating virtual domain. This will take a moment...");
        let standalone = create.value.get("parent").is_none();
        self.collab
            .registry
            .execute(
                "create-domain",
                &[
                    &json!({"domain": domain}),
                    &create.value,
                    &json!({
                        "dir": true,
                        "virtualmin-nginx": true,
                        "virtualmin-nginx-ssl": true,
                        "webmin": standalone,
                        "unix": standalone,
                    }),
                ],
                log,
            )
            .await?;

        log.line("$> virtualmin list-domains");
        let attempts = self.timing.create_attempts.max(1);
        let mut found = false;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.timing.poll_interval).await;
            if self.collab.registry.domain_info(domain).await?.is_some() {
                found = true;
                break;
            }
            debug!("{} not visible yet (attempt {}/{})", domain, attempt, attempts);
        }
        if !found {
            return Err(RunnerError::NotFound(format!(
                "Domain {} not found after {} tries",
                domain, attempts
            )));
        }

        let out = self
            .collab
            .gateway
            .invoke(Operation::NginxStart, &[], None)
            .await?;
        debug!("nginx start after create exited with {}", out.code);
        Ok(())
    }
}

/// One web scope: the root domain or a subdomain
pub(crate) struct Scope {
    pub domain: String,
    pub record: DomainRecord,
    pub root: bool,
    /// First scope of the run, exports the account variables
    pub first: bool,
    /// `db` for the root scope, the subdomain label otherwise
    pub db_prefix: String,
}

impl Scope {
    pub fn public_html(&self) -> String {
        format!("{}/public_html", self.record.home_dir())
    }
}

/// State of one deployment run
pub(crate) struct Run<'a> {
    pub deployer: &'a Deployer,
    pub log: &'a LogWriter,
    pub shell: Box<dyn Shell>,
    pub sandbox: bool,
    /// Root domain, follows renames
    pub domain: String,
    /// Root domain record
    pub record: DomainRecord,
    /// Cached egress restriction of the account user
    pub firewall: Option<bool>,
}

impl Run<'_> {
    pub fn collab(&self) -> &Collaborators {
        &self.deployer.collab
    }

    pub async fn exec(&mut self, command: &str) -> Result<(), RunnerError> {
        self.shell.exec(command, true).await
    }

    pub async fn exec_quiet(&mut self, command: &str) -> Result<(), RunnerError> {
        self.shell.exec(command, false).await
    }

    pub async fn exec_steps(&mut self, steps: &[Step]) -> Result<(), RunnerError> {
        for step in steps {
            self.shell.exec(&step.command, step.echo).await?;
        }
        Ok(())
    }

    /// Run a panel program; later option objects override earlier ones
    pub async fn virt(&self, program: &str, options: &[&Value]) -> Result<(), RunnerError> {
        self.collab().registry.execute(program, options, self.log).await
    }

    /// Egress restriction of the account user, looked up once per run
    pub async fn firewall_status(&mut self) -> Result<bool, RunnerError> {
        if let Some(status) = self.firewall {
            return Ok(status);
        }
        let status = self
            .collab()
            .firewall
            .is_restricted(self.record.username(), self.record.uid())
            .await?;
        self.firewall = Some(status);
        Ok(status)
    }

    async fn execute(&mut self, config: &DeploymentConfig) -> Result<(), RunnerError> {
        match &config.subdomain {
            Some(sub) => {
                let domain = format!("{}.{}", sub, self.domain);
                self.run_scope(config, domain, false, true).await?;
            }
            None => {
                let domain = self.domain.clone();
                if self.run_scope(config, domain, true, true).await? == Flow::Stop {
                    return Ok(());
                }
                for sub in &config.subdomains {
                    let Some(name) = &sub.subdomain else {
                        warn!("Skipping subdomain entry without a name");
                        continue;
                    };
                    let domain = format!("{}.{}", name, self.domain);
                    self.run_scope(sub, domain, false, false).await?;
                }
            }
        }
        Ok(())
    }

    /// Account credentials for the commands of every scope
    async fn export_account_vars(&mut self) -> Result<(), RunnerError> {
        let mut vars = format!(" USERNAME={}", shell_escape(self.record.username()));
        if let Some(password) = self.record.get("Password") {
            vars.push_str(&format!(" PASSWORD={}", shell_escape(password)));
        }
        self.exec_quiet(&vars).await
    }

    async fn run_scope(
        &mut self,
        config: &DeploymentConfig,
        domain: String,
        root: bool,
        first: bool,
    ) -> Result<Flow, RunnerError> {
        let record = if root {
            self.record.clone()
        } else {
            match self.collab().registry.domain_info(&domain).await? {
                Some(record) => record,
                None => {
                    self.log.line(format!(
                        "\n$> Server is not exist. Finishing execution for {} domain\n",
                        domain
                    ));
                    return Ok(Flow::Continue);
                }
            }
        };
        let db_prefix = match record.parent_domain() {
            Some(parent) if !root => domain
                .strip_suffix(&format!(".{}", parent))
                .unwrap_or(&domain)
                .to_string(),
            _ => "db".to_string(),
        };
        let mut scope = Scope {
            domain,
            record,
            root,
            first,
            db_prefix,
        };

        let body = self.scope_body(config, &mut scope).await;
        if matches!(body, Ok(Flow::Stop)) {
            return Ok(Flow::Stop);
        }
        if let Err(e) = &body {
            warn!("Scope {} failed, still applying SSL: {}", scope.domain, e);
        }

        let mut ssl = Ok(());
        for directive in config.deferred_features() {
            ssl = self.ssl(&mut scope, directive).await;
            if ssl.is_err() {
                break;
            }
        }
        if root {
            self.record = scope.record;
        }
        let flow = body?;
        ssl?;
        Ok(flow)
    }

    async fn scope_body(
        &mut self,
        config: &DeploymentConfig,
        scope: &mut Scope,
    ) -> Result<Flow, RunnerError> {
        if scope.first {
            self.export_account_vars().await?;
        }
        if config.uses_web_root() {
            self.exec(&format!("mkdir -p '{}' && cd \"$_\"", scope.public_html()))
                .await?;
        }

        if !config.features.is_empty() {
            self.log.line("$> Applying features");
            for directive in config.ordered_features() {
                if self.apply_feature(scope, directive).await? == Flow::Stop {
                    return Ok(Flow::Stop);
                }
            }
        }

        if let Some(nginx) = &config.nginx {
            self.log
                .line(format!("$> Applying nginx config on {}", scope.domain));
            let status = self.collab().webserver.apply(&scope.domain, nginx).await?;
            self.log.line(status);
        }

        if let Some(unit) = &config.unit {
            self.log
                .line(format!("$> Applying unit config on {}", scope.domain));
            let status = self
                .collab()
                .apps
                .set_domain(&scope.domain, unit, &scope.record)
                .await?;
            self.log.line(status);
        }

        if let Some(source) = &config.source {
            self.provision(source).await?;
        }

        if let Some(commands) = &config.commands {
            if self.run_commands(config, scope, commands).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }

        if let Some(services) = &config.services {
            self.services(scope, services).await?;
        }
        Ok(Flow::Continue)
    }

    /// Fetch the site files with egress restriction lifted for the duration
    async fn provision(&mut self, spec: &SourceSpec) -> Result<(), RunnerError> {
        let plan = source::plan(spec)?;
        if let Some(credentials) = &plan.credentials {
            self.log.line(&credentials.note);
            self.exec_steps(&credentials.steps).await?;
        }

        let restricted = self.firewall_status().await?;
        let (user, uid) = (
            self.record.username().to_string(),
            self.record.uid().to_string(),
        );
        if restricted {
            self.log.line("$> Temporarily lifting firewall protection");
            let status = self.collab().firewall.set_del_user(&user, &uid).await?;
            self.log.line(status);
        }

        self.log.line(format!("$> {}", plan.note));
        let mut fetched = Ok(());
        for command in &plan.commands {
            fetched = self.exec(command).await;
            if fetched.is_err() {
                break;
            }
        }

        if restricted {
            self.log.line("$> Restoring firewall protection");
            let status = self.collab().firewall.set_add_user(&user, &uid).await;
            match status {
                Ok(status) => self.log.line(status),
                Err(e) if fetched.is_ok() => return Err(e),
                Err(e) => warn!("Restoring firewall for {} failed: {}", user, e),
            }
        }
        fetched
    }

    async fn run_commands(
        &mut self,
        config: &DeploymentConfig,
        scope: &mut Scope,
        commands: &[Command],
    ) -> Result<Flow, RunnerError> {
        let mut vars: Vec<String> = config
            .envs
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{}={}", k, shell_escape(&text))
            })
            .collect();
        let database = db_name(self.record.username(), &scope.db_prefix);
        vars.push(format!("DATABASE={}", shell_escape(&database)));
        self.exec_quiet(&format!(" {}", vars.join(" "))).await?;

        for command in commands {
            match command {
                Command::Shell(line) => self.exec(line).await?,
                Command::Exec { command, write } => self.shell.exec(command, *write).await?,
                Command::Feature { feature } => {
                    if self.apply_feature(scope, feature).await? == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                }
                Command::WriteFile { filename, content } => {
                    self.log.line(format!("$> writing {}", filename));
                    self.exec_quiet(&format!(
                        "echo \"{}\" | base64 --decode > {}",
                        STANDARD.encode(content),
                        shell_escape(filename)
                    ))
                    .await?;
                }
                Command::Services { services } => self.services(scope, services).await?,
            }
        }
        Ok(Flow::Continue)
    }

    /// Replace the compose services of the scope and restart them
    async fn services(&mut self, scope: &mut Scope, services: &Value) -> Result<(), RunnerError> {
        let spec = ServicesSpec::from_json(services);
        let compose = |rest: &str| {
            let flags = spec.compose_flags();
            if flags.is_empty() {
                format!("docker compose {}", rest)
            } else {
                format!("docker compose {} {}", flags, rest)
            }
        };
        let html = scope.public_html();

        if scope.record.html_dir() == html {
            self.log.line("$> Changing root path for safety");
            self.change_root(scope, "public_html/public").await?;
        }
        match spec.sub_dir() {
            Some(sub) => self.exec_quiet(&format!("cd {}/{}", html, sub)).await?,
            None => self.exec_quiet(&format!("cd {}", html)).await?,
        }

        self.log.line("$> Removing docker compose services if exists");
        self.exec(&compose("--progress quiet down --remove-orphans || true"))
            .await?;

        self.log.line("$> Configuring NGINX forwarding for docker");
        let written = self
            .collab()
            .containers
            .execute(&spec, &html, &scope.domain, scope.record.uid())
            .await?;
        self.log.line("$> Writing docker compose services");
        let indented: Vec<String> = written.lines().map(|l| format!("  {}", l)).collect();
        self.log.line(indented.join("\n"));

        self.log.line("$> Applying compose services");
        self.exec(&compose("--progress plain up --build --detach"))
            .await?;
        self.exec("docker ps").await
    }
}
