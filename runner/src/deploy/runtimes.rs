//! Install and uninstall recipes for user-level language runtimes.
//!
//! A recipe is a headline for the deployment log plus the shell lines that
//! run in the user's session. The lines themselves are opaque templates.

use crate::deploy::catalog::VersionCatalog;
use crate::deploy::config::Runtime;
use crate::errors::RunnerError;

/// One shell line of a recipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub command: String,
    pub echo: bool,
}

impl Step {
    fn shown(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            echo: true,
        }
    }

    fn quiet(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            echo: false,
        }
    }
}

/// Log headline and the steps that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub note: String,
    pub steps: Vec<Step>,
}

impl Recipe {
    fn new(note: impl Into<String>) -> Self {
        Self {
            note: note.into(),
            steps: Vec::new(),
        }
    }

    fn run(mut self, command: impl Into<String>) -> Self {
        self.steps.push(Step::shown(command));
        self
    }

    fn run_quiet(mut self, command: impl Into<String>) -> Self {
        self.steps.push(Step::quiet(command));
        self
    }
}

const NVM_INSTALLER: &str = "https://raw.githubusercontent.com/nvm-sh/nvm/v0.40.1/install.sh";
const DOTNET_INSTALLER: &str =
    "https://dotnet.microsoft.com/download/dotnet/scripts/v1/dotnet-install.sh";
const SOURCE_PATH_ENV: &str = "source ~/.config/envman/PATH.env";

fn is_latest(value: &str) -> bool {
    value == "latest" || value == "current"
}

/// `@version` suffix for webinstall.dev, `default` used for empty/lts
fn webi_tag(value: &str, default: &str) -> String {
    if is_latest(value) {
        String::new()
    } else if value.is_empty() || value == "lts" {
        default.to_string()
    } else {
        format!("@{}", value)
    }
}

/// Recipe for `runtime value`; `off` uninstalls
pub fn recipe(runtime: Runtime, value: &str, catalog: &VersionCatalog) -> Result<Recipe, RunnerError> {
    if value == "off" {
        return Ok(uninstall(runtime));
    }
    let name = runtime.display_name();
    let changing = |v: &str| format!("$> Changing {} engine to {}", name, v);

    Ok(match runtime {
        Runtime::Python => {
            let py = catalog.python(value);
            let mut r = Recipe::new(changing(&py.version)).run(format!(
                "command -v pyenv &> /dev/null || (curl -sS https://webinstall.dev/pyenv | bash); {}",
                SOURCE_PATH_ENV
            ));
            if let Some(binary) = &py.binary {
                r = r
                    .run(format!("mkdir -p ~/.pyenv/versions/{}", py.version))
                    .run(format!(
                        "curl -sSL \"{}\" | tar --zstd -axf - -C ~/tmp",
                        binary
                    ))
                    .run(format!(
                        "mv ~/tmp/python/install/* ~/.pyenv/versions/{} || true ; rm -rf ~/tmp/python",
                        py.version
                    ))
                    .run(format!(
                        "echo \"export LD_LIBRARY_PATH=~/.pyenv/versions/{}:$LD_LIBRARY_PATH\" >> ~/.bashrc",
                        py.version
                    ));
            } else if py.version != "system" {
                r = r.run(format!("pyenv install {} -s", py.version));
            }
            r.run(format!("pyenv global {}", py.version.replace(":latest", "")))
                .run_quiet("source ~/.bashrc")
                .run("python --version")
        }
        Runtime::Node => {
            let tag = if is_latest(value) {
                "node"
            } else if value.is_empty() || value == "stable" || value == "lts" {
                "lts/*"
            } else {
                value
            };
            Recipe::new(changing(if value.is_empty() { "lts" } else { value }))
                .run(format!(
                    "command -v nvm &> /dev/null || (curl -o- {} | bash) && source ~/.bashrc",
                    NVM_INSTALLER
                ))
                .run(format!(
                    "nvm install {tag} -b && nvm use {tag} && nvm alias default {tag}"
                ))
                .run("command -v corepack &> /dev/null || npm i -g corepack && corepack enable")
                .run("[[ -z $COREPACK_ENABLE_AUTO_PIN ]] && echo \"export COREPACK_ENABLE_AUTO_PIN=0\" >> ~/.bashrc")
                .run_quiet("source ~/.bashrc")
                .run("node --version")
        }
        Runtime::Deno => Recipe::new(changing(if value.is_empty() { "stable" } else { value }))
            .run(format!(
                "curl -sS https://webinstall.dev/deno{} | bash",
                webi_tag(value, "@stable")
            ))
            .run("mkdir -p ~/.deno/bin/ && pathman add ~/.deno/bin/")
            .run_quiet("source ~/.bashrc")
            .run("deno --version"),
        Runtime::Go => Recipe::new(changing(if value.is_empty() { "stable" } else { value }))
            .run(format!(
                "curl -sS https://webinstall.dev/golang{} | WEBI__GO_ESSENTIALS=true bash ; {}",
                webi_tag(value, "@stable"),
                SOURCE_PATH_ENV
            ))
            .run("go version"),
        Runtime::Rust => {
            let toolchain = if value.is_empty() || is_latest(value) || value == "lts" {
                "stable"
            } else {
                value
            };
            let note = if value.is_empty() {
                "$> installing Rust engine".to_string()
            } else {
                changing(value)
            };
            Recipe::new(note)
                .run("command -v rustup &> /dev/null || (curl https://sh.rustup.rs -sSf | sh -s -- -y --default-toolchain none)")
                .run(format!("pathman add $HOME/.cargo/bin ; {}", SOURCE_PATH_ENV))
                .run(format!(
                    "rustup toolchain install {t} --profile minimal && rustup default {t}",
                    t = toolchain
                ))
                .run("rustc --version")
        }
        Runtime::Ruby => {
            let rb = catalog.ruby(value);
            let mut r = Recipe::new(changing(&rb.version))
                .run("command -v rvm &> /dev/null || { curl -sSL https://rvm.io/mpapis.asc | gpg --import -; curl -sSL https://rvm.io/pkuczynski.asc | gpg --import -; }")
                .run("command -v rvm &> /dev/null || { curl -sSL https://get.rvm.io | bash -s master; source ~/.rvm/scripts/rvm; rvm autolibs disable; }");
            if let Some(binary) = &rb.binary {
                r = r
                    .run(format!("curl -sSL \"{}\" | tar -zaxf - -C ~/.rvm/rubies", binary))
                    .run(format!("rvm alias create default {} --create", rb.version));
            } else {
                r = r.run(format!("rvm install {} --no-docs", rb.version));
            }
            r.run(format!("rvm use {} --default", rb.version))
                .run("ruby --version")
        }
        Runtime::Bun => Recipe::new(changing(if value.is_empty() { "latest" } else { value }))
            .run(format!(
                "curl -sS https://webinstall.dev/bun{} | bash ; {}",
                webi_tag(value, ""),
                SOURCE_PATH_ENV
            ))
            .run("bun --version"),
        Runtime::Zig => Recipe::new(changing(if value.is_empty() { "latest" } else { value }))
            .run(format!(
                "curl -sS https://webinstall.dev/zig{} | bash ; {}",
                webi_tag(value, ""),
                SOURCE_PATH_ENV
            ))
            .run("zig version"),
        Runtime::Dotnet => {
            let arg = if is_latest(value) {
                "--version latest".to_string()
            } else if value.is_empty() || value == "lts" || value == "stable" {
                "--channel LTS".to_string()
            } else if value == "sts" {
                "--channel STS".to_string()
            } else {
                format!("--channel {}", value)
            };
            Recipe::new(changing(if value.is_empty() { "lts" } else { value }))
                .run(format!("(curl -sS {} | bash -s -- {})", DOTNET_INSTALLER, arg))
                .run(format!("pathman add ~/.dotnet ; {}", SOURCE_PATH_ENV))
                .run("dotnet --version")
        }
        Runtime::Java => {
            let jdk = catalog.java(value)?;
            let binary = jdk.binary.unwrap_or_default();
            Recipe::new(changing(&jdk.version))
                .run(format!(
                    "JDK=~/.local/java/jdk-{}; mkdir -p $JDK; rm -rf $JDK/*",
                    jdk.version
                ))
                .run(format!("curl -sSL \"{}\" | tar -zaxf - -C $JDK", binary))
                .run_quiet("mv $JDK/*/* $JDK/ && find $JDK -type d -empty -delete")
                .run(format!(
                    "ln -sfn $JDK ~/.local/java/jdk; pathman add ~/.local/java/jdk/bin ; {}",
                    SOURCE_PATH_ENV
                ))
                .run("java -version")
        }
    })
}

fn uninstall(runtime: Runtime) -> Recipe {
    let r = Recipe::new(format!("$> Removing {} engine", runtime.display_name()));
    match runtime {
        Runtime::Python => r
            .run("rm -rf ~/.pyenv")
            .run("sed -i '/pyenv/d' ~/.bashrc"),
        Runtime::Node => r
            .run("rm -rf ~/.local/opt/node-* ~/.local/opt/node ~/Downloads/webi/node")
            .run("rm -rf ~/.cache/yarn ~/.cache/node ~/.config/yarn ~/.npm ~/.nvm")
            .run("pathman remove .local/opt/node/bin"),
        Runtime::Deno => r
            .run("rm -rf ~/.local/opt/deno-* ~/.deno ~/.local/bin/deno ~/Downloads/webi/deno")
            .run("pathman remove ~/.deno/bin/"),
        Runtime::Go => r
            .run("chmod -R 0700 ~/.local/opt/go-*")
            .run("rm -rf ~/.local/opt/go-* ~/.cache/go-build ~/.local/opt/go ~/go ~/Downloads/webi/golang"),
        Runtime::Rust => r
            .run("rustup self uninstall -y")
            .run("pathman remove $HOME/.cargo/bin"),
        Runtime::Ruby => r
            .run("rm -rf ~/.rvm")
            .run("sed -i '/rvm\\|RVM/d' ~/.bashrc"),
        Runtime::Bun => r
            .run("chmod -R 0700 ~/.local/opt/bun-*")
            .run("rm -rf ~/.local/opt/bun-* ~/.local/opt/bun ~/Downloads/webi/bun"),
        Runtime::Zig => r.run("rm -rf ~/.local/opt/zig ~/Downloads/webi/zig"),
        Runtime::Dotnet => r.run("rm -rf ~/.dotnet").run("pathman remove ~/.dotnet"),
        Runtime::Java => r
            .run("rm -rf ~/.local/java")
            .run("pathman remove ~/.local/java/jdk/bin"),
    }
}

/// Per-user rootless container daemon setup, after linger is enabled
pub fn docker_setup() -> Vec<Step> {
    vec![
        Step::quiet("sed -i '/DOCKER_HOST=/d' ~/.bashrc"),
        Step::shown("echo \"export DOCKER_HOST=unix:///run/user/$(id -u)/docker.sock\" >>  ~/.bashrc;"),
        Step::quiet("mkdir -p ~/.config/docker  ~/.config/systemd/user/docker.service.d"),
        Step::shown("printf '{\\n\\t\"exec-opts\": [\"native.cgroupdriver=cgroupfs\"]\\n}\\n' > ~/.config/docker/daemon.json"),
        Step::shown("printf '[Service]\\nEnvironment=\"DOCKERD_ROOTLESS_ROOTLESSKIT_NET=pasta\"\\nEnvironment=\"DOCKERD_ROOTLESS_ROOTLESSKIT_PORT_DRIVER=implicit\"\\n' > ~/.config/systemd/user/docker.service.d/override.conf"),
        Step::shown("dockerd-rootless-setuptool.sh install --skip-iptables"),
        Step::quiet("export DOCKER_HOST=unix:///run/user/$(id -u)/docker.sock"),
    ]
}

/// Undo [`docker_setup`], before linger is disabled
pub fn docker_teardown() -> Vec<Step> {
    vec![
        Step::shown("dockerd-rootless-setuptool.sh uninstall --skip-iptables"),
        Step::shown("sed -i '/DOCKER_HOST=/d' ~/.bashrc"),
        Step::shown("rm -rf ~/.config/docker"),
        Step::shown("rootlesskit rm -rf ~/.local/share/docker"),
    ]
}
