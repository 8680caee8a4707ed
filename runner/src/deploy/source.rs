//! Source provisioning: turn a source descriptor into shell commands.

use std::borrow::Cow;
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use url::Url;

use crate::deploy::config::SourceSpec;
use crate::deploy::runtimes::{Recipe, Step};
use crate::errors::RunnerError;
use crate::utils::shell_escape;

static VALID_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:https?|ftp|ssh)://)?([^/]+)").unwrap_or_else(|e| panic!("{e}"))
});

static GIT_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(www\.)?(github|gitlab|bitbucket)\.(com|org)$").unwrap_or_else(|e| panic!("{e}"))
});

/// `user@host:path`, the scp-like syntax git accepts for SSH remotes
static SCP_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w.-]+@[\w.-]+:[^/]").unwrap_or_else(|e| panic!("{e}"))
});

const GITHUB_SSH_CONFIG: &str =
    "Host github.com\n\tStrictHostKeyChecking no\n\tIdentityFile ~/.ssh/id_github_com\n";

/// How the source reaches the web root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Clear,
    Clone,
    Extract,
}

/// Commands for one source stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePlan {
    pub kind: SourceKind,
    /// Log headline printed before `commands`
    pub note: &'static str,
    /// Unechoed credential setup, run before the firewall is lifted
    pub credentials: Option<Recipe>,
    pub commands: Vec<String>,
}

/// Split off the `#fragment`
fn split_fragment(url: &str) -> (&str, Option<&str>) {
    match url.split_once('#') {
        Some((base, fragment)) if !fragment.is_empty() => (base, Some(fragment)),
        Some((base, _)) => (base, None),
        None => (url, None),
    }
}

/// `github.com/org/repo` means `https://github.com/org/repo`
fn with_scheme(url: &str) -> Cow<'_, str> {
    if url == "clear" || url.contains("://") || url.starts_with('/') || SCP_LIKE.is_match(url) {
        Cow::Borrowed(url)
    } else {
        Cow::Owned(format!("https://{}", url))
    }
}

/// Classify a URL when the descriptor does not say
pub fn classify(url: &str, kind: Option<&str>) -> Result<SourceKind, RunnerError> {
    if url == "clear" {
        return Ok(SourceKind::Clear);
    }
    let url = with_scheme(url);
    match kind {
        Some("clone") => return Ok(SourceKind::Clone),
        Some("extract") => return Ok(SourceKind::Extract),
        _ => {}
    }
    let (base, _) = split_fragment(&url);
    if SCP_LIKE.is_match(base) {
        return Ok(SourceKind::Clone);
    }
    let parsed = Url::parse(base)
        .map_err(|_| RunnerError::InvalidInput("Invalid source URL".to_string()))?;
    let path = parsed.path();
    let host = parsed.host_str().unwrap_or_default();
    let archive = path.ends_with(".zip") || path.ends_with(".tar.gz");
    if parsed.scheme() == "ssh" || path.ends_with(".git") || (GIT_HOST.is_match(host) && !archive)
    {
        Ok(SourceKind::Clone)
    } else {
        Ok(SourceKind::Extract)
    }
}

fn clone_depth_flag(source: &SourceSpec) -> &'static str {
    match source.depth.as_deref() {
        Some("treeless") => " --filter=tree:0",
        Some("shallow") => " --depth 1",
        Some("blobless") => " --filter=blob:none",
        _ if source.shallow => " --depth 1",
        _ => " --filter=blob:none",
    }
}

fn github_credentials(source: &SourceSpec) -> Option<Recipe> {
    let github = source.credentials.as_ref()?.github.as_ref()?;
    let key = github.ssh.as_deref().filter(|k| !k.is_empty())?;

    let mut steps = vec![
        Step {
            command: "mkdir -p ~/.ssh; touch $HOME/.ssh/{id_github_com,config}; chmod 0600 $HOME/.ssh/*".into(),
            echo: false,
        },
        Step {
            command: format!(
                "echo \"{}\" | base64 --decode > $HOME/.ssh/id_github_com",
                STANDARD.encode(key)
            ),
            echo: false,
        },
    ];
    if let Some(public) = github.ssh_pub.as_deref().filter(|k| !k.is_empty()) {
        steps.push(Step {
            command: format!(
                "echo \"{}\" | base64 --decode > $HOME/.ssh/id_github_com.pub",
                STANDARD.encode(public)
            ),
            echo: false,
        });
    }
    // drop a previous github.com host block before appending ours
    steps.push(Step {
        command: "sed 's/^Host/\\n&/' $HOME/.ssh/config | sed '/^Host '\"github.com\"'$/,/^$/d;/^$/d' > $HOME/.ssh/config".into(),
        echo: false,
    });
    steps.push(Step {
        command: format!(
            "echo \"{}\" | base64 --decode >> ~/.ssh/config",
            STANDARD.encode(GITHUB_SSH_CONFIG)
        ),
        echo: false,
    });
    Some(Recipe {
        note: "$> writing SSH keys for cloning github.com repository".to_string(),
        steps,
    })
}

/// Build the command list for `source`
pub fn plan(source: &SourceSpec) -> Result<SourcePlan, RunnerError> {
    if source.url != "clear" && !VALID_URL.is_match(&source.url) {
        return Err(RunnerError::InvalidInput("Invalid source URL".to_string()));
    }
    let url = with_scheme(&source.url);
    let kind = classify(&url, source.kind.as_deref())?;
    let clear = if source.rootlesskit {
        "rootlesskit rm -rf *"
    } else {
        "rm -rf *"
    };
    let mut commands = vec![clear.to_string()];
    let (base, fragment) = split_fragment(&url);

    match kind {
        SourceKind::Clear => Ok(SourcePlan {
            kind,
            note: "Clearing files",
            credentials: None,
            commands,
        }),
        SourceKind::Clone => {
            let branch = source
                .branch
                .as_deref()
                .or(source.directory.as_deref())
                .or(fragment);
            let mut clone = format!("git clone {}", shell_escape(base));
            if let Some(branch) = branch {
                clone.push_str(&format!(" -b {}", shell_escape(branch)));
            }
            clone.push_str(clone_depth_flag(source));
            if source.submodules {
                clone.push_str(" --recurse-submodules");
            }
            clone.push_str(" .");
            commands.push(clone);
            Ok(SourcePlan {
                kind,
                note: "Cloning files",
                credentials: github_credentials(source),
                commands,
            })
        }
        SourceKind::Extract => {
            let directory = source.directory.as_deref().or(fragment);
            let url = shell_escape(base);
            let path = Url::parse(base)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| base.to_string());
            let (file, unpack) = if path.ends_with(".tar.gz") {
                ("_.tar.gz", "tar -xzf _.tar.gz ; rm _.tar.gz")
            } else if path.ends_with(".tar.xz") {
                ("_.tar.xz", "tar -xJf _.tar.xz ; rm _.tar.xz")
            } else if path.ends_with(".tar.bz2") {
                ("_.tar.bz2", "tar -xjf _.tar.bz2 ; rm _.tar.bz2")
            } else {
                ("_.zip", "unzip -q -o _.zip ; rm _.zip")
            };
            commands.push(format!("wget -O {} {}", file, url));
            commands.push(unpack.to_string());
            if let Some(dir) = directory {
                let dir = shell_escape(dir);
                commands.push(format!("mv {}/* .", dir));
                commands.push(format!("rm -rf {}", dir));
            }
            commands.push("chmod -R 0750 *".to_string());
            Ok(SourcePlan {
                kind,
                note: "Downloading files",
                credentials: None,
                commands,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::config::{GithubCredentials, SourceCredentials};

    fn spec(url: &str) -> SourceSpec {
        SourceSpec {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("git@host.example:org/repo.git", None).unwrap(), SourceKind::Clone);
        assert_eq!(classify("https://github.com/org/repo", None).unwrap(), SourceKind::Clone);
        assert_eq!(classify("https://github.com/org/repo/archive/main.zip", None).unwrap(), SourceKind::Extract);
        assert_eq!(classify("https://example.com/archive.zip", None).unwrap(), SourceKind::Extract);
        assert_eq!(classify("https://example.com/archive.zip", Some("clone")).unwrap(), SourceKind::Clone);
        assert_eq!(classify("clear", Some("extract")).unwrap(), SourceKind::Clear);
        assert_eq!(classify("github.com/org/repo", None).unwrap(), SourceKind::Clone);
        assert_eq!(classify("example.com/site.zip", None).unwrap(), SourceKind::Extract);
    }

    #[test]
    fn test_url_without_scheme() {
        let plan = plan(&spec("github.com/org/repo#main")).unwrap();
        assert_eq!(
            plan.commands[1],
            "git clone https://github.com/org/repo -b main --filter=blob:none ."
        );

        let plan = super::plan(&spec("example.com/site.tar.gz")).unwrap();
        assert_eq!(plan.commands[1], "wget -O _.tar.gz https://example.com/site.tar.gz");

        let plan = super::plan(&spec("git@github.com:org/repo.git")).unwrap();
        assert_eq!(
            plan.commands[1],
            "git clone git@github.com:org/repo.git --filter=blob:none ."
        );
    }

    #[test]
    fn test_clone_flags() {
        let mut source = spec("https://github.com/org/repo#release/v2");
        source.submodules = true;
        let plan = plan(&source).unwrap();
        assert_eq!(plan.note, "Cloning files");
        assert_eq!(
            plan.commands,
            vec![
                "rm -rf *",
                "git clone https://github.com/org/repo -b release/v2 --filter=blob:none --recurse-submodules ."
            ]
        );

        let mut source = spec("https://gitlab.com/org/repo.git");
        source.shallow = true;
        source.branch = Some("my branch".into());
        assert_eq!(
            super::plan(&source).unwrap().commands[1],
            "git clone https://gitlab.com/org/repo.git -b 'my branch' --depth 1 ."
        );

        let mut source = spec("ssh://git@example.com/repo");
        source.depth = Some("treeless".into());
        source.rootlesskit = true;
        let plan = super::plan(&source).unwrap();
        assert_eq!(plan.commands[0], "rootlesskit rm -rf *");
        assert!(plan.commands[1].ends_with("--filter=tree:0 ."));
    }

    #[test]
    fn test_extract_formats() {
        let plan = plan(&spec("https://example.com/site.tar.gz#site-main")).unwrap();
        assert_eq!(plan.note, "Downloading files");
        assert_eq!(
            plan.commands,
            vec![
                "rm -rf *",
                "wget -O _.tar.gz https://example.com/site.tar.gz",
                "tar -xzf _.tar.gz ; rm _.tar.gz",
                "mv site-main/* .",
                "rm -rf site-main",
                "chmod -R 0750 *",
            ]
        );

        let plan = super::plan(&spec("https://example.com/dl?file=app")).unwrap();
        assert_eq!(plan.commands[1], "wget -O _.zip 'https://example.com/dl?file=app'");
        assert!(super::plan(&spec("https://example.com/a.tar.xz")).unwrap().commands[2].starts_with("tar -xJf"));
    }

    #[test]
    fn test_clear_and_invalid() {
        let plan = plan(&spec("clear")).unwrap();
        assert_eq!(plan.kind, SourceKind::Clear);
        assert_eq!(plan.commands, vec!["rm -rf *"]);

        assert!(super::plan(&spec("/etc/passwd")).is_err());
        assert!(super::plan(&spec("not a url")).is_err());
    }

    #[test]
    fn test_github_credentials() {
        let mut source = spec("git@github.com:org/private.git");
        source.credentials = Some(SourceCredentials {
            github: Some(GithubCredentials {
                ssh: Some("PRIVATE".into()),
                ssh_pub: None,
            }),
        });
        let plan = plan(&source).unwrap();
        let creds = plan.credentials.unwrap();
        assert!(creds.steps.iter().all(|s| !s.echo));
        assert_eq!(
            creds.steps[1].command,
            format!("echo \"{}\" | base64 --decode > $HOME/.ssh/id_github_com", STANDARD.encode("PRIVATE"))
        );
        assert_eq!(creds.steps.len(), 4);
    }
}
