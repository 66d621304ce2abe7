//! Workload discovery.
//!
//! Lists the pods in a namespace that match a label selector. Two backends
//! exist: [`KubectlDiscovery`] asks the cluster, [`StaticDiscovery`] answers
//! from a fixed list loaded from configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::config::{DiscoveryBackend, DiscoveryConfig, ExecConfig};

/// Errors from workload discovery.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("failed to run `{program}`: {reason}")]
    Command { program: String, reason: String },

    #[error("pod listing failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },

    #[error("unreadable pod listing: {0}")]
    Output(String),
}

/// Lists pods by namespace and label selector.
pub trait WorkloadDiscovery: Send + Sync {
    /// Returns the names of the pods in `namespace` matching `selector`.
    fn list_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DiscoveryError>>;
}

/// Builds the discovery backend selected in configuration.
///
/// The kubectl backend shares the binary and kubeconfig settings of the exec
/// backend.
pub fn from_config(discovery: &DiscoveryConfig, exec: &ExecConfig) -> Box<dyn WorkloadDiscovery> {
    match discovery.mode {
        DiscoveryBackend::Kubectl => Box::new(KubectlDiscovery {
            program: exec.kubectl.clone(),
            kubeconfig: exec.kubeconfig.clone(),
            context: exec.context.clone(),
        }),
        DiscoveryBackend::Static => Box::new(StaticDiscovery::new(discovery.workloads.clone())),
    }
}

/// Discovery backed by `kubectl get pods`.
#[derive(Debug, Clone)]
pub struct KubectlDiscovery {
    pub program: PathBuf,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

impl KubectlDiscovery {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            kubeconfig: None,
            context: None,
        }
    }

    fn args(&self, namespace: &str, selector: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.to_string_lossy().into_owned());
        }
        if let Some(context) = &self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args.extend(
            [
                "get",
                "pods",
                "-n",
                namespace,
                "-l",
                selector,
                "-o",
                "jsonpath={.items[*].metadata.name}",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args
    }

    async fn run(&self, namespace: &str, selector: &str) -> Result<Vec<String>, DiscoveryError> {
        // Rejected here so malformed input never reaches the command line.
        parse_selector(selector)?;

        let program = self.program.to_string_lossy().into_owned();
        let output = Command::new(&self.program)
            .args(self.args(namespace, selector))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DiscoveryError::Command {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(
                namespace = %namespace,
                selector = %selector,
                status = %output.status,
                "Pod listing failed"
            );
            return Err(DiscoveryError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }

        let stdout =
            String::from_utf8(output.stdout).map_err(|e| DiscoveryError::Output(e.to_string()))?;
        Ok(stdout.split_whitespace().map(str::to_string).collect())
    }
}

impl WorkloadDiscovery for KubectlDiscovery {
    fn list_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DiscoveryError>> {
        Box::pin(self.run(namespace, selector))
    }
}

/// A workload known to [`StaticDiscovery`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticWorkload {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Discovery over a fixed workload list.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    workloads: Vec<StaticWorkload>,
}

impl StaticDiscovery {
    pub fn new(workloads: Vec<StaticWorkload>) -> Self {
        Self { workloads }
    }
}

impl WorkloadDiscovery for StaticDiscovery {
    fn list_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, DiscoveryError>> {
        Box::pin(async move {
            let requirements = parse_selector(selector)?;
            Ok(self
                .workloads
                .iter()
                .filter(|w| w.namespace == namespace)
                .filter(|w| requirements.iter().all(|r| r.matches(&w.labels)))
                .map(|w| w.name.clone())
                .collect())
        })
    }
}

/// One term of an equality-based label selector.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(k, v) => labels.get(k) == Some(v),
            Self::NotEquals(k, v) => labels.get(k) != Some(v),
            Self::Exists(k) => labels.contains_key(k),
            Self::NotExists(k) => !labels.contains_key(k),
        }
    }
}

/// Parses `app=web,tier!=cache,canary,!legacy`. An empty selector matches
/// everything.
fn parse_selector(selector: &str) -> Result<Vec<Requirement>, DiscoveryError> {
    let invalid = || DiscoveryError::InvalidSelector(selector.to_string());

    if selector.trim().is_empty() {
        return Ok(Vec::new());
    }

    selector
        .split(',')
        .map(|term| {
            let term = term.trim();
            let requirement = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(key(k).ok_or_else(invalid)?, value(v).ok_or_else(invalid)?)
            } else if let Some((k, v)) = term.split_once("==") {
                Requirement::Equals(key(k).ok_or_else(invalid)?, value(v).ok_or_else(invalid)?)
            } else if let Some((k, v)) = term.split_once('=') {
                Requirement::Equals(key(k).ok_or_else(invalid)?, value(v).ok_or_else(invalid)?)
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::NotExists(key(k).ok_or_else(invalid)?)
            } else {
                Requirement::Exists(key(term).ok_or_else(invalid)?)
            };
            Ok(requirement)
        })
        .collect()
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

fn key(raw: &str) -> Option<String> {
    let raw = raw.trim();
    (!raw.is_empty() && raw.chars().all(is_label_char)).then(|| raw.to_string())
}

fn value(raw: &str) -> Option<String> {
    let raw = raw.trim();
    raw.chars().all(is_label_char).then(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(namespace: &str, name: &str, labels: &[(&str, &str)]) -> StaticWorkload {
        StaticWorkload {
            namespace: namespace.to_string(),
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn fixture() -> StaticDiscovery {
        StaticDiscovery::new(vec![
            workload("default", "web-1", &[("app", "web"), ("tier", "frontend")]),
            workload("default", "web-2", &[("app", "web"), ("canary", "true")]),
            workload("default", "cache-1", &[("app", "cache")]),
            workload("staging", "web-3", &[("app", "web")]),
        ])
    }

    #[test]
    fn test_parse_selector_forms() {
        let parsed = parse_selector("app=web, tier==frontend,env!=prod,canary,!legacy").unwrap();
        assert_eq!(
            parsed,
            vec![
                Requirement::Equals("app".into(), "web".into()),
                Requirement::Equals("tier".into(), "frontend".into()),
                Requirement::NotEquals("env".into(), "prod".into()),
                Requirement::Exists("canary".into()),
                Requirement::NotExists("legacy".into()),
            ]
        );
        assert!(parse_selector("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_selector_rejects_garbage() {
        for selector in ["=web", "app=we b", "app in (web)", "a,,b", "app=web;rm"] {
            assert!(
                matches!(
                    parse_selector(selector),
                    Err(DiscoveryError::InvalidSelector(_))
                ),
                "accepted {selector:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_static_discovery_filters() {
        let discovery = fixture();

        let pods = discovery.list_pods("default", "app=web").await.unwrap();
        assert_eq!(pods, vec!["web-1", "web-2"]);

        let pods = discovery.list_pods("default", "app=web,!canary").await.unwrap();
        assert_eq!(pods, vec!["web-1"]);

        let pods = discovery.list_pods("default", "app!=web").await.unwrap();
        assert_eq!(pods, vec!["cache-1"]);

        let pods = discovery.list_pods("staging", "").await.unwrap();
        assert_eq!(pods, vec!["web-3"]);

        let pods = discovery.list_pods("missing", "app=web").await.unwrap();
        assert!(pods.is_empty());
    }

    #[test]
    fn test_kubectl_args() {
        let mut discovery = KubectlDiscovery::new("kubectl");
        discovery.context = Some("staging".to_string());

        assert_eq!(
            discovery.args("default", "app=web"),
            vec![
                "--context",
                "staging",
                "get",
                "pods",
                "-n",
                "default",
                "-l",
                "app=web",
                "-o",
                "jsonpath={.items[*].metadata.name}",
            ]
        );
    }

    #[cfg(unix)]
    fn fake_kubectl(dir: &std::path::Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("kubectl");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kubectl_discovery_parses_names() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_kubectl(dir.path(), "printf 'web-1 web-2'");

        let pods = KubectlDiscovery::new(program)
            .list_pods("default", "app=web")
            .await
            .unwrap();
        assert_eq!(pods, vec!["web-1", "web-2"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kubectl_discovery_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_kubectl(dir.path(), "echo 'namespace not found' >&2; exit 1");

        let err = KubectlDiscovery::new(program)
            .list_pods("nope", "app=web")
            .await
            .unwrap_err();
        match err {
            DiscoveryError::Failed { stderr, .. } => assert_eq!(stderr, "namespace not found"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_kubectl_discovery_missing_binary() {
        let err = KubectlDiscovery::new("/nonexistent/kubectl")
            .list_pods("default", "app=web")
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Command { .. }));
    }
}
