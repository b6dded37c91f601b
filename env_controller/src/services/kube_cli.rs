//! `kubectl`/`helm` backed implementation of the cluster interfaces.
//!
//! Every call runs as a child process under a timeout; JSON output is parsed
//! with `serde_json`. Manifests are piped to `kubectl` on stdin.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{ControllerError, Result};
use crate::models::cluster::{
    NamespacePhase, NamespaceSpec, ObservedNamespace, ReleaseInfo, ReleaseStatus, WorkloadStatus,
};
use crate::models::environment::{
    LimitRangeDefaults, ResourceQuota, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use crate::services::cluster_service::{ClusterBackend, ReleaseBackend, ReleaseRequest};
use crate::services::error_service::classify_failure;

const QUOTA_NAME: &str = "k8s-ee-quota";
const LIMIT_RANGE_NAME: &str = "k8s-ee-limits";

#[derive(Debug, Clone)]
pub struct KubeCli {
    kubectl: String,
    helm: String,
    context: Option<String>,
    timeout: Duration,
}

impl KubeCli {
    pub fn new(context: Option<String>, timeout: Duration) -> Self {
        Self {
            kubectl: std::env::var("K8SEE_KUBECTL").unwrap_or_else(|_| "kubectl".to_string()),
            helm: std::env::var("K8SEE_HELM").unwrap_or_else(|_| "helm".to_string()),
            context,
            timeout,
        }
    }

    async fn kubectl(&self, args: &[&str], stdin: Option<String>) -> Result<String> {
        let mut full: Vec<String> = Vec::new();
        if let Some(ctx) = &self.context {
            full.push("--context".to_string());
            full.push(ctx.clone());
        }
        full.extend(args.iter().map(|s| s.to_string()));
        self.run(&self.kubectl, full, stdin).await
    }

    async fn helm(&self, args: Vec<String>) -> Result<String> {
        let mut full = args;
        if let Some(ctx) = &self.context {
            full.push("--kube-context".to_string());
            full.push(ctx.clone());
        }
        self.run(&self.helm, full, None).await
    }

    async fn run(&self, program: &str, args: Vec<String>, stdin: Option<String>) -> Result<String> {
        let subcommand = args
            .iter()
            .find(|a| !a.starts_with('-'))
            .cloned()
            .unwrap_or_default();
        tracing::debug!(program, args = ?args, "Running command");

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ControllerError::TransientInfra(format!(
                    "{program} {subcommand} timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(&format!("{program} {subcommand}"), &stderr))
        }
    }

    async fn namespaces_with_quota(&self) -> Result<BTreeSet<String>> {
        let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
        let out = self
            .kubectl(
                &["get", "resourcequota", "--all-namespaces", "-l", &selector, "-o", "json"],
                None,
            )
            .await?;
        let value: Value = serde_json::from_str(&out)?;
        Ok(items(&value)
            .filter_map(|item| item["metadata"]["namespace"].as_str().map(str::to_string))
            .collect())
    }
}

fn items(value: &Value) -> impl Iterator<Item = &Value> {
    value["items"].as_array().into_iter().flatten()
}

fn string_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Parse one `Namespace` object.
pub fn parse_namespace(value: &Value, quota_applied: bool) -> Option<ObservedNamespace> {
    let metadata = &value["metadata"];
    let name = metadata["name"].as_str()?.to_string();
    let terminating = value["status"]["phase"].as_str() == Some("Terminating")
        || !metadata["deletionTimestamp"].is_null();
    let created_at = metadata["creationTimestamp"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));
    Some(ObservedNamespace {
        name,
        phase: if terminating {
            NamespacePhase::Terminating
        } else {
            NamespacePhase::Active
        },
        labels: string_map(&metadata["labels"]),
        annotations: string_map(&metadata["annotations"]),
        created_at,
        quota_applied,
    })
}

/// Parse `helm status -o json` together with `helm history -o json`.
pub fn parse_release(status: &Value, history: &Value) -> Option<ReleaseInfo> {
    let name = status["name"].as_str()?.to_string();
    let namespace = status["namespace"].as_str().unwrap_or_default().to_string();
    let revision = status["version"].as_u64()? as u32;
    let state = ReleaseStatus::parse(status["info"]["status"].as_str().unwrap_or("unknown"));
    let image = &status["config"]["image"];
    let image_ref = match (image["repository"].as_str(), image["tag"].as_str()) {
        (Some(repo), Some(tag)) => Some(format!("{repo}:{tag}")),
        _ => None,
    };
    let last_deployed_revision = history
        .as_array()
        .into_iter()
        .flatten()
        .filter(|h| matches!(h["status"].as_str(), Some("deployed") | Some("superseded")))
        .filter_map(|h| h["revision"].as_u64())
        .max()
        .map(|r| r as u32);
    Some(ReleaseInfo {
        name,
        namespace,
        revision,
        status: state,
        image_ref,
        last_deployed_revision,
    })
}

/// Sum replica readiness over Deployments and StatefulSets.
pub fn parse_workloads(workloads: &Value) -> WorkloadStatus {
    let mut status = WorkloadStatus::default();
    for item in items(workloads) {
        status.desired_replicas += item["spec"]["replicas"].as_u64().unwrap_or(1) as u32;
        status.ready_replicas += item["status"]["readyReplicas"].as_u64().unwrap_or(0) as u32;
    }
    status
}

/// Describe the first pod that is not ready, for diagnostics.
pub fn describe_unready_pod(pods: &Value) -> Option<String> {
    items(pods).find_map(|pod| {
        let name = pod["metadata"]["name"].as_str().unwrap_or("<unknown>");
        let phase = pod["status"]["phase"].as_str().unwrap_or("Unknown");
        let containers = pod["status"]["containerStatuses"].as_array();
        let all_ready = containers
            .map(|cs| !cs.is_empty() && cs.iter().all(|c| c["ready"].as_bool() == Some(true)))
            .unwrap_or(false);
        if phase == "Running" && all_ready {
            return None;
        }
        let reason = containers.into_iter().flatten().find_map(|c| {
            c["state"]["waiting"]["reason"]
                .as_str()
                .or_else(|| c["state"]["terminated"]["reason"].as_str())
        });
        Some(match reason {
            Some(r) => format!("{name}: {phase} ({r})"),
            None => format!("{name}: {phase}"),
        })
    })
}

fn quota_manifest(namespace: &str, quota: &ResourceQuota, limits: &LimitRangeDefaults) -> Value {
    let labels = json!({ MANAGED_BY_LABEL: MANAGED_BY_VALUE });
    json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            {
                "apiVersion": "v1",
                "kind": "ResourceQuota",
                "metadata": { "name": QUOTA_NAME, "namespace": namespace, "labels": labels },
                "spec": {
                    "hard": {
                        "limits.cpu": quota.cpu_limit,
                        "limits.memory": quota.memory_limit,
                        "requests.storage": quota.storage_limit,
                        "pods": quota.max_pods.to_string(),
                    }
                }
            },
            {
                "apiVersion": "v1",
                "kind": "LimitRange",
                "metadata": { "name": LIMIT_RANGE_NAME, "namespace": namespace, "labels": labels },
                "spec": {
                    "limits": [{
                        "type": "Container",
                        "default": { "cpu": limits.default_cpu, "memory": limits.default_memory },
                        "defaultRequest": { "cpu": limits.request_cpu, "memory": limits.request_memory },
                    }]
                }
            }
        ]
    })
}

#[async_trait]
impl ClusterBackend for KubeCli {
    async fn get_namespace(&self, name: &str) -> Result<Option<ObservedNamespace>> {
        let out = self
            .kubectl(&["get", "namespace", name, "--ignore-not-found", "-o", "json"], None)
            .await?;
        if out.trim().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(&out)?;
        let quota = self
            .kubectl(
                &["get", "resourcequota", QUOTA_NAME, "-n", name, "--ignore-not-found", "-o", "name"],
                None,
            )
            .await?;
        Ok(parse_namespace(&value, !quota.trim().is_empty()))
    }

    async fn list_managed_namespaces(&self) -> Result<Vec<ObservedNamespace>> {
        let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
        let out = self
            .kubectl(&["get", "namespaces", "-l", &selector, "-o", "json"], None)
            .await?;
        let value: Value = serde_json::from_str(&out)?;
        let with_quota = self.namespaces_with_quota().await?;
        Ok(items(&value)
            .filter_map(|item| {
                let name = item["metadata"]["name"].as_str()?;
                parse_namespace(item, with_quota.contains(name))
            })
            .collect())
    }

    async fn create_namespace(&self, spec: &NamespaceSpec) -> Result<()> {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": spec.name,
                "labels": spec.labels,
                "annotations": spec.annotations,
            }
        });
        match self
            .kubectl(&["create", "-f", "-"], Some(manifest.to_string()))
            .await
        {
            Err(ControllerError::Infra(msg)) if msg.contains("AlreadyExists") => {
                // Ownership is verified by the readiness check that follows.
                tracing::info!(namespace = %spec.name, "Namespace already exists");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn apply_quota(
        &self,
        namespace: &str,
        quota: &ResourceQuota,
        limits: &LimitRangeDefaults,
    ) -> Result<()> {
        let manifest = quota_manifest(namespace, quota, limits);
        self.kubectl(&["apply", "-f", "-"], Some(manifest.to_string()))
            .await
            .map(|_| ())
    }

    async fn label_namespace(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut label_args = vec!["label", "namespace", namespace, "--overwrite"]
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        label_args.extend(labels.iter().map(|(k, v)| format!("{k}={v}")));
        let refs: Vec<&str> = label_args.iter().map(String::as_str).collect();
        self.kubectl(&refs, None).await?;

        if annotations.is_empty() {
            return Ok(());
        }
        let mut annotate_args = vec!["annotate", "namespace", namespace, "--overwrite"]
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        annotate_args.extend(annotations.iter().map(|(k, v)| {
            if v.is_empty() {
                format!("{k}-")
            } else {
                format!("{k}={v}")
            }
        }));
        let refs: Vec<&str> = annotate_args.iter().map(String::as_str).collect();
        self.kubectl(&refs, None).await.map(|_| ())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.kubectl(
            &["delete", "namespace", name, "--wait=false", "--ignore-not-found"],
            None,
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl ReleaseBackend for KubeCli {
    async fn release_status(&self, namespace: &str, release: &str) -> Result<Option<ReleaseInfo>> {
        let status = match self
            .helm(vec![
                "status".into(),
                release.into(),
                "-n".into(),
                namespace.into(),
                "-o".into(),
                "json".into(),
            ])
            .await
        {
            Ok(out) => out,
            Err(ControllerError::Infra(msg)) if msg.contains("not found") => return Ok(None),
            Err(e) => return Err(e),
        };
        let history = self
            .helm(vec![
                "history".into(),
                release.into(),
                "-n".into(),
                namespace.into(),
                "-o".into(),
                "json".into(),
            ])
            .await?;
        let status: Value = serde_json::from_str(&status)?;
        let history: Value = serde_json::from_str(&history)?;
        Ok(parse_release(&status, &history))
    }

    async fn upgrade_install(&self, request: &ReleaseRequest) -> Result<u32> {
        let mut args: Vec<String> = vec![
            "upgrade".into(),
            "--install".into(),
            request.release.clone(),
            request.chart_ref.clone(),
            "-n".into(),
            request.namespace.clone(),
            "--cleanup-on-fail".into(),
            "--history-max".into(),
            "10".into(),
            "-o".into(),
            "json".into(),
        ];
        for (k, v) in &request.values {
            args.push("--set-string".into());
            args.push(format!("{k}={v}"));
        }
        let out = self.helm(args).await?;
        let value: Value = serde_json::from_str(&out)?;
        value["version"]
            .as_u64()
            .map(|v| v as u32)
            .ok_or_else(|| ControllerError::Infra("helm upgrade returned no revision".to_string()))
    }

    async fn rollback(&self, namespace: &str, release: &str, revision: Option<u32>) -> Result<()> {
        let mut args: Vec<String> = vec!["rollback".into(), release.into()];
        if let Some(rev) = revision {
            args.push(rev.to_string());
        }
        args.extend(["-n".into(), namespace.into(), "--cleanup-on-fail".into()]);
        self.helm(args).await.map(|_| ())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()> {
        self.helm(vec![
            "uninstall".into(),
            release.into(),
            "-n".into(),
            namespace.into(),
            "--ignore-not-found".into(),
        ])
        .await
        .map(|_| ())
    }

    async fn workload_status(&self, namespace: &str) -> Result<WorkloadStatus> {
        let out = self
            .kubectl(&["get", "deployments,statefulsets", "-n", namespace, "-o", "json"], None)
            .await?;
        let mut status = parse_workloads(&serde_json::from_str(&out)?);
        if !status.all_ready() {
            let pods = self
                .kubectl(&["get", "pods", "-n", namespace, "-o", "json"], None)
                .await?;
            status.last_pod_status = describe_unready_pod(&serde_json::from_str(&pods)?);
        }
        Ok(status)
    }
}
