//! Orchestrator adapters: provision, start and stop one database or proxy
//! instance by service name.
//!
//! Every backend implements the same interface; the variant is dispatched
//! once at cluster construction. An unknown or unset kind resolves to
//! [`UnconfiguredOrchestrator`], which succeeds as a no-op — the legacy
//! default branch behavior, kept as an explicit variant.

use crate::config::ProvisioningConfig;
use crate::error::{RepmanError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Supported orchestrator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorKind {
    OpenSvc,
    Kubernetes,
    SlapOs,
    OnPremise,
    Localhost,
    Unconfigured,
}

impl Default for OrchestratorKind {
    fn default() -> Self {
        OrchestratorKind::Unconfigured
    }
}

impl fmt::Display for OrchestratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorKind::OpenSvc => "opensvc",
            OrchestratorKind::Kubernetes => "kubernetes",
            OrchestratorKind::SlapOs => "slapos",
            OrchestratorKind::OnPremise => "onpremise",
            OrchestratorKind::Localhost => "localhost",
            OrchestratorKind::Unconfigured => "unconfigured",
        };
        f.write_str(s)
    }
}

/// What the adapters need to know about one service instance.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub datadir: PathBuf,
}

/// Uniform per-backend interface. All operations are fire-and-wait from the
/// adapter's point of view; the cluster layers the completion channel on
/// top.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn kind(&self) -> OrchestratorKind;

    async fn provision_database(&self, spec: &ServiceSpec) -> Result<()>;
    async fn unprovision_database(&self, spec: &ServiceSpec) -> Result<()>;
    async fn start_database(&self, spec: &ServiceSpec) -> Result<()>;
    async fn stop_database(&self, spec: &ServiceSpec) -> Result<()>;

    async fn provision_proxy(&self, spec: &ServiceSpec) -> Result<()>;
    async fn unprovision_proxy(&self, spec: &ServiceSpec) -> Result<()>;
    async fn start_proxy(&self, spec: &ServiceSpec) -> Result<()>;
    async fn stop_proxy(&self, spec: &ServiceSpec) -> Result<()>;
}

/// Dispatch the configured variant. Called once at cluster construction.
pub fn build(conf: &ProvisioningConfig) -> Arc<dyn Orchestrator> {
    match conf.orchestrator {
        OrchestratorKind::Localhost => Arc::new(LocalhostOrchestrator {
            scripts_dir: conf.scripts_dir.clone(),
        }),
        OrchestratorKind::Unconfigured => Arc::new(UnconfiguredOrchestrator),
        kind => Arc::new(AgentOrchestrator {
            kind,
            base_url: conf.agent_url.clone(),
            client: reqwest::Client::new(),
        }),
    }
}

/// No orchestrator configured: every operation is a silent success.
pub struct UnconfiguredOrchestrator;

#[async_trait]
impl Orchestrator for UnconfiguredOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        OrchestratorKind::Unconfigured
    }

    async fn provision_database(&self, spec: &ServiceSpec) -> Result<()> {
        debug!(service = %spec.service_name, "No orchestrator configured, skipping provision");
        Ok(())
    }

    async fn unprovision_database(&self, _spec: &ServiceSpec) -> Result<()> {
        Ok(())
    }

    async fn start_database(&self, _spec: &ServiceSpec) -> Result<()> {
        Ok(())
    }

    async fn stop_database(&self, _spec: &ServiceSpec) -> Result<()> {
        Ok(())
    }

    async fn provision_proxy(&self, _spec: &ServiceSpec) -> Result<()> {
        Ok(())
    }

    async fn unprovision_proxy(&self, _spec: &ServiceSpec) -> Result<()> {
        Ok(())
    }

    async fn start_proxy(&self, _spec: &ServiceSpec) -> Result<()> {
        Ok(())
    }

    async fn stop_proxy(&self, _spec: &ServiceSpec) -> Result<()> {
        Ok(())
    }
}

/// Runs per-operation scripts from a configured directory. Missing scripts
/// are a no-op so a partial setup still provisions what it can.
pub struct LocalhostOrchestrator {
    scripts_dir: Option<PathBuf>,
}

impl LocalhostOrchestrator {
    async fn run_script(&self, op: &str, spec: &ServiceSpec) -> Result<()> {
        let Some(dir) = &self.scripts_dir else {
            debug!(op, service = %spec.service_name, "No scripts directory, skipping");
            return Ok(());
        };
        let script = dir.join(format!("{}.sh", op));
        if !script.exists() {
            debug!(op, script = %script.display(), "Script not found, skipping");
            return Ok(());
        }

        info!(op, service = %spec.service_name, "Running localhost orchestrator script");
        let output = tokio::process::Command::new(&script)
            .arg(&spec.service_name)
            .arg(&spec.host)
            .arg(spec.port.to_string())
            .arg(&spec.datadir)
            .output()
            .await
            .map_err(|e| RepmanError::Orchestrator(format!("{}: {}", script.display(), e)))?;

        if !output.status.success() {
            return Err(RepmanError::Orchestrator(format!(
                "{} failed for {}: {}",
                op,
                spec.service_name,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for LocalhostOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        OrchestratorKind::Localhost
    }

    async fn provision_database(&self, spec: &ServiceSpec) -> Result<()> {
        self.run_script("provision-db", spec).await
    }

    async fn unprovision_database(&self, spec: &ServiceSpec) -> Result<()> {
        self.run_script("unprovision-db", spec).await
    }

    async fn start_database(&self, spec: &ServiceSpec) -> Result<()> {
        self.run_script("start-db", spec).await
    }

    async fn stop_database(&self, spec: &ServiceSpec) -> Result<()> {
        self.run_script("stop-db", spec).await
    }

    async fn provision_proxy(&self, spec: &ServiceSpec) -> Result<()> {
        self.run_script("provision-proxy", spec).await
    }

    async fn unprovision_proxy(&self, spec: &ServiceSpec) -> Result<()> {
        self.run_script("unprovision-proxy", spec).await
    }

    async fn start_proxy(&self, spec: &ServiceSpec) -> Result<()> {
        self.run_script("start-proxy", spec).await
    }

    async fn stop_proxy(&self, spec: &ServiceSpec) -> Result<()> {
        self.run_script("stop-proxy", spec).await
    }
}

/// Drives an external orchestration agent (OpenSVC, Kubernetes operator,
/// SlapOS master, on-premise agent) over its HTTP surface.
pub struct AgentOrchestrator {
    kind: OrchestratorKind,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl AgentOrchestrator {
    async fn call(&self, action: &str, spec: &ServiceSpec) -> Result<()> {
        let base = self.base_url.as_ref().ok_or_else(|| {
            RepmanError::Orchestrator(format!("{} orchestrator has no agent URL", self.kind))
        })?;
        let url = format!(
            "{}/svc/{}/{}",
            base.trim_end_matches('/'),
            spec.service_name,
            action
        );

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| RepmanError::Orchestrator(format!("{}: {}", url, e)))?;
        if !resp.status().is_success() {
            warn!(kind = %self.kind, url = %url, status = %resp.status(), "Agent call failed");
            return Err(RepmanError::Orchestrator(format!(
                "{} returned {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for AgentOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        self.kind
    }

    async fn provision_database(&self, spec: &ServiceSpec) -> Result<()> {
        self.call("provision", spec).await
    }

    async fn unprovision_database(&self, spec: &ServiceSpec) -> Result<()> {
        self.call("unprovision", spec).await
    }

    async fn start_database(&self, spec: &ServiceSpec) -> Result<()> {
        self.call("start", spec).await
    }

    async fn stop_database(&self, spec: &ServiceSpec) -> Result<()> {
        self.call("stop", spec).await
    }

    async fn provision_proxy(&self, spec: &ServiceSpec) -> Result<()> {
        self.call("provision", spec).await
    }

    async fn unprovision_proxy(&self, spec: &ServiceSpec) -> Result<()> {
        self.call("unprovision", spec).await
    }

    async fn start_proxy(&self, spec: &ServiceSpec) -> Result<()> {
        self.call("start", spec).await
    }

    async fn stop_proxy(&self, spec: &ServiceSpec) -> Result<()> {
        self.call("stop", spec).await
    }
}
