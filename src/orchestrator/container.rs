use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::orchestrator::error::OrchestratorError;

const STOP_GRACE_PERIOD_SECS: u64 = 10;
const MAX_LOG_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Agent,
    Mcp,
    Team,
    Trigger,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledResource {
    pub kind: ResourceKind,
    pub name: String,
    pub version: String,
    pub container_id: Option<String>,
    pub env_overrides: HashMap<String, String>,
    pub installed_at: chrono::DateTime<chrono::Utc>,
}

/// Spec for the package to be installed: only what ContainerManager
/// needs to know to build/pull and start it. The package's own
/// metadata (signature, checksums) is PackageInstaller's concern.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub build_context: Option<std::path::PathBuf>,
    pub host_network: bool,
    pub env: HashMap<String, String>,
}

/// Owns the lifecycle of worker and trigger containers by shelling out
/// to the host's container CLI (docker/podman-compatible invocation),
/// one mutating operation at a time under a single async lock so the
/// installed-resource index and the underlying runtime never see
/// interleaved mutations.
pub struct ContainerManager {
    network: String,
    orchestrator_url: String,
    orchestrator_ws: String,
    container_binary: String,
    state_dir: Option<std::path::PathBuf>,
    lock: Mutex<()>,
    installed: Mutex<HashMap<String, InstalledResource>>,
}

impl ContainerManager {
    pub fn new(network: impl Into<String>, orchestrator_url: impl Into<String>, orchestrator_ws: impl Into<String>) -> Self {
        ContainerManager {
            network: network.into(),
            orchestrator_url: orchestrator_url.into(),
            orchestrator_ws: orchestrator_ws.into(),
            container_binary: std::env::var("ORCHESTRATOR_CONTAINER_BIN").unwrap_or_else(|_| "docker".to_string()),
            state_dir: None,
            lock: Mutex::new(()),
            installed: Mutex::new(HashMap::new()),
        }
    }

    /// Persists the installed-resource index to `installed-mcps.json` /
    /// `installed-triggers.json` under `dir` after every mutation, per
    /// the persisted-state layout. Agent/team resources never reach
    /// this index — they are files managed directly by PackageInstaller.
    pub fn with_state_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    fn index_path(&self, kind: ResourceKind) -> Option<std::path::PathBuf> {
        let dir = self.state_dir.as_ref()?;
        Some(match kind {
            ResourceKind::Mcp => dir.join("installed-mcps.json"),
            ResourceKind::Trigger => dir.join("installed-triggers.json"),
            ResourceKind::Agent | ResourceKind::Team => return None,
        })
    }

    async fn persist_index(&self, guard: &HashMap<String, InstalledResource>) -> Result<(), OrchestratorError> {
        let Some(dir) = self.state_dir.clone() else { return Ok(()) };
        tokio::fs::create_dir_all(&dir).await?;
        for kind in [ResourceKind::Mcp, ResourceKind::Trigger] {
            let Some(path) = self.index_path(kind) else { continue };
            let entries: Vec<&InstalledResource> = guard.values().filter(|r| r.kind == kind).collect();
            let json = serde_json::to_vec_pretty(&entries).map_err(OrchestratorError::from)?;
            tokio::fs::write(&path, json).await?;
        }
        Ok(())
    }

    /// Loads both index files (if present) into memory; called once at
    /// startup so previously-installed workers/triggers are known to
    /// ContainerManager before any request arrives. Does not re-verify
    /// the underlying containers are actually running.
    pub async fn load_index(&self) -> Result<(), OrchestratorError> {
        let Some(dir) = self.state_dir.clone() else { return Ok(()) };
        let mut guard = self.installed.lock().await;
        for kind in [ResourceKind::Mcp, ResourceKind::Trigger] {
            let Some(path) = self.index_path(kind) else { continue };
            if !path.exists() {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path).await?;
            let entries: Vec<InstalledResource> = serde_json::from_str(&raw)
                .map_err(|e| OrchestratorError::Serialization(format!("invalid {}: {}", path.display(), e)))?;
            for entry in entries {
                guard.insert(entry.name.clone(), entry);
            }
        }
        Ok(())
    }

    /// Discovers which container network the orchestrator itself is
    /// attached to, so newly installed worker/trigger containers join
    /// the same network and their DNS names resolve from inside it.
    ///
    /// Docker sets a container's hostname to its own short id by
    /// default, so `{container_binary} inspect $HOSTNAME` reflects the
    /// orchestrator's own container when it is itself running inside
    /// one. Returns `None` (caller should fall back to a configured
    /// default) when `$HOSTNAME` is unset, the CLI call fails, or the
    /// container has no networks attached — i.e. when the orchestrator
    /// is running directly on the host rather than in a container.
    pub async fn discover_network(container_binary: &str) -> Option<String> {
        let self_id = std::env::var("HOSTNAME").ok().filter(|v| !v.is_empty())?;
        let output = Command::new(container_binary)
            .args([
                "inspect",
                "-f",
                "{{range $k, $v := .NetworkSettings.Networks}}{{$k}} {{end}}",
                &self_id,
            ])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).split_whitespace().next().map(|s| s.to_string())
    }

    fn platform_env(&self, spec: &ContainerSpec, trigger_target: Option<(&str, &str)>) -> HashMap<String, String> {
        let mut env = spec.env.clone();
        env.insert("ORCHESTRATOR_URL".to_string(), self.orchestrator_url.clone());
        env.insert("ORCHESTRATOR_WS".to_string(), self.orchestrator_ws.clone());
        if let Some((key, value)) = trigger_target {
            env.insert(key.to_string(), value.to_string());
        }
        env
    }

    async fn run_cli(&self, args: &[String]) -> Result<String, OrchestratorError> {
        let mut cmd = Command::new(&self.container_binary);
        cmd.args(args);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| OrchestratorError::Io(format!("failed to spawn container CLI: {}", e)))?;
        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");

        let wait = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let (_, _) = tokio::join!(
                read_limited(&mut stdout_pipe, &mut stdout, MAX_LOG_BYTES),
                read_limited(&mut stderr_pipe, &mut stderr, MAX_LOG_BYTES),
            );
            let status = child.wait().await;
            (status, stdout, stderr)
        };

        match tokio::time::timeout(Duration::from_secs(STOP_GRACE_PERIOD_SECS + 30), wait).await {
            Ok((status, stdout, stderr)) => {
                let status = status.map_err(|e| OrchestratorError::Io(e.to_string()))?;
                if status.success() {
                    Ok(String::from_utf8_lossy(&stdout).trim().to_string())
                } else {
                    Err(OrchestratorError::Io(format!(
                        "container CLI exited with {:?}: {}",
                        status.code(),
                        String::from_utf8_lossy(&stderr)
                    )))
                }
            }
            Err(_) => Err(OrchestratorError::Io("container CLI operation timed out".to_string())),
        }
    }

    pub async fn install(
        &self,
        kind: ResourceKind,
        name: &str,
        version: &str,
        spec: ContainerSpec,
        trigger_target: Option<(&str, &str)>,
    ) -> Result<InstalledResource, OrchestratorError> {
        let _guard = self.lock.lock().await;
        log::info!("installing {:?} '{}' version {}", kind, name, version);

        if let Some(ctx) = &spec.build_context {
            self.run_cli(&["build".to_string(), "-t".to_string(), spec.image.clone(), ctx.display().to_string()]).await?;
        } else {
            self.run_cli(&["pull".to_string(), spec.image.clone()]).await?;
        }

        let env = self.platform_env(&spec, trigger_target);
        let mut args = vec!["run".to_string(), "-d".to_string(), "--name".to_string(), name.to_string()];
        if spec.host_network {
            args.push("--network".to_string());
            args.push("host".to_string());
        } else {
            args.push("--network".to_string());
            args.push(self.network.clone());
        }
        for (k, v) in &env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(spec.image.clone());

        let container_id = self.run_cli(&args).await?;

        let resource = InstalledResource {
            kind,
            name: name.to_string(),
            version: version.to_string(),
            container_id: Some(container_id),
            env_overrides: env,
            installed_at: chrono::Utc::now(),
        };
        let mut guard = self.installed.lock().await;
        guard.insert(name.to_string(), resource.clone());
        self.persist_index(&guard).await?;
        Ok(resource)
    }

    pub async fn uninstall(&self, name: &str) -> Result<(), OrchestratorError> {
        let _guard = self.lock.lock().await;
        log::info!("uninstalling container '{}'", name);
        let _ = self
            .run_cli(&["stop".to_string(), "-t".to_string(), STOP_GRACE_PERIOD_SECS.to_string(), name.to_string()])
            .await;
        self.run_cli(&["rm".to_string(), "-f".to_string(), name.to_string()]).await?;
        let mut installed = self.installed.lock().await;
        installed.remove(name);
        self.persist_index(&installed).await?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<(), OrchestratorError> {
        let _guard = self.lock.lock().await;
        self.run_cli(&["start".to_string(), name.to_string()]).await?;
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<(), OrchestratorError> {
        let _guard = self.lock.lock().await;
        self.run_cli(&["stop".to_string(), "-t".to_string(), STOP_GRACE_PERIOD_SECS.to_string(), name.to_string()]).await?;
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<(), OrchestratorError> {
        let _guard = self.lock.lock().await;
        self.run_cli(&["restart".to_string(), "-t".to_string(), STOP_GRACE_PERIOD_SECS.to_string(), name.to_string()]).await?;
        Ok(())
    }

    /// Composed of uninstall + install; no rollback. If the new
    /// install fails, the old container is already gone — the caller
    /// is informed via the returned error and must re-install
    /// explicitly. This is a deliberate simplification, not an
    /// oversight (see DESIGN.md, Open Question 1).
    pub async fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        version: &str,
        spec: ContainerSpec,
        trigger_target: Option<(&str, &str)>,
    ) -> Result<InstalledResource, OrchestratorError> {
        self.uninstall(name).await?;
        self.install(kind, name, version, spec, trigger_target).await
    }

    pub async fn status(&self, name: &str) -> ContainerStatus {
        match self.run_cli(&["inspect".to_string(), "-f".to_string(), "{{.State.Running}}".to_string(), name.to_string()]).await
        {
            Ok(out) if out.trim() == "true" => ContainerStatus::Running,
            Ok(_) => ContainerStatus::Stopped,
            Err(_) => ContainerStatus::Unknown,
        }
    }

    pub async fn list(&self) -> Vec<InstalledResource> {
        self.installed.lock().await.values().cloned().collect()
    }
}

async fn read_limited<R: tokio::io::AsyncRead + Unpin>(reader: &mut R, out: &mut Vec<u8>, max: usize) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let remaining = max.saturating_sub(out.len());
                if remaining == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n.min(remaining)]);
            }
            Err(_) => break,
        }
    }
}
