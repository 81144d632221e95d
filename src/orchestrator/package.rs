use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::orchestrator::container::{ContainerManager, ContainerSpec, ResourceKind};
use crate::orchestrator::error::OrchestratorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publisher {
    pub id: String,
    /// Base64-encoded ed25519 public key.
    pub public_key: String,
    pub trusted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDependency {
    pub kind: ResourceKind,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub publisher_id: String,
    pub sha256: String,
    pub publish_time: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub dependencies: Vec<PackageDependency>,
}

/// The subset of an `mcp.json`/`trigger.json` payload that
/// ContainerManager needs. Packages carry these fields under a
/// `deployment` object; anything absent falls back to a pull-only,
/// bridge-network, no-extra-env default.
#[derive(Debug, Clone, Deserialize)]
struct DeploymentSpec {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    build_context: Option<PathBuf>,
    #[serde(default)]
    host_network: bool,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PackagePayload {
    #[serde(default)]
    deployment: DeploymentSpec,
}

impl Default for DeploymentSpec {
    fn default() -> Self {
        DeploymentSpec { image: None, build_context: None, host_network: false, env: HashMap::new() }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPackage {
    pub kind: ResourceKind,
    pub name: String,
    pub version: String,
    pub payload: Vec<u8>,
    /// Base64-encoded detached ed25519 signature of `payload`.
    pub signature: String,
    pub metadata: PackageMetadata,
}

/// The set of publisher keys the orchestrator trusts. Installation
/// refuses any package signed by a publisher not present (and marked
/// trusted) here.
pub struct Keyring {
    publishers: RwLock<HashMap<String, Publisher>>,
}

impl Keyring {
    pub fn new() -> Self {
        Keyring { publishers: RwLock::new(HashMap::new()) }
    }

    pub async fn trust(&self, publisher: Publisher) {
        self.publishers.write().await.insert(publisher.id.clone(), publisher);
    }

    pub async fn get(&self, id: &str) -> Option<Publisher> {
        self.publishers.read().await.get(id).cloned()
    }
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches, verifies, and installs packages from a remote catalog.
/// This is the only path by which a resource becomes available on the
/// platform — there is no sideload path in the core.
pub struct PackageInstaller<'a> {
    catalog_base_url: String,
    install_root: PathBuf,
    http: reqwest::Client,
    keyring: &'a Keyring,
    containers: &'a ContainerManager,
}

impl<'a> PackageInstaller<'a> {
    pub fn new(
        catalog_base_url: impl Into<String>,
        install_root: impl Into<PathBuf>,
        keyring: &'a Keyring,
        containers: &'a ContainerManager,
    ) -> Self {
        PackageInstaller {
            catalog_base_url: catalog_base_url.into(),
            install_root: install_root.into(),
            http: reqwest::Client::new(),
            keyring,
            containers,
        }
    }

    fn package_url(&self, kind: ResourceKind, name: &str, version: &str, file: &str) -> String {
        let kind_segment = match kind {
            ResourceKind::Agent => "agent",
            ResourceKind::Mcp => "mcp",
            ResourceKind::Team => "team",
            ResourceKind::Trigger => "trigger",
        };
        format!(
            "{}/{}/{}/{}/{}",
            self.catalog_base_url.trim_end_matches('/'),
            kind_segment,
            name,
            version,
            file
        )
    }

    async fn fetch(&self, kind: ResourceKind, name: &str, version: &str) -> Result<FetchedPackage, OrchestratorError> {
        let payload_file = match kind {
            ResourceKind::Agent => "agent.json",
            ResourceKind::Mcp => "mcp.json",
            ResourceKind::Team => "team.json",
            ResourceKind::Trigger => "trigger.json",
        };

        let payload = self
            .http
            .get(self.package_url(kind, name, version, payload_file))
            .send()
            .await?
            .bytes()
            .await?
            .to_vec();

        let signature = self
            .http
            .get(self.package_url(kind, name, version, &format!("{}.asc", payload_file)))
            .send()
            .await?
            .text()
            .await?
            .trim()
            .to_string();

        let metadata: PackageMetadata = self
            .http
            .get(self.package_url(kind, name, version, "metadata.json"))
            .send()
            .await?
            .json()
            .await
            .map_err(OrchestratorError::from)?;

        Ok(FetchedPackage { kind, name: name.to_string(), version: version.to_string(), payload, signature, metadata })
    }

    fn verify_signature(&self, pkg: &FetchedPackage, publisher: &Publisher) -> Result<(), OrchestratorError> {
        let package_label = format!("{}/{}@{}", pkg_kind_label(pkg.kind), pkg.name, pkg.version);

        let key_bytes = base64::engine::general_purpose::STANDARD.decode(&publisher.public_key)
            .map_err(|_| OrchestratorError::InvalidSignature { package: package_label.clone() })?;
        let key_array: [u8; 32] =
            key_bytes.try_into().map_err(|_| OrchestratorError::InvalidSignature { package: package_label.clone() })?;
        let verifying_key = VerifyingKey::from_bytes(&key_array)
            .map_err(|_| OrchestratorError::InvalidSignature { package: package_label.clone() })?;

        let sig_bytes = base64::engine::general_purpose::STANDARD.decode(&pkg.signature)
            .map_err(|_| OrchestratorError::InvalidSignature { package: package_label.clone() })?;
        let sig_array: [u8; 64] =
            sig_bytes.try_into().map_err(|_| OrchestratorError::InvalidSignature { package: package_label.clone() })?;
        let signature = Signature::from_bytes(&sig_array);

        verifying_key
            .verify(&pkg.payload, &signature)
            .map_err(|_| OrchestratorError::InvalidSignature { package: package_label })
    }

    fn verify_checksum(&self, pkg: &FetchedPackage) -> Result<(), OrchestratorError> {
        let package_label = format!("{}/{}@{}", pkg_kind_label(pkg.kind), pkg.name, pkg.version);
        let mut hasher = Sha256::new();
        hasher.update(&pkg.payload);
        let computed = hex_encode(&hasher.finalize());

        let expected = pkg.metadata.sha256.to_lowercase();
        let computed_lower = computed.to_lowercase();

        // Constant-time comparison: package trust is a security
        // boundary, so the final byte-for-byte check avoids leaking
        // how much of the digest matched via timing.
        let matches: bool = if expected.len() == computed_lower.len() {
            expected.as_bytes().ct_eq(computed_lower.as_bytes()).into()
        } else {
            false
        };

        if matches {
            Ok(())
        } else {
            Err(OrchestratorError::ChecksumMismatch { package: package_label })
        }
    }

    /// Runs the full install algorithm: fetch, verify publisher trust,
    /// verify signature, verify checksum, recurse into team
    /// dependencies, persist to disk, and (for mcp/trigger) start a
    /// container.
    pub async fn install(
        &self,
        kind: ResourceKind,
        name: &str,
        version: &str,
        trigger_target: Option<(&str, &str)>,
    ) -> Result<(), OrchestratorError> {
        let pkg = self.fetch(kind, name, version).await?;

        let publisher = self
            .keyring
            .get(&pkg.metadata.publisher_id)
            .await
            .filter(|p| p.trusted)
            .ok_or_else(|| OrchestratorError::UntrustedPublisher { publisher_id: pkg.metadata.publisher_id.clone() })?;

        self.verify_signature(&pkg, &publisher)?;
        self.verify_checksum(&pkg)?;

        if kind == ResourceKind::Team {
            for dep in &pkg.metadata.dependencies {
                Box::pin(self.install(dep.kind, &dep.name, &dep.version, None)).await?;
            }
        }

        self.persist(&pkg).await?;

        if matches!(kind, ResourceKind::Mcp | ResourceKind::Trigger) {
            let package_label = format!("{}/{}@{}", pkg_kind_label(kind), name, version);
            let payload: PackagePayload = serde_json::from_slice(&pkg.payload).map_err(|e| {
                OrchestratorError::Serialization(format!(
                    "package '{}' has an invalid deployment spec: {}",
                    package_label, e
                ))
            })?;
            let deployment = payload.deployment;
            let spec = ContainerSpec {
                image: deployment.image.unwrap_or_else(|| format!("{}:{}", name, version)),
                build_context: deployment.build_context,
                host_network: deployment.host_network,
                env: deployment.env,
            };
            self.containers.install(kind, name, version, spec, trigger_target).await?;
        }

        log::info!("installed {:?} '{}' version {}", kind, name, version);
        Ok(())
    }

    async fn persist(&self, pkg: &FetchedPackage) -> Result<(), OrchestratorError> {
        let dir = self.install_root.join(pkg_kind_label(pkg.kind)).join(&pkg.name).join(&pkg.version);
        tokio::fs::create_dir_all(&dir).await?;
        let payload_file = match pkg.kind {
            ResourceKind::Agent => "agent.json",
            ResourceKind::Mcp => "mcp.json",
            ResourceKind::Team => "team.json",
            ResourceKind::Trigger => "trigger.json",
        };
        tokio::fs::write(dir.join(payload_file), &pkg.payload).await?;
        tokio::fs::write(
            dir.join("metadata.json"),
            serde_json::to_vec_pretty(&pkg.metadata).map_err(OrchestratorError::from)?,
        )
        .await?;
        Ok(())
    }
}

fn pkg_kind_label(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Agent => "agents",
        ResourceKind::Mcp => "mcps",
        ResourceKind::Team => "teams",
        ResourceKind::Trigger => "triggers",
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn installed_package_path(install_root: &Path, kind: ResourceKind, name: &str, version: &str) -> PathBuf {
    install_root.join(pkg_kind_label(kind)).join(name).join(version)
}
