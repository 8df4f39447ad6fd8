//! Client façade over the instance-manager REST API.
//!
//! One [`Client`] is created per SSH connection; the underlying
//! [`Transport`] and the TTL caches are shared process-wide. Expensive
//! reads go through the caches with single-flight collapse so identical
//! concurrent lookups produce one upstream request.

pub mod api;
pub mod exec;
pub mod files;
mod http;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cache::Caches;
use crate::config::{CreateProfile, IncusConfig};
use crate::errors::IncusError;
use crate::instance_user::{parse_passwd_line, InstanceUser};
use crate::login::CreateSpec;
use crate::osrelease::{self, OsFamily};

use api::{
    CreateInstanceRequest, CreateSource, Envelope, Instance, InstanceState, Operation,
    StateChangeRequest,
};
pub use http::{OpWebSocket, TlsIdentity, Transport};

/// Default image alias when neither login nor template names one.
const DEFAULT_IMAGE: &str = "ubuntu/24.04";
/// Well-known public image server for the `images:` remote.
const IMAGES_REMOTE_URL: &str = "https://images.linuxcontainers.org";
/// How long to wait for cloud-init to provision a non-root user.
const CREATE_USER_POLL: Duration = Duration::from_secs(30);

/// Build the shared transport from endpoint configuration, with
/// `INCUS_*` environment fallbacks for empty fields.
pub fn connect_transport(cfg: &IncusConfig) -> Result<Arc<Transport>, IncusError> {
    let env = |name: &str| std::env::var(name).unwrap_or_default();
    let url = non_empty(&cfg.url).unwrap_or_else(|| env("INCUS_REMOTE_ADDR"));
    if !url.is_empty() {
        let read = |label: &str, path: &str| -> Result<Vec<u8>, IncusError> {
            std::fs::read(path)
                .map_err(|e| IncusError::Certificate(format!("cannot read {label} {path}: {e}")))
        };
        let cert_path = non_empty(&cfg.client_cert).unwrap_or_else(|| env("INCUS_CLIENT_CERT"));
        let key_path = non_empty(&cfg.client_key).unwrap_or_else(|| env("INCUS_CLIENT_KEY"));
        let server_path = non_empty(&cfg.server_cert).unwrap_or_else(|| env("INCUS_SERVER_CERT"));
        let identity = TlsIdentity {
            cert_pem: read("client certificate", &cert_path)?,
            key_pem: read("client key", &key_path)?,
            server_cert_pem: match server_path.as_str() {
                "" => None,
                path => Some(read("server certificate", path)?),
            },
        };
        return Ok(Arc::new(Transport::https(&url, identity)?));
    }
    let socket = non_empty(&cfg.socket)
        .or_else(|| non_empty(&env("INCUS_SOCKET")))
        .unwrap_or_else(|| "/var/lib/incus/unix.socket".to_string());
    Ok(Arc::new(Transport::unix(socket)))
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Per-connection client handle.
#[derive(Clone)]
pub struct Client {
    transport: Arc<Transport>,
    caches: Caches,
    project: String,
    image_remote: String,
}

impl Client {
    pub fn new(transport: Arc<Transport>, caches: Caches, image_remote: &str) -> Self {
        Self {
            transport,
            caches,
            project: "default".to_string(),
            image_remote: image_remote.to_string(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Switch the project used for subsequent calls. Idempotent; a no-op
    /// when the project is unchanged.
    pub fn use_project(&mut self, name: &str) {
        if self.project != name {
            debug!(project = name, "switching project");
            self.project = name.to_string();
        }
    }

    /// Verify the endpoint answers at all.
    pub async fn ping(&self) -> Result<(), IncusError> {
        self.envelope("GET", "/1.0", None).await.map(|_| ())
    }

    pub async fn project_exists(&self, name: &str) -> Result<bool, IncusError> {
        let path = format!("/1.0/projects/{}", urlencoding::encode(name));
        match self.envelope("GET", &path, None).await {
            Ok(_) => Ok(true),
            Err(IncusError::Api { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn list_projects(&self) -> Result<Vec<String>, IncusError> {
        let envelope = self.envelope("GET", "/1.0/projects", None).await?;
        let urls: Vec<String> = serde_json::from_value(envelope.metadata)
            .map_err(|e| IncusError::Decode(e.to_string()))?;
        Ok(urls
            .iter()
            .filter_map(|u| u.rsplit('/').next())
            .map(|s| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string()))
            .collect())
    }

    /// Full snapshots of every instance in the current project.
    pub async fn list_instances(&self) -> Result<Vec<Instance>, IncusError> {
        let path = self.qualified("/1.0/instances", &[("recursion", "1")]);
        let envelope = self.envelope("GET", &path, None).await?;
        serde_json::from_value(envelope.metadata).map_err(|e| IncusError::Decode(e.to_string()))
    }

    /// Cached instance snapshot.
    pub async fn get_instance(&self, name: &str) -> Result<Arc<Instance>, IncusError> {
        let key = Caches::instance_key(&self.project, name);
        let this = self.clone();
        let name = name.to_string();
        self.caches
            .instances
            .try_get_with(key, async move {
                this.fetch_instance(&name).await.map(|(i, _)| Arc::new(i))
            })
            .await
            .map_err(|e: Arc<IncusError>| clone_error(&e))
    }

    /// Uncached snapshot together with its ETag, for read-modify-write.
    pub async fn get_instance_fresh(
        &self,
        name: &str,
    ) -> Result<(Instance, Option<String>), IncusError> {
        self.fetch_instance(name).await
    }

    async fn fetch_instance(
        &self,
        name: &str,
    ) -> Result<(Instance, Option<String>), IncusError> {
        let path = self.qualified(&format!("/1.0/instances/{}", urlencoding::encode(name)), &[]);
        let raw = self.transport.request("GET", &path, None, &[]).await?;
        let envelope = decode_envelope(&raw.body)?;
        match check_envelope(envelope, raw.status) {
            Ok(envelope) => {
                let instance: Instance = serde_json::from_value(envelope.metadata)
                    .map_err(|e| IncusError::Decode(e.to_string()))?;
                Ok((instance, raw.etag))
            }
            Err(IncusError::Api { status: 404, .. }) => {
                if !self.project_exists(&self.project).await? {
                    return Err(IncusError::ProjectNotFound(self.project.clone()));
                }
                Err(IncusError::InstanceNotFound(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Cached runtime state.
    pub async fn get_instance_state(&self, name: &str) -> Result<Arc<InstanceState>, IncusError> {
        let key = Caches::instance_key(&self.project, name);
        let this = self.clone();
        let name = name.to_string();
        self.caches
            .states
            .try_get_with(key, async move {
                let path =
                    this.qualified(&format!("/1.0/instances/{}/state", urlencoding::encode(&name)), &[]);
                let envelope = this.envelope("GET", &path, None).await?;
                let state: InstanceState = serde_json::from_value(envelope.metadata)
                    .map_err(|e| IncusError::Decode(e.to_string()))?;
                Ok(Arc::new(state))
            })
            .await
            .map_err(|e: Arc<IncusError>| clone_error(&e))
    }

    /// Arbitrary instance metadata (image info etc.).
    pub async fn get_instance_metadata(
        &self,
        name: &str,
    ) -> Result<serde_json::Value, IncusError> {
        let path = self.qualified(
            &format!("/1.0/instances/{}/metadata", urlencoding::encode(name)),
            &[],
        );
        let envelope = self.envelope("GET", &path, None).await?;
        Ok(envelope.metadata)
    }

    /// PUT the full instance back (device edits) and wait the operation.
    pub async fn update_instance(
        &self,
        instance: &Instance,
        etag: Option<&str>,
    ) -> Result<(), IncusError> {
        let path = self.qualified(
            &format!("/1.0/instances/{}", urlencoding::encode(&instance.name)),
            &[],
        );
        let body = serde_json::to_vec(instance).map_err(|e| IncusError::Decode(e.to_string()))?;
        let mut headers: Vec<(&str, String)> = Vec::new();
        if let Some(etag) = etag {
            headers.push(("if-match", etag.to_string()));
        }
        let raw = self
            .transport
            .request("PUT", &path, Some(Bytes::from(body)), &headers)
            .await?;
        let envelope = check_envelope(decode_envelope(&raw.body)?, raw.status)?;
        self.wait_envelope_operation(envelope).await?;
        self.caches
            .invalidate_instance(&self.project, &instance.name)
            .await;
        Ok(())
    }

    /// Change instance state (`start`, `stop`, ...) and wait.
    pub async fn update_instance_state(
        &self,
        name: &str,
        action: &str,
        force: bool,
    ) -> Result<(), IncusError> {
        let path = self.qualified(
            &format!("/1.0/instances/{}/state", urlencoding::encode(name)),
            &[],
        );
        let body = StateChangeRequest {
            action: action.to_string(),
            timeout: -1,
            force,
        };
        let body = serde_json::to_vec(&body).map_err(|e| IncusError::Decode(e.to_string()))?;
        let raw = self
            .transport
            .request("PUT", &path, Some(Bytes::from(body)), &[])
            .await?;
        let envelope = check_envelope(decode_envelope(&raw.body)?, raw.status)?;
        self.wait_envelope_operation(envelope).await?;
        self.caches.invalidate_instance(&self.project, name).await;
        Ok(())
    }

    /// Delete an instance and wait.
    pub async fn delete_instance(&self, name: &str) -> Result<(), IncusError> {
        let path = self.qualified(&format!("/1.0/instances/{}", urlencoding::encode(name)), &[]);
        let raw = self.transport.request("DELETE", &path, None, &[]).await?;
        let envelope = check_envelope(decode_envelope(&raw.body)?, raw.status)?;
        self.wait_envelope_operation(envelope).await?;
        self.caches.invalidate_instance(&self.project, name).await;
        Ok(())
    }

    /// Create and start an instance.
    ///
    /// The template (defaults + profiles, pre-merged by the caller) seeds
    /// config and devices; the login's [`CreateSpec`] overrides win last.
    /// After `start`, a non-root `wait_user` is polled for up to ~30 s to
    /// let cloud-init provision accounts.
    pub async fn create_instance(
        &self,
        name: &str,
        spec: &CreateSpec,
        template: &CreateProfile,
        template_image: &str,
        wait_user: Option<&str>,
    ) -> Result<(), IncusError> {
        let mut config = template.config.clone();
        let mut devices = template.devices.clone();
        if let Some(m) = spec.memory_gib {
            config.insert("limits.memory".to_string(), format!("{m}GiB"));
        }
        if let Some(c) = spec.cpu {
            config.insert("limits.cpu".to_string(), c.to_string());
        }
        if spec.nesting == Some(true) {
            config.insert("security.nesting".to_string(), "true".to_string());
        }
        if spec.privileged == Some(true) {
            config.insert("security.privileged".to_string(), "true".to_string());
        }
        if let Some(d) = spec.disk_gib {
            devices
                .entry("root".to_string())
                .or_insert_with(|| {
                    [
                        ("type".to_string(), "disk".to_string()),
                        ("path".to_string(), "/".to_string()),
                        ("pool".to_string(), "default".to_string()),
                    ]
                    .into_iter()
                    .collect()
                })
                .insert("size".to_string(), format!("{d}GiB"));
        }

        let image = spec
            .image
            .clone()
            .or_else(|| non_empty(template_image))
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        let source = match self.image_remote.as_str() {
            "" | "local" => CreateSource {
                source_type: "image".to_string(),
                server: None,
                protocol: None,
                alias: image,
            },
            remote => {
                let server = if remote.starts_with("https://") {
                    remote.to_string()
                } else {
                    IMAGES_REMOTE_URL.to_string()
                };
                CreateSource {
                    source_type: "image".to_string(),
                    server: Some(server),
                    protocol: Some("simplestreams".to_string()),
                    alias: image,
                }
            }
        };

        let request = CreateInstanceRequest {
            name: name.to_string(),
            instance_type: if spec.vm == Some(true) {
                "virtual-machine".to_string()
            } else {
                "container".to_string()
            },
            ephemeral: spec.ephemeral == Some(true),
            profiles: Vec::new(),
            config,
            devices,
            source,
        };

        info!(
            instance = name,
            project = %self.project,
            vm = request.instance_type == "virtual-machine",
            ephemeral = request.ephemeral,
            "creating instance"
        );

        let path = self.qualified("/1.0/instances", &[]);
        let body =
            serde_json::to_vec(&request).map_err(|e| IncusError::Decode(e.to_string()))?;
        let raw = self
            .transport
            .request("POST", &path, Some(Bytes::from(body)), &[])
            .await?;
        let envelope = check_envelope(decode_envelope(&raw.body)?, raw.status)?;
        self.wait_envelope_operation(envelope).await?;

        self.update_instance_state(name, "start", false).await?;

        if let Some(user) = wait_user {
            if user != "root" {
                let deadline = tokio::time::Instant::now() + CREATE_USER_POLL;
                loop {
                    match self.lookup_user_uncached(name, user).await {
                        Ok(Some(_)) => break,
                        Ok(None) | Err(_) if tokio::time::Instant::now() < deadline => {
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                        Ok(None) => {
                            warn!(instance = name, user, "user did not appear after create");
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Cached in-instance user lookup with a separate negative cache.
    ///
    /// Misses go through `try_get_with` so concurrent callers for the same
    /// key share one `getent` exec; a failed lookup populates the negative
    /// cache from inside that single flight.
    pub async fn instance_user(
        &self,
        instance: &str,
        user: &str,
    ) -> Result<Option<Arc<InstanceUser>>, IncusError> {
        let key = Caches::user_key(&self.project, instance, user);
        if self.caches.users_negative.get(&key).await.is_some() {
            return Ok(None);
        }
        let this = self.clone();
        let instance = instance.to_string();
        let user = user.to_string();
        let negative_key = key.clone();
        let result = self
            .caches
            .users
            .try_get_with(key, async move {
                match this.lookup_user_uncached(&instance, &user).await {
                    Ok(Some(found)) => Ok(Arc::new(found)),
                    Ok(None) => {
                        this.caches.users_negative.insert(negative_key, ()).await;
                        Err(UserLookup::NotFound)
                    }
                    Err(e) => Err(UserLookup::Backend(e)),
                }
            })
            .await;
        match result {
            Ok(found) => Ok(Some(found)),
            Err(shared) => match &*shared {
                UserLookup::NotFound => Ok(None),
                UserLookup::Backend(e) => Err(clone_error(e)),
            },
        }
    }

    async fn lookup_user_uncached(
        &self,
        instance: &str,
        user: &str,
    ) -> Result<Option<InstanceUser>, IncusError> {
        let argv = vec![
            "getent".to_string(),
            "passwd".to_string(),
            user.to_string(),
        ];
        let output = exec::capture(self, instance, argv, None).await?;
        if output.exit_code != 0 {
            return Ok(None);
        }
        match parse_passwd_line(&output.stdout) {
            Ok(found) => {
                debug!(instance, user, record = %found.raw, "resolved instance user");
                Ok(Some(found))
            }
            Err(e) => {
                warn!(instance, user, error = %e, "unparseable passwd record");
                Ok(None)
            }
        }
    }

    /// Detect the instance's OS family from its os-release file.
    pub async fn detect_os(&self, instance: &str) -> Result<Option<OsFamily>, IncusError> {
        for path in osrelease::OS_RELEASE_PATHS {
            match files::pull_file(self, instance, path).await {
                Ok(bytes) => {
                    let content = String::from_utf8_lossy(&bytes);
                    let fields = osrelease::parse_os_release(&content);
                    return Ok(osrelease::detect_family(&fields));
                }
                Err(_) => continue,
            }
        }
        Ok(None)
    }

    /// Install a package with the family's package manager.
    pub async fn install_package(
        &self,
        instance: &str,
        package: &str,
    ) -> Result<(), IncusError> {
        let family = self
            .detect_os(instance)
            .await?
            .ok_or_else(|| IncusError::Operation("unknown OS family".to_string()))?;
        let pipeline = family.install_command(package);
        info!(instance, package, "installing package");
        let argv = vec!["sh".to_string(), "-c".to_string(), pipeline];
        let output = exec::capture(self, instance, argv, None).await?;
        if output.exit_code != 0 {
            return Err(IncusError::Operation(format!(
                "package install failed ({}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Append the project (and extras) to an API path.
    fn qualified(&self, path: &str, extra: &[(&str, &str)]) -> String {
        let mut out = format!("{path}?project={}", urlencoding::encode(&self.project));
        for (k, v) in extra {
            out.push('&');
            out.push_str(k);
            out.push('=');
            out.push_str(&urlencoding::encode(v));
        }
        out
    }

    /// Issue a JSON request and check the envelope.
    async fn envelope(
        &self,
        method: &str,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Envelope, IncusError> {
        let raw = self.transport.request(method, path, body, &[]).await?;
        check_envelope(decode_envelope(&raw.body)?, raw.status)
    }

    /// Wait for the operation carried in an async envelope to finish.
    /// Sync responses carry no operation and complete immediately.
    async fn wait_envelope_operation(
        &self,
        envelope: Envelope,
    ) -> Result<Option<Operation>, IncusError> {
        if envelope.response_type != "async" {
            return Ok(None);
        }
        let op: Operation = serde_json::from_value(envelope.metadata)
            .map_err(|e| IncusError::Decode(e.to_string()))?;
        self.wait_operation(&op.id).await.map(Some)
    }

    /// Block until an operation completes; error when it failed.
    pub async fn wait_operation(&self, id: &str) -> Result<Operation, IncusError> {
        let op_id = id.rsplit('/').next().unwrap_or(id);
        let path = format!(
            "/1.0/operations/{}/wait?timeout=-1",
            urlencoding::encode(op_id)
        );
        let envelope = self.envelope("GET", &path, None).await?;
        let op: Operation = serde_json::from_value(envelope.metadata)
            .map_err(|e| IncusError::Decode(e.to_string()))?;
        if !op.err.is_empty() {
            return Err(IncusError::Operation(op.err.clone()));
        }
        if op.status_code >= 400 {
            return Err(IncusError::Operation(format!(
                "operation {}: {}",
                op.id, op.status
            )));
        }
        Ok(op)
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn caches(&self) -> &Caches {
        &self.caches
    }
}

fn decode_envelope(body: &[u8]) -> Result<Envelope, IncusError> {
    serde_json::from_slice(body).map_err(|e| IncusError::Decode(e.to_string()))
}

/// Promote error envelopes to typed errors.
fn check_envelope(envelope: Envelope, http_status: u16) -> Result<Envelope, IncusError> {
    if envelope.response_type == "error" {
        let status = if envelope.error_code != 0 {
            envelope.error_code as u16
        } else {
            http_status
        };
        return Err(IncusError::Api {
            status,
            message: envelope.error,
        });
    }
    Ok(envelope)
}

/// Outcome of a single-flight user lookup that is not a cacheable hit.
#[derive(Debug)]
enum UserLookup {
    NotFound,
    Backend(IncusError),
}

/// Clone the caller-relevant shape of a shared cache error.
pub(crate) fn clone_error(e: &IncusError) -> IncusError {
    match e {
        IncusError::InstanceNotFound(s) => IncusError::InstanceNotFound(s.clone()),
        IncusError::ProjectNotFound(s) => IncusError::ProjectNotFound(s.clone()),
        IncusError::Api { status, message } => IncusError::Api {
            status: *status,
            message: message.clone(),
        },
        other => IncusError::Operation(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_paths_carry_project() {
        let caches = Caches::new();
        let transport = Arc::new(Transport::unix("/run/incus.socket"));
        let mut client = Client::new(transport, caches, "images");
        assert_eq!(
            client.qualified("/1.0/instances", &[]),
            "/1.0/instances?project=default"
        );
        client.use_project("staging");
        assert_eq!(
            client.qualified("/1.0/instances/web", &[("recursion", "1")]),
            "/1.0/instances/web?project=staging&recursion=1"
        );
    }

    #[test]
    fn use_project_is_idempotent() {
        let caches = Caches::new();
        let transport = Arc::new(Transport::unix("/run/incus.socket"));
        let mut client = Client::new(transport, caches, "");
        client.use_project("default");
        assert_eq!(client.project(), "default");
        client.use_project("other");
        assert_eq!(client.project(), "other");
    }

    #[test]
    fn error_envelopes_become_api_errors() {
        let envelope = Envelope {
            response_type: "error".to_string(),
            status: String::new(),
            status_code: 0,
            error_code: 404,
            error: "not found".to_string(),
            metadata: serde_json::Value::Null,
        };
        match check_envelope(envelope, 404) {
            Err(IncusError::Api { status: 404, message }) => assert_eq!(message, "not found"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
