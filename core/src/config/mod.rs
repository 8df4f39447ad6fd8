//! Server and instance-creation configuration.
//!
//! Both files are YAML. The create-config template additionally supports
//! two inline-file directives resolved at load time:
//!
//! - a `!include <path>` tagged value is replaced by the parsed YAML of
//!   the referenced file;
//! - a string value of the form `<@<path>` is replaced by the file's
//!   bytes as a string.
//!
//! Relative paths resolve against the config directory first, then the
//! working directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// Authentication modes for incoming SSH connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Accept any public key and only bind it to the identity.
    Noauth,
    /// Authenticate against host accounts and their authorized_keys.
    Host,
    /// Host auth first, then key material from inside the instance.
    #[default]
    Instance,
}

/// How `direct-tcpip` requests for instance-internal addresses are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStrategy {
    /// Create a transient proxy device and dial it from the host.
    #[default]
    Proxy,
    /// Run the stdio-proxy helper inside the instance.
    Stdio,
}

/// Shell invocation policy for empty commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShellPolicy {
    /// Run the user's shell as a login shell under their uid/gid.
    #[default]
    Default,
    /// `su - <user>` as root.
    Su,
    /// `login -h <peer> -f <user>` as root.
    Login,
}

/// Instance-manager endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct IncusConfig {
    /// Unix socket path of the local daemon.
    pub socket: String,
    /// HTTPS endpoint of a remote daemon; takes precedence over `socket`
    /// when both are set and `remote` selects it.
    pub url: String,
    /// PEM file paths for the HTTPS client identity.
    pub client_cert: String,
    pub client_key: String,
    pub server_cert: String,
    /// Image remote used for creation, e.g. `images`.
    pub image_remote: String,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    /// Listen address, `addr:port` or `:port`.
    pub listen: String,
    /// Fork one child per accepted connection instead of serving in-process.
    pub master: bool,
    pub auth: AuthMode,
    /// Enable the password chain next to publickey.
    pub password_auth: bool,
    /// Host groups (besides uid 0) allowed to authorize connections.
    pub allowed_groups: Vec<String>,
    /// Default instance-manager remote name for login strings.
    pub default_remote: String,
    pub incus: IncusConfig,
    /// Allow `+`/`~` login prefixes to create instances.
    pub allow_create: bool,
    /// Path to the create-config template.
    pub create_config: String,
    pub shell: ShellPolicy,
    /// Terminal multiplexer for `%` persistent sessions.
    pub multiplexer: String,
    /// Chroot non-root SFTP sessions to their home directory.
    pub chroot_sftp: bool,
    pub forward_strategy: ForwardStrategy,
    /// Welcome banner template file.
    pub welcome_file: String,
    /// Directory holding the gzipped guest binaries.
    pub guest_bin_dir: String,
    /// Instance-manager health-check interval, e.g. `1m`; empty disables.
    pub healthcheck: String,
    /// Directory for the persisted host key; defaults to the config dir.
    pub hostkey_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ":2222".to_string(),
            master: false,
            auth: AuthMode::default(),
            password_auth: false,
            allowed_groups: Vec::new(),
            default_remote: String::new(),
            incus: IncusConfig::default(),
            allow_create: false,
            create_config: String::new(),
            shell: ShellPolicy::default(),
            multiplexer: "tmux".to_string(),
            chroot_sftp: false,
            forward_strategy: ForwardStrategy::default(),
            welcome_file: String::new(),
            guest_bin_dir: String::new(),
            healthcheck: String::new(),
            hostkey_dir: String::new(),
        }
    }
}

impl ServerConfig {
    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("cannot parse {}: {e}", path.display())))
    }
}

/// One profile or the defaults block of the create-config template.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct CreateProfile {
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
}

/// The instance-creation template: a default image, a defaults block,
/// and named profiles.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct CreateConfig {
    /// Image alias used when the login names none.
    pub image: String,
    pub defaults: CreateProfile,
    pub profiles: BTreeMap<String, CreateProfile>,
}

impl CreateConfig {
    /// Load the template, resolving `!include` and `<@` directives.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        let base_dir = path.parent().map(Path::to_path_buf);
        let mut value: serde_yaml::Value = serde_yaml::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("cannot parse {}: {e}", path.display())))?;
        resolve_directives(&mut value, base_dir.as_deref())?;
        serde_yaml::from_value(value)
            .map_err(|e| CoreError::Config(format!("invalid create config: {e}")))
    }

    /// Merge defaults, the named profiles (in order), and per-login
    /// overrides into one flat config/devices pair. Scalars are last-wins;
    /// maps merge key-wise.
    pub fn merged(&self, profiles: &[String]) -> Result<CreateProfile, CoreError> {
        let mut out = self.defaults.clone();
        for name in profiles {
            let profile = self
                .profiles
                .get(name)
                .ok_or_else(|| CoreError::Config(format!("unknown profile: {name}")))?;
            for (k, v) in &profile.config {
                out.config.insert(k.clone(), v.clone());
            }
            for (dev, keys) in &profile.devices {
                let entry = out.devices.entry(dev.clone()).or_default();
                for (k, v) in keys {
                    entry.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(out)
    }
}

/// Recursively replace include directives inside a YAML value tree.
fn resolve_directives(
    value: &mut serde_yaml::Value,
    base_dir: Option<&Path>,
) -> Result<(), CoreError> {
    use serde_yaml::Value;
    match value {
        Value::Tagged(tagged) if tagged.tag == "!include" => {
            let rel = tagged
                .value
                .as_str()
                .ok_or_else(|| CoreError::Config("!include expects a path".to_string()))?;
            let path = resolve_path(rel, base_dir)?;
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
            let mut included: Value = serde_yaml::from_str(&raw)
                .map_err(|e| CoreError::Config(format!("cannot parse {}: {e}", path.display())))?;
            resolve_directives(&mut included, path.parent())?;
            *value = included;
        }
        Value::String(s) if s.starts_with("<@") => {
            let path = resolve_path(&s[2..], base_dir)?;
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
            *value = Value::String(raw);
        }
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                resolve_directives(v, base_dir)?;
            }
        }
        Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                resolve_directives(v, base_dir)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Resolve a directive path against the config dir, then the working dir.
fn resolve_path(rel: &str, base_dir: Option<&Path>) -> Result<PathBuf, CoreError> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Ok(rel_path.to_path_buf());
    }
    if let Some(dir) = base_dir {
        let candidate = dir.join(rel_path);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    let cwd = std::env::current_dir()
        .map_err(|e| CoreError::Config(format!("cannot resolve {rel}: {e}")))?;
    Ok(cwd.join(rel_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn server_config_defaults() {
        let cfg: ServerConfig = serde_yaml::from_str("listen: \":2022\"\n").unwrap();
        assert_eq!(cfg.listen, ":2022");
        assert_eq!(cfg.auth, AuthMode::Instance);
        assert_eq!(cfg.multiplexer, "tmux");
        assert!(!cfg.allow_create);
    }

    #[test]
    fn server_config_kebab_keys() {
        let cfg: ServerConfig = serde_yaml::from_str(
            "auth: host\npassword-auth: true\nallowed-groups: [adm, wheel]\nforward-strategy: stdio\n",
        )
        .unwrap();
        assert_eq!(cfg.auth, AuthMode::Host);
        assert!(cfg.password_auth);
        assert_eq!(cfg.allowed_groups, vec!["adm", "wheel"]);
        assert_eq!(cfg.forward_strategy, ForwardStrategy::Stdio);
    }

    #[test]
    fn create_config_merges_profiles_last_wins() {
        let cfg: CreateConfig = serde_yaml::from_str(
            r#"
defaults:
  config:
    limits.memory: 1GiB
    limits.cpu: "1"
profiles:
  big:
    config:
      limits.memory: 8GiB
  gpu:
    devices:
      gpu0:
        type: gpu
"#,
        )
        .unwrap();
        let merged = cfg
            .merged(&["big".to_string(), "gpu".to_string()])
            .unwrap();
        assert_eq!(merged.config["limits.memory"], "8GiB");
        assert_eq!(merged.config["limits.cpu"], "1");
        assert_eq!(merged.devices["gpu0"]["type"], "gpu");
    }

    #[test]
    fn unknown_profile_errors() {
        let cfg = CreateConfig::default();
        assert!(cfg.merged(&["nope".to_string()]).is_err());
    }

    #[test]
    fn file_inline_directive() {
        let dir = tempfile::tempdir().unwrap();
        let inlined = dir.path().join("cloud-init.yaml");
        std::fs::write(&inlined, "#cloud-config\npackages: [curl]\n").unwrap();

        let config_path = dir.path().join("create.yaml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(f, "defaults:").unwrap();
        writeln!(f, "  config:").unwrap();
        writeln!(f, "    cloud-init.user-data: \"<@cloud-init.yaml\"").unwrap();
        drop(f);

        let cfg = CreateConfig::load(&config_path).unwrap();
        assert!(cfg.defaults.config["cloud-init.user-data"].starts_with("#cloud-config"));
    }

    #[test]
    fn include_directive() {
        let dir = tempfile::tempdir().unwrap();
        let included = dir.path().join("profiles.yaml");
        std::fs::write(&included, "big:\n  config:\n    limits.memory: 8GiB\n").unwrap();

        let config_path = dir.path().join("create.yaml");
        std::fs::write(&config_path, "profiles: !include profiles.yaml\n").unwrap();

        let cfg = CreateConfig::load(&config_path).unwrap();
        assert_eq!(cfg.profiles["big"].config["limits.memory"], "8GiB");
    }
}
