//! Publickey and password authentication.
//!
//! Three modes: `noauth` binds any key, `host` checks host accounts and
//! their `authorized_keys`, `instance` tries host auth first and falls
//! back to key material fetched from inside the target instance.
//! Password auth verifies against the host `/etc/shadow`, then the
//! instance's when instance auth is on. Every decision is logged with the
//! short session id; the client only ever sees accept or reject.

use std::ffi::CString;
use std::path::PathBuf;

use russh::keys::{HashAlg, PublicKey};
use tracing::{debug, warn};

use hatchway_core::config::AuthMode;
use hatchway_core::incus::files;
use hatchway_core::login::LoginIdentity;

use crate::app::Gateway;

/// A host account, as needed for authorization decisions.
pub struct HostAccount {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

pub struct Authenticator {
    gw: std::sync::Arc<Gateway>,
}

impl Authenticator {
    pub fn new(gw: std::sync::Arc<Gateway>) -> Self {
        Self { gw }
    }

    /// Public key chain. Returns the fingerprint to bind on success.
    pub async fn check_publickey(
        &self,
        identity: &LoginIdentity,
        key: &PublicKey,
        session: &str,
    ) -> Option<String> {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        match self.gw.config.auth {
            AuthMode::Noauth => {
                debug!(session, %fingerprint, "noauth: key bound");
                Some(fingerprint)
            }
            AuthMode::Host => {
                if self.host_key_auth(identity, key, session) {
                    Some(fingerprint)
                } else {
                    None
                }
            }
            AuthMode::Instance => {
                if self.host_key_auth(identity, key, session) {
                    return Some(fingerprint);
                }
                // Pseudo-commands always require host auth.
                if identity.command.is_some() {
                    debug!(session, "command login rejected without host auth");
                    return None;
                }
                if self.instance_key_auth(identity, key, session).await {
                    Some(fingerprint)
                } else {
                    None
                }
            }
        }
    }

    /// Password chain: host shadow first, instance shadow as fallback.
    pub async fn check_password(
        &self,
        identity: &LoginIdentity,
        password: &str,
        session: &str,
    ) -> bool {
        if !self.gw.config.password_auth {
            return false;
        }
        if let Ok(shadow) = std::fs::read_to_string("/etc/shadow") {
            if let Some(hash) = shadow_hash(&shadow, &identity.host_user) {
                if verify_password(&hash, password) {
                    debug!(session, user = %identity.host_user, "host password accepted");
                    return true;
                }
            }
        }
        if self.gw.config.auth == AuthMode::Instance && identity.command.is_none() {
            match self.instance_shadow(identity).await {
                Some(hash) if verify_password(&hash, password) => {
                    debug!(session, user = %identity.instance_user, "instance password accepted");
                    return true;
                }
                _ => {}
            }
        }
        debug!(session, user = %identity.host_user, "password rejected");
        false
    }

    fn host_key_auth(&self, identity: &LoginIdentity, key: &PublicKey, session: &str) -> bool {
        let account = match lookup_host_account(&identity.host_user) {
            Some(account) => account,
            None => {
                debug!(session, user = %identity.host_user, "host account does not exist");
                return false;
            }
        };
        if !account_allowed(&account, &self.gw.config.allowed_groups) {
            debug!(
                session,
                user = %account.name,
                "host account is neither root nor in an allowed group"
            );
            return false;
        }
        let path = account.home.join(".ssh/authorized_keys");
        match std::fs::read_to_string(&path) {
            Ok(content) if authorized_keys_contains(&content, key) => {
                debug!(session, user = %account.name, "host key accepted");
                true
            }
            Ok(_) => {
                debug!(session, user = %account.name, "key not in host authorized_keys");
                false
            }
            Err(e) => {
                debug!(session, path = %path.display(), error = %e, "cannot read authorized_keys");
                false
            }
        }
    }

    async fn instance_key_auth(
        &self,
        identity: &LoginIdentity,
        key: &PublicKey,
        session: &str,
    ) -> bool {
        let mut client = self.gw.client();
        client.use_project(&identity.project);
        let user = match client
            .instance_user(&identity.instance, &identity.instance_user)
            .await
        {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!(session, user = %identity.instance_user, "instance user not found");
                return false;
            }
            Err(e) => {
                warn!(session, error = %e, "instance user lookup failed during auth");
                return false;
            }
        };
        let path = format!("{}/.ssh/authorized_keys", user.home_dir.trim_end_matches('/'));
        match files::pull_file(&client, &identity.instance, &path).await {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes);
                if authorized_keys_contains(&content, key) {
                    debug!(session, "instance key accepted");
                    true
                } else {
                    debug!(session, "key not in instance authorized_keys");
                    false
                }
            }
            Err(e) => {
                debug!(session, error = %e, "cannot fetch instance authorized_keys");
                false
            }
        }
    }

    async fn instance_shadow(&self, identity: &LoginIdentity) -> Option<String> {
        let mut client = self.gw.client();
        client.use_project(&identity.project);
        let bytes = files::pull_file(&client, &identity.instance, "/etc/shadow")
            .await
            .ok()?;
        shadow_hash(&String::from_utf8_lossy(&bytes), &identity.instance_user)
    }
}

/// Look a host account up through the system user database.
pub fn lookup_host_account(name: &str) -> Option<HostAccount> {
    let user = nix::unistd::User::from_name(name).ok().flatten()?;
    Some(HostAccount {
        name: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        home: user.dir,
    })
}

/// uid 0, or membership in at least one allowed group.
pub fn account_allowed(account: &HostAccount, allowed_groups: &[String]) -> bool {
    if account.uid == 0 {
        return true;
    }
    if allowed_groups.is_empty() {
        return false;
    }
    let cname = match CString::new(account.name.as_bytes()) {
        Ok(cname) => cname,
        Err(_) => return false,
    };
    let groups = match nix::unistd::getgrouplist(&cname, nix::unistd::Gid::from_raw(account.gid)) {
        Ok(groups) => groups,
        Err(_) => return false,
    };
    for gid in groups {
        if let Ok(Some(group)) = nix::unistd::Group::from_gid(gid) {
            if allowed_groups.iter().any(|g| g == &group.name) {
                return true;
            }
        }
    }
    false
}

/// Whether `content` (authorized_keys format) contains `key`.
///
/// Comparison is on the parsed key data, so comments and whitespace do
/// not matter. Lines that fail to parse (options, garbage) are skipped.
pub fn authorized_keys_contains(content: &str, key: &PublicKey) -> bool {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Ok(parsed) = line.parse::<PublicKey>() {
            if parsed.key_data() == key.key_data() {
                return true;
            }
        }
    }
    false
}

/// Extract the password hash for `user` from shadow(5) content.
pub fn shadow_hash(content: &str, user: &str) -> Option<String> {
    for line in content.lines() {
        let mut fields = line.splitn(3, ':');
        let name = fields.next()?;
        if name != user {
            continue;
        }
        return fields.next().map(str::to_string);
    }
    None
}

/// Verify a password against a crypt(3)-style hash.
pub fn verify_password(hash: &str, password: &str) -> bool {
    if hash.is_empty() || hash.starts_with('!') || hash.starts_with('*') {
        return false;
    }
    if hash.starts_with("$y$") {
        warn!("yescrypt password hashes are not supported");
        return false;
    }
    pwhash::unix::verify(password, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEB test-a";
    const ED25519_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgIC test-b";

    #[test]
    fn authorized_keys_matching() {
        let key: PublicKey = ED25519_A.parse().unwrap();
        let content = format!("# keys\n\n{ED25519_B}\n{ED25519_A}\n");
        assert!(authorized_keys_contains(&content, &key));

        let content = format!("{ED25519_B}\n");
        assert!(!authorized_keys_contains(&content, &key));
    }

    #[test]
    fn authorized_keys_ignores_unparseable_lines() {
        let key: PublicKey = ED25519_A.parse().unwrap();
        let content = format!("no-pty,command=\"true\" {ED25519_A}\nnot a key at all\n{ED25519_A}\n");
        assert!(authorized_keys_contains(&content, &key));
    }

    #[test]
    fn shadow_hash_extraction() {
        let shadow = "root:$6$salt$hash:19000:0:99999:7:::\ndev:!:19000:0:99999:7:::\n";
        assert_eq!(shadow_hash(shadow, "root").as_deref(), Some("$6$salt$hash"));
        assert_eq!(shadow_hash(shadow, "dev").as_deref(), Some("!"));
        assert_eq!(shadow_hash(shadow, "ghost"), None);
    }

    #[test]
    fn locked_and_unsupported_hashes_fail() {
        assert!(!verify_password("!", "secret"));
        assert!(!verify_password("*", "secret"));
        assert!(!verify_password("", "secret"));
        assert!(!verify_password("$y$j9T$salt$hash", "secret"));
    }

    #[test]
    fn sha512_crypt_round_trip() {
        let hash = pwhash::sha512_crypt::hash("secret").unwrap();
        assert!(verify_password(&hash, "secret"));
        assert!(!verify_password(&hash, "wrong"));
    }

    #[test]
    fn root_is_always_allowed() {
        let account = HostAccount {
            name: "root".into(),
            uid: 0,
            gid: 0,
            home: "/root".into(),
        };
        assert!(account_allowed(&account, &[]));
    }
}
