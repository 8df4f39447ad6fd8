//! The SSH username grammar.
//!
//! The username presented at the SSH layer selects the instance, project,
//! in-instance user, host account and optional creation parameters:
//!
//! ```text
//! LOGIN    := ('/' COMMAND)
//!          |  [PREFIX] [REMOTE ':'] [IUSER '@'] INSTANCE ['.' PROJECT] ('+' SEGMENT)*
//! PREFIX   := '+' (create) | '~' (create ephemeral) | '%' (persistent session)
//! SEGMENT  := '%' PROFILE | HOST-USER | IMAGE (contains '/')
//!          |  'm' N | 'c' N | 'd' N
//!          |  'nest'|'n' | 'priv'|'p' | 'vm'|'v' | 'ephe'|'e'
//! ```
//!
//! Parsing is total: any input yields a [`LoginIdentity`]. Whether that
//! identity is usable is decided later by [`LoginIdentity::validate`] and
//! the authenticator; the parser only records diagnostics.

use std::fmt;

pub const DEFAULT_PROJECT: &str = "default";
pub const DEFAULT_USER: &str = "root";

/// Pseudo-commands reachable with a leading `/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Interactive REPL against the local instance manager (root only).
    Shell,
    /// Print how the rest of the login string parsed.
    Explain,
    /// Stop and delete an instance (root only).
    Remove { force: bool },
}

impl Command {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "shell" => Some(Self::Shell),
            "explain" => Some(Self::Explain),
            "remove" => Some(Self::Remove { force: false }),
            "remove--force" => Some(Self::Remove { force: true }),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Explain => "explain",
            Self::Remove { force: false } => "remove",
            Self::Remove { force: true } => "remove--force",
        }
    }
}

/// Per-call overrides for instance creation, all independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSpec {
    pub image: Option<String>,
    pub memory_gib: Option<u32>,
    pub cpu: Option<u32>,
    pub disk_gib: Option<u32>,
    pub vm: Option<bool>,
    pub nesting: Option<bool>,
    pub privileged: Option<bool>,
    pub ephemeral: Option<bool>,
    pub profiles: Vec<String>,
}

impl CreateSpec {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Structured identity parsed out of the SSH username.
///
/// Immutable after parse, except for `public_key` which the authenticator
/// fills in with the accepted key so later log lines can attribute the
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginIdentity {
    /// The raw username exactly as received.
    pub orig_user: String,
    /// Named remote of the instance manager; empty selects the default.
    pub remote: String,
    /// Host account that authorizes the connection.
    pub host_user: String,
    /// Instance name; empty when `command` is set without a target.
    pub instance: String,
    /// Instance-manager project.
    pub project: String,
    /// Account inside the instance.
    pub instance_user: String,
    /// Pseudo-command, mutually exclusive with a normal instance login.
    pub command: Option<Command>,
    /// Attach to a persistent terminal-multiplexer session.
    pub persistent: bool,
    /// Create the instance when it does not exist.
    pub create_instance: bool,
    /// When creating, mark the instance ephemeral.
    pub ephemeral_hint: bool,
    /// Creation overrides collected from `+` segments.
    pub create_spec: CreateSpec,
    /// OpenSSH text of the key that authenticated this session.
    pub public_key: Option<String>,
    /// Non-fatal oddities observed while parsing.
    pub diagnostics: Vec<String>,
}

impl LoginIdentity {
    fn empty(orig: &str, default_remote: &str) -> Self {
        Self {
            orig_user: orig.to_string(),
            remote: default_remote.to_string(),
            host_user: DEFAULT_USER.to_string(),
            instance: String::new(),
            project: DEFAULT_PROJECT.to_string(),
            instance_user: DEFAULT_USER.to_string(),
            command: None,
            persistent: false,
            create_instance: false,
            ephemeral_hint: false,
            create_spec: CreateSpec::default(),
            public_key: None,
            diagnostics: Vec::new(),
        }
    }

    /// Whether this identity is a normal instance login (not a command).
    pub fn is_instance_login(&self) -> bool {
        self.command.is_none() && !self.instance.is_empty()
    }

    /// Structural validity, independent of what exists on the backend.
    ///
    /// The backend-aware check (does the instance user exist?) lives in the
    /// server; this one is pure and cheap.
    pub fn validate(&self) -> Result<(), String> {
        if !self.diagnostics.is_empty() {
            return Err(self.diagnostics.join("; "));
        }
        if self.project.is_empty() {
            return Err("empty project".to_string());
        }
        match self.command {
            Some(Command::Shell) | Some(Command::Explain) => {
                if self.create_instance {
                    return Err("cannot combine instance creation with a command".to_string());
                }
            }
            Some(Command::Remove { .. }) => {
                if self.create_instance {
                    return Err("cannot combine instance creation with a command".to_string());
                }
                if self.instance.is_empty() {
                    return Err("remove requires an instance".to_string());
                }
            }
            None => {
                if self.instance.is_empty() {
                    return Err("empty instance name".to_string());
                }
            }
        }
        Ok(())
    }

    /// Canonical string form; `parse(format(l)) == l` for any parsed `l`
    /// (modulo `orig_user`, which always keeps the raw input).
    pub fn format(&self) -> String {
        let mut out = String::new();
        if let Some(cmd) = self.command {
            out.push('/');
            out.push_str(cmd.as_str());
            if self.instance.is_empty() {
                return out;
            }
            out.push('+');
        } else if self.create_instance && self.ephemeral_hint {
            out.push('~');
        } else if self.create_instance {
            out.push('+');
        } else if self.persistent {
            out.push('%');
        }
        if !self.remote.is_empty() {
            out.push_str(&self.remote);
            out.push(':');
        }
        if self.instance_user != DEFAULT_USER {
            out.push_str(&self.instance_user);
            out.push('@');
        }
        out.push_str(&self.instance);
        if self.project != DEFAULT_PROJECT {
            out.push('.');
            out.push_str(&self.project);
        }
        if self.host_user != DEFAULT_USER {
            out.push('+');
            out.push_str(&self.host_user);
        }
        let spec = &self.create_spec;
        if let Some(ref image) = spec.image {
            out.push('+');
            out.push_str(image);
        }
        if let Some(m) = spec.memory_gib {
            out.push_str(&format!("+m{m}"));
        }
        if let Some(c) = spec.cpu {
            out.push_str(&format!("+c{c}"));
        }
        if let Some(d) = spec.disk_gib {
            out.push_str(&format!("+d{d}"));
        }
        if spec.vm == Some(true) {
            out.push_str("+vm");
        }
        if spec.nesting == Some(true) {
            out.push_str("+nest");
        }
        if spec.privileged == Some(true) {
            out.push_str("+priv");
        }
        if spec.ephemeral == Some(true) {
            out.push_str("+ephe");
        }
        for profile in &spec.profiles {
            out.push('+');
            out.push('%');
            out.push_str(profile);
        }
        out
    }

    /// Multi-line human-readable rendering, used by the `explain` command.
    pub fn explain(&self) -> String {
        let mut lines = vec![format!("login:         {}", self.orig_user)];
        if let Some(cmd) = self.command {
            lines.push(format!("command:       {}", cmd.as_str()));
        }
        lines.push(format!(
            "remote:        {}",
            if self.remote.is_empty() { "(default)" } else { &self.remote }
        ));
        lines.push(format!("instance:      {}", self.instance));
        lines.push(format!("project:       {}", self.project));
        lines.push(format!("instance user: {}", self.instance_user));
        lines.push(format!("host user:     {}", self.host_user));
        if self.persistent {
            lines.push("persistent:    yes".to_string());
        }
        if self.create_instance {
            lines.push(format!(
                "create:        yes{}",
                if self.ephemeral_hint { " (ephemeral)" } else { "" }
            ));
        }
        let spec = &self.create_spec;
        if !spec.is_empty() {
            if let Some(ref image) = spec.image {
                lines.push(format!("image:         {image}"));
            }
            if let Some(m) = spec.memory_gib {
                lines.push(format!("memory:        {m} GiB"));
            }
            if let Some(c) = spec.cpu {
                lines.push(format!("cpu:           {c}"));
            }
            if let Some(d) = spec.disk_gib {
                lines.push(format!("disk:          {d} GiB"));
            }
            if spec.vm == Some(true) {
                lines.push("type:          virtual machine".to_string());
            }
            if spec.nesting == Some(true) {
                lines.push("nesting:       yes".to_string());
            }
            if spec.privileged == Some(true) {
                lines.push("privileged:    yes".to_string());
            }
            if spec.ephemeral == Some(true) {
                lines.push("ephemeral:     yes".to_string());
            }
            if !spec.profiles.is_empty() {
                lines.push(format!("profiles:      {}", spec.profiles.join(", ")));
            }
        }
        if !self.diagnostics.is_empty() {
            lines.push(format!("problems:      {}", self.diagnostics.join("; ")));
        }
        lines.join("\n")
    }
}

impl fmt::Display for LoginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}.{}",
            self.instance_user, self.instance, self.project
        )
    }
}

/// Parse an SSH username into a [`LoginIdentity`].
///
/// `default_remote` comes from server configuration and seeds the `remote`
/// field when the login string names none.
pub fn parse(raw: &str, default_remote: &str) -> LoginIdentity {
    let mut id = LoginIdentity::empty(raw, default_remote);
    let mut rest = raw;

    if let Some(cmd_part) = rest.strip_prefix('/') {
        let (name, target) = match cmd_part.split_once('+') {
            Some((name, target)) => (name, Some(target)),
            None => (cmd_part, None),
        };
        match Command::parse(name) {
            Some(cmd) => id.command = Some(cmd),
            None => id.diagnostics.push(format!("unknown command: {name}")),
        }
        match target {
            Some(target) => rest = target,
            None => return id,
        }
    } else {
        match rest.chars().next() {
            Some('+') => {
                id.create_instance = true;
                rest = &rest[1..];
            }
            Some('~') => {
                id.create_instance = true;
                id.ephemeral_hint = true;
                rest = &rest[1..];
            }
            Some('%') => {
                id.persistent = true;
                rest = &rest[1..];
            }
            _ => {}
        }
    }

    let mut segments = rest.split('+');
    let address = segments.next().unwrap_or_default();
    parse_address(address, &mut id);

    let mut host_user_seen = false;
    for segment in segments {
        parse_segment(segment, &mut id, &mut host_user_seen);
    }

    id
}

/// `[REMOTE ':'] [IUSER '@'] INSTANCE ['.' PROJECT]`
fn parse_address(address: &str, id: &mut LoginIdentity) {
    let mut rest = address;
    if let Some((remote, tail)) = rest.split_once(':') {
        id.remote = remote.to_string();
        rest = tail;
    }
    if let Some((user, tail)) = rest.split_once('@') {
        if !user.is_empty() {
            id.instance_user = user.to_string();
        }
        rest = tail;
    }
    match rest.split_once('.') {
        Some((instance, project)) => {
            id.instance = instance.to_string();
            if project.is_empty() {
                id.diagnostics.push("empty project after '.'".to_string());
            } else {
                id.project = project.to_string();
            }
        }
        None => id.instance = rest.to_string(),
    }
}

fn parse_segment(segment: &str, id: &mut LoginIdentity, host_user_seen: &mut bool) {
    if segment.is_empty() {
        id.diagnostics.push("empty '+' segment".to_string());
        return;
    }
    if let Some(profile) = segment.strip_prefix('%') {
        id.create_spec.profiles.push(profile.to_string());
        return;
    }
    if segment.contains('/') {
        if id.create_spec.image.is_some() {
            id.diagnostics.push(format!("duplicate image segment: {segment}"));
        }
        id.create_spec.image = Some(segment.to_string());
        return;
    }
    match segment {
        "vm" | "v" => {
            id.create_spec.vm = Some(true);
            return;
        }
        "nest" | "n" => {
            id.create_spec.nesting = Some(true);
            return;
        }
        "priv" | "p" => {
            id.create_spec.privileged = Some(true);
            return;
        }
        "ephe" | "e" => {
            id.create_spec.ephemeral = Some(true);
            return;
        }
        _ => {}
    }
    if let Some(n) = numeric_segment(segment, 'm') {
        id.create_spec.memory_gib = Some(n);
        return;
    }
    if let Some(n) = numeric_segment(segment, 'c') {
        id.create_spec.cpu = Some(n);
        return;
    }
    if let Some(n) = numeric_segment(segment, 'd') {
        id.create_spec.disk_gib = Some(n);
        return;
    }
    // Anything left is a host user. Only the first one counts; extras make
    // the login ambiguous and fail validation later.
    if *host_user_seen {
        id.diagnostics
            .push(format!("ambiguous extra host user segment: {segment}"));
        return;
    }
    *host_user_seen = true;
    id.host_user = segment.to_string();
}

fn numeric_segment(segment: &str, prefix: char) -> Option<u32> {
    let digits = segment.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> LoginIdentity {
        parse(raw, "")
    }

    #[test]
    fn plain_instance() {
        let id = p("ubuntu");
        assert_eq!(id.instance, "ubuntu");
        assert_eq!(id.project, "default");
        assert_eq!(id.instance_user, "root");
        assert_eq!(id.host_user, "root");
        assert!(id.remote.is_empty());
        assert!(!id.create_instance && !id.persistent);
        assert!(id.validate().is_ok());
    }

    #[test]
    fn full_address() {
        let id = p("prod:dev@web.staging");
        assert_eq!(id.remote, "prod");
        assert_eq!(id.instance_user, "dev");
        assert_eq!(id.instance, "web");
        assert_eq!(id.project, "staging");
    }

    #[test]
    fn host_user_segment() {
        let id = p("dev@web.prod+admin");
        assert_eq!(id.host_user, "admin");
        assert_eq!(id.instance_user, "dev");
        assert_eq!(id.instance, "web");
        assert_eq!(id.project, "prod");
        assert!(id.validate().is_ok());
    }

    #[test]
    fn second_host_user_is_ambiguous() {
        let id = p("web+admin+bob");
        assert_eq!(id.host_user, "admin");
        assert!(id.validate().is_err());
    }

    #[test]
    fn create_prefix() {
        let id = p("+box");
        assert!(id.create_instance);
        assert!(!id.ephemeral_hint);
        assert_eq!(id.instance, "box");
    }

    #[test]
    fn ephemeral_vm_with_spec() {
        let id = p("~vm01+ubuntu/24.04+m4+c2+d20+vm");
        assert!(id.create_instance && id.ephemeral_hint);
        assert_eq!(id.instance, "vm01");
        assert_eq!(id.create_spec.image.as_deref(), Some("ubuntu/24.04"));
        assert_eq!(id.create_spec.memory_gib, Some(4));
        assert_eq!(id.create_spec.cpu, Some(2));
        assert_eq!(id.create_spec.disk_gib, Some(20));
        assert_eq!(id.create_spec.vm, Some(true));
    }

    #[test]
    fn persistent_prefix() {
        let id = p("%ubuntu");
        assert!(id.persistent);
        assert!(!id.create_instance);
        assert_eq!(id.instance, "ubuntu");
    }

    #[test]
    fn profiles_and_flags() {
        let id = p("box+%gpu+%big+nest+priv");
        assert_eq!(id.create_spec.profiles, vec!["gpu", "big"]);
        assert_eq!(id.create_spec.nesting, Some(true));
        assert_eq!(id.create_spec.privileged, Some(true));
        assert_eq!(id.host_user, "root");
    }

    #[test]
    fn single_letter_flags_must_match_whole_segment() {
        // "vmx" is not the vm flag; with no other host user it becomes one.
        let id = p("box+vmx");
        assert_eq!(id.create_spec.vm, None);
        assert_eq!(id.host_user, "vmx");
    }

    #[test]
    fn commands() {
        let id = p("/shell");
        assert_eq!(id.command, Some(Command::Shell));
        assert!(id.instance.is_empty());
        assert!(id.validate().is_ok());

        let id = p("/explain");
        assert_eq!(id.command, Some(Command::Explain));

        let id = p("/remove+web.prod");
        assert_eq!(id.command, Some(Command::Remove { force: false }));
        assert_eq!(id.instance, "web");
        assert_eq!(id.project, "prod");
        assert!(id.validate().is_ok());

        let id = p("/remove--force+web");
        assert_eq!(id.command, Some(Command::Remove { force: true }));
    }

    #[test]
    fn unknown_command_is_diagnosed() {
        let id = p("/frobnicate");
        assert!(id.command.is_none());
        assert!(id.validate().is_err());
    }

    #[test]
    fn remove_without_instance_is_invalid() {
        let id = p("/remove");
        assert!(id.validate().is_err());
    }

    #[test]
    fn empty_input_is_total_but_invalid() {
        let id = p("");
        assert!(id.instance.is_empty());
        assert!(id.validate().is_err());
    }

    #[test]
    fn default_remote_is_seeded() {
        let id = parse("web", "homelab");
        assert_eq!(id.remote, "homelab");
    }

    #[test]
    fn numeric_segments_reject_trailing_garbage() {
        let id = p("box+m4x");
        assert_eq!(id.create_spec.memory_gib, None);
        assert_eq!(id.host_user, "m4x");
    }

    #[test]
    fn format_round_trip() {
        let cases = [
            "ubuntu",
            "web.prod",
            "dev@web.prod",
            "dev@web.prod+admin",
            "prod:dev@web.staging+admin",
            "+box",
            "~vm01+ubuntu/24.04+m4+c2+d20+vm",
            "%ubuntu",
            "box+%gpu+nest",
            "/shell",
            "/explain",
            "/remove+web.prod",
            "/remove--force+web",
            "box+admin+ubuntu/24.04+m2+ephe",
        ];
        for case in cases {
            let id = p(case);
            let formatted = id.format();
            let reparsed = parse(&formatted, "");
            // orig_user always records the raw input, so compare the rest.
            let mut a = id.clone();
            let mut b = reparsed;
            a.orig_user = String::new();
            b.orig_user = String::new();
            assert_eq!(a, b, "round trip failed for {case:?} via {formatted:?}");
        }
    }

    #[test]
    fn explain_mentions_the_pieces() {
        let id = p("~vm01+ubuntu/24.04+m4+vm");
        let text = id.explain();
        assert!(text.contains("vm01"));
        assert!(text.contains("ubuntu/24.04"));
        assert!(text.contains("4 GiB"));
        assert!(text.contains("virtual machine"));
    }
}
