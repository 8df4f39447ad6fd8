//! Instance OS family detection and package installation pipelines.
//!
//! Detection reads `/usr/lib/os-release` (falling back to
//! `/etc/os-release`) from inside the instance and maps `ID`/`ID_LIKE`
//! onto the small set of families we know how to install packages on.

use std::collections::HashMap;

/// Linux families with distinct package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Debian,
    Rhel,
    Alpine,
}

impl OsFamily {
    /// Shell pipeline that installs `package` on this family.
    pub fn install_command(&self, package: &str) -> String {
        match self {
            Self::Debian => format!("apt-get update && apt-get install -y {package}"),
            Self::Rhel => format!("dnf install -y {package}"),
            Self::Alpine => format!("apk add --no-cache {package}"),
        }
    }
}

/// Candidate paths for the os-release file, in probe order.
pub const OS_RELEASE_PATHS: &[&str] = &["/usr/lib/os-release", "/etc/os-release"];

/// Parse os-release KEY=VALUE lines into a map, stripping quotes.
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            map.insert(key.trim().to_string(), value.to_string());
        }
    }
    map
}

/// Map `ID` / `ID_LIKE` values to an [`OsFamily`].
pub fn detect_family(fields: &HashMap<String, String>) -> Option<OsFamily> {
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(id) = fields.get("ID") {
        candidates.push(id);
    }
    if let Some(like) = fields.get("ID_LIKE") {
        candidates.extend(like.split_whitespace());
    }
    for name in candidates {
        match name {
            "debian" | "ubuntu" => return Some(OsFamily::Debian),
            "rhel" | "fedora" | "centos" | "rocky" | "almalinux" => return Some(OsFamily::Rhel),
            "alpine" => return Some(OsFamily::Alpine),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_values() {
        let fields = parse_os_release(
            "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"24.04\"\n",
        );
        assert_eq!(fields["NAME"], "Ubuntu");
        assert_eq!(fields["ID"], "ubuntu");
        assert_eq!(fields["VERSION_ID"], "24.04");
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let fields = parse_os_release("# comment\n\nID=alpine\n");
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn detects_by_id() {
        let fields = parse_os_release("ID=alpine\n");
        assert_eq!(detect_family(&fields), Some(OsFamily::Alpine));
    }

    #[test]
    fn detects_by_id_like() {
        let fields = parse_os_release("ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n");
        assert_eq!(detect_family(&fields), Some(OsFamily::Debian));

        let fields = parse_os_release("ID=rocky\nID_LIKE=\"rhel centos fedora\"\n");
        assert_eq!(detect_family(&fields), Some(OsFamily::Rhel));
    }

    #[test]
    fn unknown_family_is_none() {
        let fields = parse_os_release("ID=plan9\n");
        assert_eq!(detect_family(&fields), None);
    }

    #[test]
    fn install_commands() {
        assert_eq!(
            OsFamily::Debian.install_command("tmux"),
            "apt-get update && apt-get install -y tmux"
        );
        assert_eq!(OsFamily::Alpine.install_command("tmux"), "apk add --no-cache tmux");
        assert_eq!(OsFamily::Rhel.install_command("tmux"), "dnf install -y tmux");
    }
}
