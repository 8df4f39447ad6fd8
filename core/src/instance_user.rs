//! Users inside an instance, resolved with `getent passwd`.

use crate::errors::ExecError;

/// An account inside an instance.
///
/// Produced by running `getent passwd <name>` through the exec API and
/// parsing the single matching record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceUser {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub home_dir: String,
    pub shell: String,
    /// The raw passwd record, kept for logging.
    pub raw: String,
}

/// Parse one `passwd(5)` record: `name:x:uid:gid:gecos:home:shell`.
pub fn parse_passwd_line(line: &str) -> Result<InstanceUser, ExecError> {
    let line = line.trim();
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 7 {
        return Err(ExecError::Stream(format!(
            "malformed passwd record: {line:?}"
        )));
    }
    let uid = fields[2]
        .parse()
        .map_err(|_| ExecError::Stream(format!("bad uid in passwd record: {line:?}")))?;
    let gid = fields[3]
        .parse()
        .map_err(|_| ExecError::Stream(format!("bad gid in passwd record: {line:?}")))?;
    Ok(InstanceUser {
        user: fields[0].to_string(),
        uid,
        gid,
        home_dir: fields[5].to_string(),
        shell: fields[6].to_string(),
        raw: line.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root() {
        let user = parse_passwd_line("root:x:0:0:root:/root:/bin/bash").unwrap();
        assert_eq!(user.user, "root");
        assert_eq!(user.uid, 0);
        assert_eq!(user.gid, 0);
        assert_eq!(user.home_dir, "/root");
        assert_eq!(user.shell, "/bin/bash");
    }

    #[test]
    fn parses_regular_user_with_empty_gecos() {
        let user = parse_passwd_line("dev:x:1000:1000::/home/dev:/bin/sh\n").unwrap();
        assert_eq!(user.uid, 1000);
        assert_eq!(user.home_dir, "/home/dev");
    }

    #[test]
    fn rejects_short_records() {
        assert!(parse_passwd_line("dev:x:1000").is_err());
    }

    #[test]
    fn rejects_non_numeric_ids() {
        assert!(parse_passwd_line("dev:x:abc:1000::/home/dev:/bin/sh").is_err());
    }
}
