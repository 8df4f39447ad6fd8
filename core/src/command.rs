//! Raw command handling: POSIX splitting and the shell-wrap heuristic.
//!
//! A raw command from an SSH `exec` request is either exec'd directly
//! (after [`shell_words`] splitting) or, when it relies on shell features,
//! wrapped as `<shell> -c "<cmd>"`. The detection lives in one predicate so
//! it can be tested against a corpus of command strings.

/// Shell keywords that force interpretation by a shell even without
/// operator characters.
const SHELL_KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "for", "while", "until", "do", "done", "case", "esac",
    "function", "time", "coproc", "select",
];

/// Whether `cmd` needs a shell to be interpreted correctly.
///
/// True when the command contains operators, redirections, globs,
/// variables, quoting, command substitution, or starts with a shell
/// keyword.
pub fn needs_shell(cmd: &str) -> bool {
    const META: &[char] = &[
        '|', '&', ';', '<', '>', '(', ')', '{', '}', '$', '`', '\\', '"', '\'', '*', '?', '[',
        ']', '#', '~', '=', '%', '\n',
    ];
    if cmd.contains(META) {
        return true;
    }
    match cmd.split_whitespace().next() {
        Some(first) => SHELL_KEYWORDS.contains(&first),
        None => false,
    }
}

/// Turn a raw command string into an argv for the exec API.
///
/// Empty input yields `None` (the caller starts a login shell instead).
/// Commands that need a shell become `<shell> -c <cmd>`; plain ones are
/// split with POSIX shell-words rules. A command that fails to split
/// (unbalanced quotes) is handed to the shell verbatim as a fallback.
pub fn build_argv(raw: &str, shell: &str) -> Option<Vec<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if needs_shell(raw) {
        return Some(vec![shell.to_string(), "-c".to_string(), raw.to_string()]);
    }
    match shell_words::split(raw) {
        Ok(argv) if !argv.is_empty() => Some(argv),
        _ => Some(vec![shell.to_string(), "-c".to_string(), raw.to_string()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_commands_do_not_need_a_shell() {
        for cmd in ["ls -la /tmp", "uname -r", "cat /proc/cpuinfo", "id dev"] {
            assert!(!needs_shell(cmd), "{cmd:?}");
        }
    }

    #[test]
    fn operators_need_a_shell() {
        for cmd in [
            "ls | wc -l",
            "true && echo ok",
            "echo hi; echo there",
            "cat < /etc/hostname",
            "echo $HOME",
            "echo `date`",
            "ls *.log",
            "FOO=bar env",
            "if true; then echo y; fi",
            "echo \"quoted\"",
        ] {
            assert!(needs_shell(cmd), "{cmd:?}");
        }
    }

    #[test]
    fn keywords_only_match_the_first_word() {
        assert!(needs_shell("for f in a b"));
        assert!(!needs_shell("format-disk now"));
    }

    #[test]
    fn build_argv_empty_is_none() {
        assert_eq!(build_argv("", "/bin/bash"), None);
        assert_eq!(build_argv("   ", "/bin/bash"), None);
    }

    #[test]
    fn build_argv_splits_plain_commands() {
        assert_eq!(
            build_argv("ls -la /tmp", "/bin/bash"),
            Some(vec!["ls".into(), "-la".into(), "/tmp".into()])
        );
    }

    #[test]
    fn build_argv_wraps_shell_commands() {
        assert_eq!(
            build_argv("ls | wc -l", "/bin/sh"),
            Some(vec!["/bin/sh".into(), "-c".into(), "ls | wc -l".into()])
        );
    }
}
