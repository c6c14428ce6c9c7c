//! Dangerous-command detection shared by [`crate::subprocess`] and the
//! exploit pipe. Lifted from the teacher's process module, which guards
//! the one place this service shells out on an agent's behalf.

use regex::Regex;
use std::sync::LazyLock;

const PROTECTED_PATHS: &[&str] = &[
    "/", "/*", "/bin", "/sbin", "/usr", "/etc", "/var", "/home", "/root", "/lib", "/lib64",
    "/opt", "/boot", "/dev", "/sys", "/proc",
];

static DANGEROUS_PATTERNS: LazyLock<Vec<DangerousPattern>> = LazyLock::new(|| {
    vec![
        DangerousPattern {
            regex: Regex::new(r":\(\)\s*\{.*\|.*&\s*\}\s*;").unwrap(),
            description: "fork bomb",
        },
        DangerousPattern {
            regex: Regex::new(r"\bmkfs\b").unwrap(),
            description: "filesystem format (mkfs)",
        },
        DangerousPattern {
            regex: Regex::new(r"\bdd\b.*\bof=/dev/").unwrap(),
            description: "raw write to block device (dd of=/dev/...)",
        },
        DangerousPattern {
            regex: Regex::new(r">\s*/dev/(sd|nvme|hd|vd|xvd|disk|mapper/)").unwrap(),
            description: "redirect to block device",
        },
        DangerousPattern {
            regex: Regex::new(r"\b(shutdown|reboot|halt|poweroff)\b").unwrap(),
            description: "system shutdown/reboot",
        },
        DangerousPattern {
            regex: Regex::new(r"\binit\s+[06]\b").unwrap(),
            description: "system halt/reboot via init",
        },
    ]
});

struct DangerousPattern {
    regex: Regex,
    description: &'static str,
}

/// Validate a command against dangerous patterns. `Ok(())` if safe,
/// `Err(description)` otherwise.
pub fn validate_command(command: &str) -> Result<(), String> {
    for pattern in DANGEROUS_PATTERNS.iter() {
        if pattern.regex.is_match(command) {
            return Err(format!(
                "blocked: command matches dangerous pattern ({}): {}",
                pattern.description, command
            ));
        }
    }
    check_destructive_on_protected_paths(command)
}

fn check_destructive_on_protected_paths(command: &str) -> Result<(), String> {
    for subcmd in split_subcommands(command.trim()) {
        let subcmd = subcmd.trim();
        if subcmd.is_empty() {
            continue;
        }
        if is_dangerous_rm(subcmd) {
            return Err(format!(
                "blocked: recursive delete targeting a protected system path: {subcmd}"
            ));
        }
        if is_dangerous_chmod_chown(subcmd, "chmod") {
            return Err(format!(
                "blocked: recursive chmod on a protected system path: {subcmd}"
            ));
        }
        if is_dangerous_chmod_chown(subcmd, "chown") {
            return Err(format!(
                "blocked: recursive chown on a protected system path: {subcmd}"
            ));
        }
    }
    Ok(())
}

fn split_subcommands(cmd: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut remaining = cmd;
    while !remaining.is_empty() {
        if let Some(pos) = remaining
            .find("&&")
            .into_iter()
            .chain(remaining.find("||"))
            .chain(remaining.find(';'))
            .min()
        {
            parts.push(&remaining[..pos]);
            let sep_len =
                if remaining[pos..].starts_with("&&") || remaining[pos..].starts_with("||") {
                    2
                } else {
                    1
                };
            remaining = &remaining[pos + sep_len..];
        } else {
            parts.push(remaining);
            break;
        }
    }
    parts
}

fn is_dangerous_rm(subcmd: &str) -> bool {
    let words: Vec<&str> = subcmd.split_whitespace().collect();
    let Some(rm_pos) = words.iter().position(|w| *w == "rm") else {
        return false;
    };
    let args = &words[rm_pos + 1..];
    let has_recursive = args.iter().any(|a| {
        *a == "-r"
            || *a == "-R"
            || *a == "--recursive"
            || a.starts_with('-') && !a.starts_with("--") && (a.contains('r') || a.contains('R'))
    });
    if !has_recursive {
        return false;
    }
    args.iter().any(|arg| targets_protected_path(arg))
}

fn is_dangerous_chmod_chown(subcmd: &str, cmd_name: &str) -> bool {
    let words: Vec<&str> = subcmd.split_whitespace().collect();
    let Some(cmd_pos) = words.iter().position(|w| *w == cmd_name) else {
        return false;
    };
    let args = &words[cmd_pos + 1..];
    let has_recursive = args.iter().any(|a| {
        *a == "-R" || *a == "--recursive" || a.starts_with('-') && !a.starts_with("--") && a.contains('R')
    });
    if !has_recursive {
        return false;
    }
    args.iter().any(|arg| targets_protected_path(arg))
}

fn targets_protected_path(arg: &str) -> bool {
    if arg.starts_with('-') {
        return false;
    }
    if arg == "/*" {
        return true;
    }
    let path = arg.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    PROTECTED_PATHS.iter().any(|p| {
        let p = p.trim_end_matches('/');
        let p = if p.is_empty() { "/" } else { p };
        path == p
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_fork_bomb() {
        assert!(validate_command(":(){ :|:& };:").is_err());
    }

    #[test]
    fn blocks_recursive_rm_on_root() {
        assert!(validate_command("rm -rf /").is_err());
    }

    #[test]
    fn allows_recursive_rm_on_workdir() {
        assert!(validate_command("rm -rf /tmp/build").is_ok());
    }

    #[test]
    fn allows_ordinary_command() {
        assert!(validate_command("git clone https://example.com/repo.git").is_ok());
    }

    #[test]
    fn blocks_dd_to_block_device() {
        assert!(validate_command("dd if=/dev/zero of=/dev/sda").is_err());
    }
}
