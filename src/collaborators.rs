//! Out-of-scope named contracts: repository checkout, Python environment
//! setup, and a remote decompiler lookup. These are deliberately thin —
//! the spec names them as collaborators of the debugger core, not as
//! something this service reimplements in depth.
//!
//! Grounded on `original_source/pwnomcp/tools/git.py` (`fetch_repo`),
//! `original_source/pwnomcp/tools/python.py` (env setup contract), and
//! `original_source/pwnomcp/retdec/retdec.py` (remote decompiler client);
//! delegates the actual process spawning to [`crate::subprocess`] so
//! there's exactly one code path that runs a shell command.

use crate::subprocess::SubprocessManager;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct FetchRepoResult {
    pub path: String,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Shallow-clone (by default) a repository into `workspace_dir`, optionally
/// checking out a specific branch/tag/commit.
pub async fn fetch_repo(
    subprocess: &SubprocessManager,
    workspace_dir: &str,
    repo_url: &str,
    version: Option<&str>,
    shallow: bool,
) -> FetchRepoResult {
    let repo_name = repo_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git");
    let target = format!("{workspace_dir}/{repo_name}");

    let mut clone_cmd = String::from("git clone --quiet");
    if shallow && version.is_none() {
        clone_cmd.push_str(" --depth 1");
    }
    clone_cmd.push_str(&format!(" {repo_url} {target}"));

    let clone = subprocess.run(&clone_cmd, None, &[], Some(300)).await;
    if !clone.success {
        return FetchRepoResult {
            path: target,
            commit: None,
            branch: None,
            success: false,
            error: Some(if clone.stderr.is_empty() {
                "git clone failed".to_string()
            } else {
                clone.stderr
            }),
        };
    }

    if let Some(version) = version {
        let checkout = subprocess
            .run(
                &format!("git checkout --quiet {version} || git checkout --quiet origin/{version}"),
                Some(&target),
                &[],
                Some(60),
            )
            .await;
        if !checkout.success {
            return FetchRepoResult {
                path: target,
                commit: None,
                branch: None,
                success: false,
                error: Some(format!("checkout of '{version}' failed: {}", checkout.stderr)),
            };
        }
    }

    let commit = subprocess
        .run("git rev-parse HEAD", Some(&target), &[], Some(10))
        .await;
    let branch = subprocess
        .run(
            "git rev-parse --abbrev-ref HEAD",
            Some(&target),
            &[],
            Some(10),
        )
        .await;

    FetchRepoResult {
        path: target,
        commit: commit.success.then(|| commit.stdout.trim().to_string()),
        branch: branch.success.then(|| branch.stdout.trim().to_string()),
        success: true,
        error: None,
    }
}

/// Remove a previously fetched repository's working tree.
pub async fn cleanup_workspace(subprocess: &SubprocessManager, path: &str) -> bool {
    subprocess
        .run(&format!("rm -rf {path}"), None, &[], Some(30))
        .await
        .success
}

/// Ensure a Python virtualenv exists at `venv_path` with `requirements`
/// installed, creating it if absent. Contract-only: this service shells
/// out to `python3 -m venv` / `pip install` rather than managing
/// interpreters itself.
pub async fn ensure_python_env(
    subprocess: &SubprocessManager,
    venv_path: &str,
    requirements: &[String],
) -> Result<(), String> {
    let create = subprocess
        .run(
            &format!("test -d {venv_path} || python3 -m venv {venv_path}"),
            None,
            &[],
            Some(60),
        )
        .await;
    if !create.success {
        return Err(format!("failed to create venv: {}", create.stderr));
    }
    if requirements.is_empty() {
        return Ok(());
    }
    let install = subprocess
        .run(
            &format!(
                "{venv_path}/bin/pip install -q {}",
                requirements.join(" ")
            ),
            None,
            &[],
            Some(300),
        )
        .await;
    if !install.success {
        return Err(format!("failed to install requirements: {}", install.stderr));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct DecompileResult {
    pub success: bool,
    pub source: Option<String>,
    pub error: Option<String>,
}

/// Ask a remote decompiler service (address from `BINARY_URL`) to
/// decompile a function. Out of scope for this service's own logic; this
/// is a thin HTTP client per spec.md §6's `BINARY_URL` env var.
pub async fn decompile_remote(
    client: &reqwest::Client,
    binary_url: &str,
    binary_path: &str,
    function: &str,
) -> DecompileResult {
    let response = client
        .post(binary_url)
        .json(&serde_json::json!({"binary_path": binary_path, "function": function}))
        .send()
        .await;

    match response {
        Ok(resp) => match resp.json::<DecompileResult>().await {
            Ok(result) => result,
            Err(e) => DecompileResult {
                success: false,
                source: None,
                error: Some(format!("malformed decompiler response: {e}")),
            },
        },
        Err(e) => DecompileResult {
            success: false,
            source: None,
            error: Some(format!("decompiler request failed: {e}")),
        },
    }
}

/// Render a breakpoint as a short human-readable line, used by tool result
/// formatting (`original_source/pwnomcp/utils/format.py`).
#[must_use]
pub fn format_breakpoint(bp: &crate::state::Breakpoint) -> String {
    let status = if bp.enabled { "enabled" } else { "disabled" };
    match (&bp.address, &bp.condition) {
        (Some(addr), Some(cond)) => {
            format!("#{} {} at {addr} if {cond} ({status}, hit {})", bp.number, bp.location, bp.hit_count)
        }
        (Some(addr), None) => {
            format!("#{} {} at {addr} ({status}, hit {})", bp.number, bp.location, bp.hit_count)
        }
        (None, _) => format!("#{} {} ({status}, hit {})", bp.number, bp.location, bp.hit_count),
    }
}

/// Render a memory dump's hex bytes as a `hexdump`-style block.
#[must_use]
pub fn format_memory_dump(addr: &str, bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let offset = row * 16;
        out.push_str(&format!("{addr}+{offset:04x}: "));
        for byte in chunk {
            out.push_str(&format!("{byte:02x} "));
        }
        out.push('\n');
    }
    out
}
