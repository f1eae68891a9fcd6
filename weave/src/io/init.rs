//! `.weave/` scaffolding and git hook installation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use tracing::{debug, info, warn};

use crate::io::config::{HooksConfig, Mode, WeaveConfig, write_config};
use crate::io::git::Git;
use crate::io::state_cache::{StateRecord, save_state};

/// All canonical paths within `.weave/` for a repository root.
#[derive(Debug, Clone)]
pub struct WeavePaths {
    pub root: PathBuf,
    pub weave_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub locks_dir: PathBuf,
    pub completions_path: PathBuf,
    pub metrics_path: PathBuf,
}

impl WeavePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let weave_dir = root.join(".weave");
        Self {
            root: root.clone(),
            weave_dir: weave_dir.clone(),
            gitignore_path: weave_dir.join(".gitignore"),
            config_path: weave_dir.join("config.toml"),
            state_path: weave_dir.join("state.json"),
            locks_dir: weave_dir.join("locks"),
            completions_path: weave_dir.join("completions.jsonl"),
            metrics_path: weave_dir.join("metrics.json"),
        }
    }

    /// Locate the main repository root from anywhere inside it, including
    /// from inside a task worktree.
    pub fn discover(start: &Path, timeout: Duration) -> Result<Self> {
        let git = Git::new(start).with_timeout(timeout);
        let common = git.common_dir()?;
        let common = common
            .canonicalize()
            .with_context(|| format!("resolve git dir {}", common.display()))?;
        let root = match (common.file_name(), common.parent()) {
            (Some(name), Some(parent)) if name == ".git" => parent.to_path_buf(),
            _ => git.toplevel()?,
        };
        debug!(root = %root.display(), "repository root");
        Ok(Self::new(root))
    }

    /// Worktree root for a config (relative bases hang off the repo root).
    pub fn worktree_base(&self, cfg: &WeaveConfig) -> PathBuf {
        let base = Path::new(&cfg.worktree_base);
        if base.is_absolute() {
            base.to_path_buf()
        } else {
            self.root.join(base)
        }
    }

    pub fn workspace_path(&self, cfg: &WeaveConfig, canonical_name: &str) -> PathBuf {
        self.worktree_base(cfg).join(canonical_name)
    }
}

/// Options for `init_weave`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Rewrite config and hooks even if `.weave/` exists. Never touches the cache.
    pub force: bool,
    pub mode: Option<Mode>,
    /// Program the hooks exec (normally the running binary).
    pub hook_binary: PathBuf,
}

/// What `init_weave` did.
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub hooks_installed: Vec<String>,
    pub hooks_backed_up: Vec<String>,
}

/// Create `.weave/` scaffolding in `paths.root` and install hooks.
///
/// Fails if `.weave/` already exists unless `options.force` is set.
pub fn init_weave(paths: &WeavePaths, git: &Git, options: &InitOptions) -> Result<InitReport> {
    if paths.weave_dir.exists() && !paths.weave_dir.is_dir() {
        return Err(anyhow!("weave init: .weave exists but is not a directory"));
    }
    if paths.weave_dir.exists() && !options.force {
        return Err(anyhow!(
            "weave init: .weave already exists (use --force to rewrite config and hooks)"
        ));
    }

    create_dir(&paths.weave_dir)?;
    create_dir(&paths.locks_dir)?;
    write_file(&paths.gitignore_path, WEAVE_GITIGNORE)?;

    let mut cfg = if paths.config_path.exists() {
        crate::io::config::load_config(&paths.config_path)?
    } else {
        WeaveConfig::default()
    };
    if let Some(mode) = options.mode {
        cfg.mode = mode;
    }
    write_config(&paths.config_path, &cfg)?;
    create_dir(&paths.worktree_base(&cfg))?;

    if !paths.state_path.exists() {
        save_state(&paths.state_path, &StateRecord::default())?;
    }

    let hooks_dir = git.common_dir()?.join("hooks");
    let report = install_hooks(&hooks_dir, &cfg.hooks, &options.hook_binary)?;
    info!(
        root = %paths.root.display(),
        mode = ?cfg.mode,
        hooks = report.hooks_installed.len(),
        "weave initialized"
    );
    Ok(report)
}

/// Make sure `.weave/` and its `.gitignore` exist without touching anything else.
pub fn ensure_layout(paths: &WeavePaths) -> Result<()> {
    create_dir(&paths.locks_dir)?;
    if !paths.gitignore_path.exists() {
        write_file(&paths.gitignore_path, WEAVE_GITIGNORE)?;
    }
    Ok(())
}

/// Names of the hooks weave manages, in install order.
pub const HOOK_NAMES: [&str; 4] = ["pre-commit", "commit-msg", "post-commit", "pre-push"];

fn hook_enabled(hooks: &HooksConfig, name: &str) -> bool {
    match name {
        "pre-commit" => hooks.pre_commit,
        "commit-msg" => hooks.commit_msg,
        "post-commit" => hooks.post_commit,
        "pre-push" => hooks.pre_push,
        _ => false,
    }
}

/// Write hook adapters into `hooks_dir`, backing up foreign hooks once.
pub fn install_hooks(hooks_dir: &Path, hooks: &HooksConfig, binary: &Path) -> Result<InitReport> {
    create_dir(hooks_dir)?;
    let mut report = InitReport::default();
    for name in HOOK_NAMES {
        if !hook_enabled(hooks, name) {
            continue;
        }
        let path = hooks_dir.join(name);
        if path.exists() {
            let existing = fs::read_to_string(&path).unwrap_or_default();
            if !existing.contains(HOOK_MARKER) {
                let backup = hooks_dir.join(format!("{name}.backup"));
                if backup.exists() {
                    warn!(hook = name, "foreign hook and backup both present, leaving hook alone");
                    continue;
                }
                fs::rename(&path, &backup)
                    .with_context(|| format!("back up hook {}", path.display()))?;
                report.hooks_backed_up.push(name.to_string());
            }
        }
        let script = render_hook(name, binary)?;
        write_file(&path, &script)?;
        make_executable(&path)?;
        report.hooks_installed.push(name.to_string());
    }
    Ok(report)
}

const HOOK_MARKER: &str = "weave-managed hook";

const HOOK_TEMPLATE: &str = r#"#!/bin/sh
# {{ marker }}: {{ name }}
if [ -x "$0.backup" ]; then
  "$0.backup" "$@" || exit $?
fi
exec {{ binary }} hook {{ name }} "$@"
"#;

fn render_hook(name: &str, binary: &Path) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("hook", HOOK_TEMPLATE)
        .context("load hook template")?;
    let template = env.get_template("hook").context("get hook template")?;
    template
        .render(context! {
            marker => HOOK_MARKER,
            name => name,
            binary => shell_quote(&binary.to_string_lossy()),
        })
        .with_context(|| format!("render {name} hook"))
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const WEAVE_GITIGNORE: &str = "*\n!.gitignore\n!config.toml\n";

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies hook adapters exec the binary and foreign hooks are preserved.
    #[test]
    fn install_backs_up_foreign_hook_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hooks = temp.path().join("hooks");
        fs::create_dir_all(&hooks).expect("mkdir");
        fs::write(hooks.join("pre-commit"), "#!/bin/sh\necho mine\n").expect("seed");

        let binary = Path::new("/opt/tools/weave");
        let report = install_hooks(&hooks, &HooksConfig::default(), binary).expect("install");
        assert_eq!(report.hooks_installed.len(), 4);
        assert_eq!(report.hooks_backed_up, vec!["pre-commit".to_string()]);
        assert!(
            fs::read_to_string(hooks.join("pre-commit.backup"))
                .expect("backup")
                .contains("echo mine")
        );

        let script = fs::read_to_string(hooks.join("pre-commit")).expect("hook");
        assert!(script.contains("exec '/opt/tools/weave' hook pre-commit \"$@\""));

        let again = install_hooks(&hooks, &HooksConfig::default(), binary).expect("reinstall");
        assert!(again.hooks_backed_up.is_empty());
    }

    #[test]
    fn disabled_hooks_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hooks = HooksConfig {
            pre_push: false,
            ..HooksConfig::default()
        };
        let report = install_hooks(temp.path(), &hooks, Path::new("weave")).expect("install");
        assert!(!report.hooks_installed.contains(&"pre-push".to_string()));
        assert!(!temp.path().join("pre-push").exists());
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/a b/it's"), r"'/a b/it'\''s'");
    }

    #[test]
    fn relative_worktree_base_hangs_off_root() {
        let paths = WeavePaths::new("/repo");
        let cfg = WeaveConfig::default();
        assert_eq!(
            paths.workspace_path(&cfg, "task-42-implementer"),
            PathBuf::from("/repo/.weave/worktrees/task-42-implementer")
        );
    }
}
