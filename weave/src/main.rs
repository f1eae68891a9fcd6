//! `weave`: isolated git worktrees and quality gates for parallel agents.
//!
//! Each task gets a branch and a worktree under `.weave/worktrees/`; metadata
//! rides along in git notes; `.weave/state.json` caches what is active.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use weave::cli::{self, MetaChanges, NotesDirection};
use weave::core::checklist::Checkpoint;
use weave::core::types::Role;
use weave::error::classify;
use weave::exit_codes;
use weave::io::config::Mode;
use weave::lifecycle::CompleteOptions;
use weave::logging;

#[derive(Parser)]
#[command(
    name = "weave",
    version,
    about = "Git-native workspace coordination for parallel agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.weave/` and install the git hook adapters.
    Init {
        /// Rewrite config and hooks if `.weave/` already exists.
        #[arg(short, long)]
        force: bool,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Create a branch and worktree for a task.
    Spawn {
        task: String,
        #[arg(long, value_enum)]
        role: RoleArg,
        /// Descriptive slug for the branch name (defaults to the role).
        #[arg(long)]
        title: Option<String>,
        #[arg(long = "label")]
        labels: Vec<String>,
    },
    /// Show every workspace known to the cache, git, or the filesystem.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one workspace in detail.
    Status {
        task: String,
        #[arg(long)]
        json: bool,
    },
    /// Run the completion gate and remove the workspace.
    Complete {
        task: String,
        /// Remove even if checks fail (the failure is still recorded).
        #[arg(long)]
        force: bool,
        /// Keep the task branch even if it is already merged.
        #[arg(long)]
        keep_branch: bool,
    },
    /// Repair a workspace flagged by `reconcile`.
    Recover { task: String },
    /// Refresh cached health from git and the filesystem.
    Reconcile {
        #[arg(long)]
        json: bool,
    },
    /// Run one validation checkpoint for a task.
    Checkpoint {
        #[arg(value_enum)]
        checkpoint: CheckpointArg,
        task: String,
        /// Commit message to check along with the staged diff.
        #[arg(long)]
        message_file: Option<PathBuf>,
    },
    /// Read or write a task's metadata note.
    Meta {
        #[command(subcommand)]
        action: MetaAction,
    },
    /// Sync the metadata notes ref with a remote.
    Notes {
        #[command(subcommand)]
        action: NotesAction,
    },
    /// Entry point for installed git hooks.
    #[command(hide = true)]
    Hook {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand)]
enum MetaAction {
    Show {
        task: String,
    },
    Set {
        task: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long = "label")]
        labels: Vec<String>,
        #[arg(long = "skill")]
        skills: Vec<String>,
        /// Fail unless the stored note still has this hash.
        #[arg(long)]
        expect: Option<String>,
    },
}

#[derive(Subcommand)]
enum NotesAction {
    Push {
        #[arg(long)]
        remote: Option<String>,
    },
    Fetch {
        #[arg(long)]
        remote: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Local,
    Github,
    Hybrid,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Local => Mode::Local,
            ModeArg::Github => Mode::Github,
            ModeArg::Hybrid => Mode::Hybrid,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Pm,
    Architect,
    #[value(alias = "engineer")]
    Implementer,
    Reviewer,
    Ux,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Pm => Role::Pm,
            RoleArg::Architect => Role::Architect,
            RoleArg::Implementer => Role::Implementer,
            RoleArg::Reviewer => Role::Reviewer,
            RoleArg::Ux => Role::Ux,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CheckpointArg {
    PreChange,
    PreCompletion,
    PostCompletion,
}

impl From<CheckpointArg> for Checkpoint {
    fn from(arg: CheckpointArg) -> Self {
        match arg {
            CheckpointArg::PreChange => Checkpoint::PreChange,
            CheckpointArg::PreCompletion => Checkpoint::PreCompletion,
            CheckpointArg::PostCompletion => Checkpoint::PostCompletion,
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(weave_err) = classify(&err) {
                for line in weave_err.remediation() {
                    eprintln!("  - {line}");
                }
            }
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let cwd = std::env::current_dir().context("read current directory")?;
    match cli.command {
        Command::Init { force, mode } => cli::cmd_init(&cwd, force, mode.map(Mode::from)),
        Command::Spawn {
            task,
            role,
            title,
            labels,
        } => cli::cmd_spawn(&cwd, &task, role.into(), title.as_deref(), labels),
        Command::List { json } => cli::cmd_list(&cwd, json),
        Command::Status { task, json } => cli::cmd_status(&cwd, &task, json),
        Command::Complete {
            task,
            force,
            keep_branch,
        } => cli::cmd_complete(&cwd, &task, CompleteOptions { force, keep_branch }),
        Command::Recover { task } => cli::cmd_recover(&cwd, &task),
        Command::Reconcile { json } => cli::cmd_reconcile(&cwd, json),
        Command::Checkpoint {
            checkpoint,
            task,
            message_file,
        } => cli::cmd_checkpoint(&cwd, checkpoint.into(), &task, message_file.as_deref()),
        Command::Meta { action } => match action {
            MetaAction::Show { task } => cli::cmd_meta_show(&cwd, &task),
            MetaAction::Set {
                task,
                status,
                labels,
                skills,
                expect,
            } => cli::cmd_meta_set(
                &cwd,
                &task,
                MetaChanges {
                    status,
                    labels,
                    skills,
                    expect,
                },
            ),
        },
        Command::Notes { action } => match action {
            NotesAction::Push { remote } => {
                cli::cmd_notes(&cwd, NotesDirection::Push, remote.as_deref())
            }
            NotesAction::Fetch { remote } => {
                cli::cmd_notes(&cwd, NotesDirection::Fetch, remote.as_deref())
            }
        },
        Command::Hook { name, args } => cli::cmd_hook(&cwd, &name, &args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_spawn_with_labels() {
        let cli = Cli::parse_from([
            "weave", "spawn", "42", "--role", "engineer", "--label", "api", "--label", "db",
        ]);
        let Command::Spawn {
            task, role, labels, ..
        } = cli.command
        else {
            panic!("expected spawn");
        };
        assert_eq!(task, "42");
        assert_eq!(Role::from(role), Role::Implementer);
        assert_eq!(labels, vec!["api".to_string(), "db".to_string()]);
    }

    #[test]
    fn parse_complete_force() {
        let cli = Cli::parse_from(["weave", "complete", "7", "--force"]);
        assert!(matches!(
            cli.command,
            Command::Complete {
                force: true,
                keep_branch: false,
                ..
            }
        ));
    }

    #[test]
    fn parse_complete_keep_branch() {
        let cli = Cli::parse_from(["weave", "complete", "7", "--keep-branch"]);
        assert!(matches!(
            cli.command,
            Command::Complete {
                force: false,
                keep_branch: true,
                ..
            }
        ));
    }

    #[test]
    fn parse_checkpoint_kebab_case() {
        let cli = Cli::parse_from(["weave", "checkpoint", "pre-completion", "42"]);
        let Command::Checkpoint { checkpoint, .. } = cli.command else {
            panic!("expected checkpoint");
        };
        assert_eq!(Checkpoint::from(checkpoint), Checkpoint::PreCompletion);
    }

    #[test]
    fn hook_passes_trailing_args_through() {
        let cli = Cli::parse_from(["weave", "hook", "commit-msg", ".git/COMMIT_EDITMSG"]);
        let Command::Hook { name, args } = cli.command else {
            panic!("expected hook");
        };
        assert_eq!(name, "commit-msg");
        assert_eq!(args, vec![".git/COMMIT_EDITMSG".to_string()]);
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!(Cli::try_parse_from(["weave", "spawn", "1", "--role", "intern"]).is_err());
    }
}
