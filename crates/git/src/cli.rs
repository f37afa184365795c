use crate::vcs::{ApplyResult, HeadRef, TreeSnapshot, Vcs};
use crate::{GitError, Result};
use async_trait::async_trait;
use nix_bisect_exec::{run, CommandSpec, Output, ResponseTable};
use nix_bisect_protocol::{CancelToken, Revision};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const STATE_DIR_NAME: &str = "nix-bisect";

/// Answers for the questions git asks on a terminal.
pub fn git_prompts() -> nix_bisect_exec::Result<ResponseTable> {
    ResponseTable::new()
        .reply(r"Unlink of file '.*' failed\. Should I try again\? \(y/n\)", "n")?
        .fail(r"^Username for ", "git asked for credentials")?
        .fail(r"^Password for ", "git asked for credentials")
}

/// [`Vcs`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
    git_dir: PathBuf,
    prompts: ResponseTable,
    fallback_identity: bool,
    // Tree operations must finish even after the user interrupted a build,
    // so git never sees the bisection's cancel token.
    uncancellable: CancelToken,
}

impl GitCli {
    /// Open the repository containing `workdir`; commands then run at its
    /// top level.
    pub async fn open(workdir: impl Into<PathBuf>) -> Result<Self> {
        let workdir = workdir.into();
        let mut git = Self {
            workdir,
            git_dir: PathBuf::new(),
            prompts: git_prompts()?,
            fallback_identity: false,
            uncancellable: CancelToken::new(),
        };
        let output = git
            .checked(git.git(["rev-parse", "--absolute-git-dir"]))
            .await?;
        git.git_dir = PathBuf::from(output.stdout.trim());
        let output = git
            .checked(git.git(["rev-parse", "--show-toplevel"]))
            .await?;
        git.workdir = PathBuf::from(output.stdout.trim());

        // Cherry-picks create commits; they need a committer even in
        // sandboxes without a configured identity.
        let ident = git.exec(git.git(["var", "GIT_COMMITTER_IDENT"])).await?;
        git.fallback_identity = !ident.success();
        if git.fallback_identity {
            log::debug!("no committer identity configured, using a placeholder");
        }
        Ok(git)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    fn git<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut spec = CommandSpec::new("git")
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .responses(self.prompts.clone())
            .args(args);
        if self.fallback_identity {
            spec = spec
                .env("GIT_COMMITTER_NAME", "nix-bisect")
                .env("GIT_COMMITTER_EMAIL", "nix-bisect@localhost")
                .env("GIT_AUTHOR_NAME", "nix-bisect")
                .env("GIT_AUTHOR_EMAIL", "nix-bisect@localhost");
        }
        spec
    }

    async fn exec(&self, spec: CommandSpec) -> Result<Output> {
        Ok(run(&spec, &self.uncancellable).await?)
    }

    async fn checked(&self, spec: CommandSpec) -> Result<Output> {
        let output = self.exec(spec.clone()).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(GitError::Command {
                command: spec.display(),
                stderr: output.stderr_tail(10),
            })
        }
    }

    async fn is_merge(&self, rev: &Revision) -> Result<bool> {
        let output = self
            .checked(self.git(["rev-list", "--parents", "-n", "1", rev.as_str()]))
            .await?;
        Ok(output.stdout.split_whitespace().count() > 2)
    }

    async fn stash_index(&self, stash: &str) -> Result<usize> {
        let output = self
            .checked(self.git(["stash", "list", "--format=%H"]))
            .await?;
        output
            .stdout
            .lines()
            .position(|line| line.trim() == stash)
            .ok_or_else(|| GitError::Other(format!("snapshot stash {stash} is gone")))
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn rev_parse(&self, rev: &str) -> Result<Revision> {
        let spec = self.git(["rev-parse", "--verify", "--quiet"]).arg(format!("{rev}^{{commit}}"));
        let output = self.exec(spec).await?;
        let id = output.stdout.trim();
        if !output.success() || id.is_empty() {
            return Err(GitError::UnknownRevision(rev.to_string()));
        }
        Ok(Revision::new(id))
    }

    async fn checkout(&self, rev: &Revision) -> Result<()> {
        self.checked(self.git(["checkout", "--quiet", "--detach", rev.as_str()]))
            .await?;
        Ok(())
    }

    async fn cherry_pick(&self, patch: &Revision) -> Result<ApplyResult> {
        let mut spec = self.git(["cherry-pick", "--no-edit"]);
        if self.is_merge(patch).await? {
            spec = spec.args(["-m", "1"]);
        }
        let output = self.exec(spec.arg(patch.as_str())).await?;
        if output.success() {
            log::debug!("cherry-picked {}", patch.short());
            return Ok(ApplyResult::Applied);
        }
        let empty = output.combined.contains("is now empty")
            || output.combined.contains("nothing to commit");
        let abort = self.exec(self.git(["cherry-pick", "--abort"])).await?;
        if !abort.success() {
            log::debug!("cherry-pick --abort: {}", abort.stderr_tail(3));
        }
        if empty {
            log::debug!("{} is already applied", patch.short());
            Ok(ApplyResult::AlreadyApplied)
        } else {
            Ok(ApplyResult::Failed {
                reason: output.stderr_tail(5),
            })
        }
    }

    async fn snapshot(&self) -> Result<TreeSnapshot> {
        let symbolic = self
            .exec(self.git(["symbolic-ref", "--quiet", "--short", "HEAD"]))
            .await?;
        let commit = self.head().await?;
        let head = if symbolic.success() {
            HeadRef::Branch(symbolic.stdout.trim().to_string())
        } else {
            HeadRef::Detached(commit.clone())
        };

        let stash = if self.is_dirty().await? {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis());
            let message = format!("nix-bisect snapshot {}-{millis}", std::process::id());
            self.checked(
                self.git(["stash", "push", "--include-untracked", "--message"])
                    .arg(&message),
            )
            .await?;
            let id = self.checked(self.git(["rev-parse", "refs/stash"])).await?;
            log::info!("stashed local changes ({message})");
            Some(id.stdout.trim().to_string())
        } else {
            None
        };
        Ok(TreeSnapshot {
            head,
            commit,
            stash,
        })
    }

    async fn restore(&self, snapshot: &TreeSnapshot) -> Result<()> {
        if self.git_dir.join("CHERRY_PICK_HEAD").exists() {
            let abort = self.exec(self.git(["cherry-pick", "--abort"])).await?;
            if !abort.success() {
                log::debug!("cherry-pick --abort: {}", abort.stderr_tail(3));
            }
        }
        self.checked(self.git(["reset", "--quiet", "--hard"])).await?;
        self.checked(self.git(["clean", "--quiet", "-fd"])).await?;
        match &snapshot.head {
            HeadRef::Branch(branch) => {
                self.checked(self.git(["checkout", "--quiet", branch.as_str()]))
                    .await?;
            }
            HeadRef::Detached(rev) => self.checkout(rev).await?,
        }
        if let Some(stash) = &snapshot.stash {
            let index = self.stash_index(stash).await?;
            self.checked(
                self.git(["stash", "pop", "--quiet", "--index"])
                    .arg(format!("stash@{{{index}}}")),
            )
            .await?;
        }
        Ok(())
    }

    async fn is_ancestor(&self, ancestor: &Revision, descendant: &Revision) -> Result<bool> {
        let spec = self.git([
            "merge-base",
            "--is-ancestor",
            ancestor.as_str(),
            descendant.as_str(),
        ]);
        let output = self.exec(spec.clone()).await?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(GitError::Command {
                command: spec.display(),
                stderr: output.stderr_tail(10),
            }),
        }
    }

    async fn ancestry_path(&self, good: &Revision, bad: &Revision) -> Result<Vec<Revision>> {
        if !self.is_ancestor(good, bad).await? {
            return Err(GitError::NotAncestor {
                good: good.clone(),
                bad: bad.clone(),
            });
        }
        let range = format!("{good}..{bad}");
        let output = self
            .checked(
                self.git(["rev-list", "--topo-order", "--reverse", "--ancestry-path"])
                    .arg(range),
            )
            .await?;
        let mut history = vec![good.clone()];
        history.extend(
            output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(Revision::new),
        );
        Ok(history)
    }

    async fn is_dirty(&self) -> Result<bool> {
        let output = self
            .checked(self.git(["status", "--porcelain", "--untracked-files=normal"]))
            .await?;
        Ok(!output.stdout.trim().is_empty())
    }

    fn state_dir(&self) -> PathBuf {
        self.git_dir.join(STATE_DIR_NAME)
    }
}
