use crate::gcroot::{GcRoot, GcRootDir};
use crate::parse::{parse_dry_run, parse_failed_builds};
use crate::tool::{BuildOptions, BuildReport, BuildTool, DryRun};
use crate::{NixError, Result};
use async_trait::async_trait;
use nix_bisect_exec::{run, run_streaming, CommandSpec, ResponseTable, Stream};
use nix_bisect_protocol::{BuildTarget, CancelToken};
use std::path::{Path, PathBuf};

/// Answers for the questions nix asks on a terminal.
///
/// Flake configuration and trust questions are declined so that a bisection
/// never silently widens what nix trusts.
pub fn nix_prompts() -> nix_bisect_exec::Result<ResponseTable> {
    ResponseTable::new()
        .reply(r"do you want to allow configuration setting .*\(y/N\)\?", "n")?
        .reply(r"permanently mark this value as (un)?trusted \(y/N\)\?", "n")?
        .fail(r"(?i)password[^:]*:\s*$", "nix asked for a password")
}

/// [`BuildTool`] backed by `nix-instantiate` and `nix-store`.
#[derive(Debug, Clone)]
pub struct NixCli {
    workdir: PathBuf,
    gcroots: GcRootDir,
    prompts: ResponseTable,
}

impl NixCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            workdir: workdir.into(),
            gcroots: GcRootDir::from_env(),
            prompts: nix_prompts()?,
        })
    }

    pub fn with_gcroots(mut self, gcroots: GcRootDir) -> Self {
        self.gcroots = gcroots;
        self
    }

    fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program)
            .current_dir(&self.workdir)
            .responses(self.prompts.clone())
    }

    fn instantiate_spec(&self, target: &BuildTarget) -> CommandSpec {
        let mut spec = self
            .command("nix-instantiate")
            .arg(&target.nix_file)
            .arg("-A")
            .arg(&target.attr);
        for (name, value) in &target.argstr {
            spec = spec.arg("--argstr").arg(name).arg(value);
        }
        for (name, expr) in &target.args {
            spec = spec.arg("--arg").arg(name).arg(expr);
        }
        for (name, value) in &target.options {
            spec = spec.arg("--option").arg(name).arg(value);
        }
        spec
    }
}

fn realise_spec(mut spec: CommandSpec, drvs: &[String], options: &BuildOptions) -> CommandSpec {
    spec = spec.arg("--realise");
    if options.keep_going {
        spec = spec.arg("--keep-going");
    }
    if options.check {
        spec = spec.arg("--check");
    }
    for (name, value) in &options.options {
        spec = spec.arg("--option").arg(name).arg(value);
    }
    spec.args(drvs)
}

fn last_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

#[async_trait]
impl BuildTool for NixCli {
    async fn instantiate(&self, target: &BuildTarget, cancel: &CancelToken) -> Result<String> {
        if target.is_drv_path() {
            return Ok(target.attr.clone());
        }
        let spec = self.instantiate_spec(target);
        let output = run(&spec, cancel).await?;
        if !output.success() {
            return Err(NixError::Instantiation {
                reason: output.stderr_tail(10),
            });
        }
        // `-A` on an output attribute prints `<drv>!out`.
        match last_line(&output.stdout) {
            Some(line) => {
                let drv = line.split('!').next().unwrap_or(line);
                Ok(drv.to_string())
            }
            None => Err(NixError::Instantiation {
                reason: "nix-instantiate printed no derivation".to_string(),
            }),
        }
    }

    async fn dry_run(&self, drvs: &[String], cancel: &CancelToken) -> Result<DryRun> {
        let spec = self
            .command("nix-store")
            .args(["--realise", "--dry-run"])
            .args(drvs);
        let output = run(&spec, cancel).await?.check(&spec)?;
        Ok(parse_dry_run(&output.stderr))
    }

    async fn references(&self, drv: &str, cancel: &CancelToken) -> Result<Vec<String>> {
        let spec = self
            .command("nix-store")
            .args(["--query", "--references"])
            .arg(drv);
        let output = run(&spec, cancel).await?.check(&spec)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| l.ends_with(".drv"))
            .map(str::to_string)
            .collect())
    }

    async fn build(
        &self,
        drvs: &[String],
        options: &BuildOptions,
        cancel: &CancelToken,
    ) -> Result<BuildReport> {
        let spec = realise_spec(self.command("nix-store"), drvs, options);
        log::info!("building {} derivation(s)", drvs.len());
        let output = run_streaming(&spec, cancel, |stream, line| match stream {
            Stream::Stdout => log::debug!("[nix] {line}"),
            Stream::Stderr => log::debug!("[nix!] {line}"),
        })
        .await?;
        let success = output.success();
        let outputs = if success {
            output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        Ok(BuildReport {
            success,
            outputs,
            failed: parse_failed_builds(&output.stderr),
            log: output.combined,
        })
    }

    async fn read_log(&self, drv: &str, cancel: &CancelToken) -> Result<Option<String>> {
        let spec = self.command("nix-store").arg("--read-log").arg(drv);
        let output = run(&spec, cancel).await?;
        if output.success() && !output.stdout.is_empty() {
            Ok(Some(output.stdout))
        } else {
            log::debug!("no stored log for {drv}");
            Ok(None)
        }
    }

    async fn is_valid(&self, paths: &[String], cancel: &CancelToken) -> Result<bool> {
        if paths.is_empty() {
            return Ok(true);
        }
        let spec = self.command("nix-store").arg("--check-validity").args(paths);
        Ok(run(&spec, cancel).await?.success())
    }

    fn add_root(&self, name: &str, target: &str) -> GcRoot {
        match GcRoot::register(&self.gcroots, name, Path::new(target)) {
            Ok(root) => root,
            Err(err) => {
                log::warn!("could not register gcroot for {target}: {err}");
                GcRoot::detached()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix_bisect_exec::PromptResponse;

    #[test]
    fn flake_config_questions_are_declined() {
        let table = nix_prompts().unwrap();
        let prompt = "do you want to allow configuration setting 'extra-substituters' to be set to 'https://cache.example' (y/N)?";
        assert_eq!(table.respond(prompt), Some(&PromptResponse::Reply("n".into())));
        let trust = "do you want to permanently mark this value as untrusted (y/N)?";
        assert_eq!(table.respond(trust), Some(&PromptResponse::Reply("n".into())));
        assert!(matches!(
            table.respond("[sudo] password for alice: "),
            Some(PromptResponse::Fail(_))
        ));
        assert_eq!(table.respond("building '/nix/store/x.drv'..."), None);
    }

    #[test]
    fn instantiate_passes_arguments_and_options() {
        let nix = NixCli::new("/src").unwrap();
        let target = BuildTarget::new("hello")
            .with_argstr("system", "x86_64-linux")
            .with_arg("config", "{}")
            .with_option("sandbox", "true");
        assert_eq!(
            nix.instantiate_spec(&target).display(),
            "nix-instantiate . -A hello --argstr system x86_64-linux --arg config {} --option sandbox true"
        );
    }

    #[test]
    fn realise_flags_follow_build_options() {
        let options = BuildOptions {
            keep_going: true,
            check: true,
            ..BuildOptions::default()
        };
        let spec = realise_spec(
            CommandSpec::new("nix-store"),
            &["/nix/store/a.drv".to_string()],
            &options,
        );
        assert_eq!(
            spec.display(),
            "nix-store --realise --keep-going --check /nix/store/a.drv"
        );
    }

    #[test]
    fn last_line_skips_trailing_blank_lines() {
        assert_eq!(
            last_line("warning: x\n/nix/store/a.drv!out\n\n"),
            Some("/nix/store/a.drv!out")
        );
        assert_eq!(last_line(""), None);
    }
}
