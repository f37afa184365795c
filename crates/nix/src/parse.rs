use crate::tool::DryRun;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Clone, Copy)]
enum Section {
    Build,
    Fetch,
}

/// Parse the stderr of `nix-store --realise --dry-run`.
///
/// Both the old ("these derivations will be built:") and the counted ("these
/// 3 derivations will be built:") headers are accepted. Lines outside the two
/// sections are ignored.
pub fn parse_dry_run(stderr: &str) -> DryRun {
    let mut plan = DryRun::default();
    let mut section = None;
    for line in stderr.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.contains("will be built") {
            section = Some(Section::Build);
        } else if line.contains("will be fetched") {
            section = Some(Section::Fetch);
        } else if line.starts_with('/') {
            match section {
                Some(Section::Build) => plan.to_build.push(line.to_string()),
                Some(Section::Fetch) => plan.to_fetch.push(line.to_string()),
                None => log::debug!("dry-run: store path outside a section: {line}"),
            }
        } else {
            log::debug!("dry-run: ignoring '{line}'");
        }
    }
    plan
}

fn failed_builder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:builder for|cached failure of) '([^']+\.drv)'")
            .unwrap_or_else(|err| unreachable!("static pattern: {err}"))
    })
}

/// Derivations whose builders failed, in log order, without duplicates.
///
/// `dependencies of derivation ... failed to build` lines name the parent,
/// not a failing builder, and are not included.
pub fn parse_failed_builds(log: &str) -> Vec<String> {
    let mut failed: Vec<String> = Vec::new();
    for caps in failed_builder_pattern().captures_iter(log) {
        let drv = &caps[1];
        if !failed.iter().any(|seen| seen == drv) {
            failed.push(drv.to_string());
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dry_run_splits_build_and_fetch_sections() {
        let stderr = "\
these 2 derivations will be built:
  /nix/store/aaaa-hello-2.12.drv
  /nix/store/bbbb-hello-wrapper.drv
these 3 paths will be fetched (1.20 MiB download, 5.61 MiB unpacked):
  /nix/store/cccc-glibc-2.39
  /nix/store/dddd-bash-5.2
  /nix/store/eeee-coreutils-9.4
";
        let plan = parse_dry_run(stderr);
        assert_eq!(
            plan.to_build,
            vec![
                "/nix/store/aaaa-hello-2.12.drv".to_string(),
                "/nix/store/bbbb-hello-wrapper.drv".to_string()
            ]
        );
        assert_eq!(plan.to_fetch.len(), 3);
    }

    #[test]
    fn dry_run_accepts_singular_headers_and_warnings() {
        let stderr = "\
warning: unknown setting 'experimental-features'
this derivation will be built:
  /nix/store/aaaa-hello-2.12.drv
";
        let plan = parse_dry_run(stderr);
        assert_eq!(plan.to_build, vec!["/nix/store/aaaa-hello-2.12.drv".to_string()]);
        assert!(plan.to_fetch.is_empty());
    }

    #[test]
    fn dry_run_of_valid_paths_is_empty() {
        assert_eq!(parse_dry_run(""), DryRun::default());
    }

    #[test]
    fn failed_builds_are_reported_in_log_order() {
        let log = "\
building '/nix/store/aaaa-zlib-1.3.drv'...
error: builder for '/nix/store/aaaa-zlib-1.3.drv' failed with exit code 2;
       last 10 log lines:
error: 1 dependencies of derivation '/nix/store/bbbb-curl-8.6.drv' failed to build
error: cached failure of '/nix/store/cccc-openssl-3.0.drv'
builder for '/nix/store/aaaa-zlib-1.3.drv' failed with exit code 2
";
        assert_eq!(
            parse_failed_builds(log),
            vec![
                "/nix/store/aaaa-zlib-1.3.drv".to_string(),
                "/nix/store/cccc-openssl-3.0.drv".to_string()
            ]
        );
    }
}
