use nix_bisect_exec::{run, run_streaming, CommandSpec, ExecError, ResponseTable, Stream};
use nix_bisect_protocol::CancelToken;
use std::time::{Duration, Instant};

#[tokio::test]
async fn captures_both_streams_and_exit_code() {
    let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
    let output = run(&spec, &CancelToken::new()).await.expect("run sh");
    assert_eq!(output.code, Some(3));
    assert_eq!(output.stdout, "out\n");
    assert_eq!(output.stderr, "err\n");
    assert!(output.combined.contains("out") && output.combined.contains("err"));
    assert!(output.check(&spec).is_err());
}

#[tokio::test]
async fn streams_lines_before_exit() {
    let spec = CommandSpec::new("sh").args(["-c", "echo one; echo two >&2; echo three"]);
    let mut seen = Vec::new();
    run_streaming(&spec, &CancelToken::new(), |stream, line| {
        seen.push((stream, line.to_string()));
    })
    .await
    .expect("run sh");
    assert!(seen.contains(&(Stream::Stdout, "one".to_string())));
    assert!(seen.contains(&(Stream::Stderr, "two".to_string())));
    assert!(seen.contains(&(Stream::Stdout, "three".to_string())));
}

#[tokio::test]
async fn answers_prompts_without_trailing_newline() {
    let table = ResponseTable::new()
        .reply(r"\(y/N\)\?\s*$", "n")
        .expect("pattern");
    let spec = CommandSpec::new("sh")
        .args([
            "-c",
            "printf \"allow setting 'substituters'? (y/N)? \" >&2; read answer; echo \"got $answer\"",
        ])
        .responses(table);
    let output = run(&spec, &CancelToken::new()).await.expect("run sh");
    assert!(output.success());
    assert_eq!(output.stdout.trim(), "got n");
    assert_eq!(output.answered.len(), 1);
}

#[tokio::test]
async fn unanswerable_prompts_terminate_the_child() {
    let table = ResponseTable::new()
        .fail(r"Username for", "credentials required")
        .expect("pattern");
    let spec = CommandSpec::new("sh")
        .args(["-c", "printf 'Username for https://example.org: ' >&2; sleep 30"])
        .responses(table);
    let started = Instant::now();
    let err = run(&spec, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, ExecError::Prompt { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test]
async fn cancellation_kills_long_running_child() {
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        remote.cancel();
    });
    let spec = CommandSpec::new("sleep").arg("30");
    let started = Instant::now();
    let err = run(&spec, &cancel).await.unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let spec = CommandSpec::new("nix-bisect-definitely-not-installed");
    let err = run(&spec, &CancelToken::new()).await.unwrap_err();
    assert!(err.is_spawn(), "{err}");
}
