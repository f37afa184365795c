use nix_bisect_git::memory::MemoryVcs;
use nix_bisect_git::{ApplyResult, Patch, PatchError, PatchsetManager, Vcs};
use nix_bisect_protocol::Revision;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn rev(id: &str) -> Revision {
    Revision::new(id)
}

#[tokio::test]
async fn tree_is_restored_after_the_body() {
    let vcs = Arc::new(MemoryVcs::linear(6, "/tmp/unused"));
    vcs.modify("pkgs/top-level/all-packages.nix", "local edit");
    let before = vcs.fingerprint();
    let manager = PatchsetManager::new(vcs.clone());

    let patches = vec![Patch::new(rev("c4")), Patch::new(rev("c1"))];
    let applied = manager
        .with_patches(&rev("c2"), &patches, |applied| async move { applied })
        .await
        .unwrap();

    assert_eq!(applied.applied(), vec![rev("c4")]);
    assert_eq!(applied.result_for(&rev("c1")), Some(&ApplyResult::AlreadyApplied));
    assert_eq!(vcs.fingerprint(), before);
    assert_eq!(vcs.checkouts(), vec![rev("c2")]);
}

#[tokio::test]
async fn conflicting_patches_are_skipped() {
    let vcs = Arc::new(MemoryVcs::linear(6, "/tmp/unused"));
    vcs.conflict_on(&rev("c5"));
    let manager = PatchsetManager::new(vcs.clone());

    let applied = manager
        .with_patches(&rev("c1"), &[Patch::new(rev("c5"))], |applied| async move {
            applied
        })
        .await
        .unwrap();
    assert!(applied.applied().is_empty());
    assert_eq!(applied.failed().count(), 1);
}

#[tokio::test]
async fn failed_mandatory_patch_skips_the_body_and_restores() {
    let vcs = Arc::new(MemoryVcs::linear(6, "/tmp/unused"));
    vcs.conflict_on(&rev("c5"));
    let before = vcs.fingerprint();
    let manager = PatchsetManager::new(vcs.clone());

    let mut ran = false;
    let result = manager
        .with_patches(&rev("c1"), &[Patch::new(rev("c5")).mandatory()], |_| {
            ran = true;
            async {}
        })
        .await;
    assert!(matches!(result, Err(PatchError::MandatoryPatch { .. })));
    assert!(!ran);
    assert_eq!(vcs.fingerprint(), before);
}

#[tokio::test]
async fn body_errors_still_restore() {
    let vcs = Arc::new(MemoryVcs::linear(3, "/tmp/unused"));
    let before = vcs.fingerprint();
    let manager = PatchsetManager::new(vcs.clone());

    let result: Result<Result<(), String>, PatchError> = manager
        .with_patches(&rev("c0"), &[], |_| async { Err("build exploded".to_string()) })
        .await;
    assert_eq!(result.unwrap(), Err("build exploded".to_string()));
    assert_eq!(vcs.fingerprint(), before);
    assert_eq!(vcs.head().await.unwrap(), rev("c2"));
}

#[tokio::test]
async fn restore_failure_is_fatal() {
    let vcs = Arc::new(MemoryVcs::linear(3, "/tmp/unused"));
    vcs.fail_restore(true);
    let manager = PatchsetManager::new(vcs.clone());

    let result = manager.with_patches(&rev("c0"), &[], |_| async {}).await;
    let err = result.unwrap_err();
    assert!(matches!(err, PatchError::TreeRestore { .. }));
    assert!(err.is_fatal());
}
