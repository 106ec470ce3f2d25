mod common;

use assert_matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;

use common::{current_branch, git, head, on_branch, GitFixture};
use pushsync::{
    CredentialError, CredentialResolver, GitClient, RejectReason, RepositoryEntry, ScriptDelegate,
    ScriptResult, SyncEngine, SyncError, SyncOutcome, SyncSettings, SyncTicket,
    TriggerDispatcher, TriggerResponse,
};

/// Integration tests driving the engine against local bare remotes

#[tokio::test]
async fn test_missing_working_copy_is_cloned() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    let tip = fixture.push_commit("site", "main", "index.html", "v1");

    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let repo = registry.get("site").unwrap();

    let report = fixture.engine().sync(repo).await;

    assert_matches!(report.outcome, SyncOutcome::ClonedFresh { ref head } if *head == tip);
    assert_eq!(report.script, ScriptResult::NotConfigured);

    let path = fixture.working_copy("site");
    assert_eq!(head(&path), tip);
    assert_eq!(current_branch(&path), "main");
    assert_eq!(std::fs::read_to_string(path.join("index.html")).unwrap(), "v1");
}

#[tokio::test]
async fn test_second_sync_is_a_no_op() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    let tip = fixture.push_commit("site", "main", "index.html", "v1");

    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let repo = registry.get("site").unwrap();
    let engine = fixture.engine();

    engine.sync(repo).await;
    let path = fixture.working_copy("site");
    let before = std::fs::metadata(path.join("index.html")).unwrap().modified().unwrap();

    let report = engine.sync(repo).await;
    assert_matches!(report.outcome, SyncOutcome::AlreadyUpToDate { ref head } if *head == tip);

    let after = std::fs::metadata(path.join("index.html")).unwrap().modified().unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_new_remote_commit_discards_stray_file() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    let first = fixture.push_commit("site", "main", "index.html", "v1");

    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let repo = registry.get("site").unwrap();
    let engine = fixture.engine();
    engine.sync(repo).await;

    let path = fixture.working_copy("site");
    std::fs::write(path.join("stray.txt"), "left behind").unwrap();
    std::fs::write(path.join("index.html"), "edited in place").unwrap();
    let second = fixture.push_commit("site", "main", "index.html", "v2");

    let report = engine.sync(repo).await;

    assert_matches!(
        report.outcome,
        SyncOutcome::Updated { from: Some(ref from), ref to } if *from == first && *to == second
    );
    assert_eq!(head(&path), second);
    assert!(!path.join("stray.txt").exists());
    assert_eq!(std::fs::read_to_string(path.join("index.html")).unwrap(), "v2");
    assert_eq!(git(&path, &["status", "--porcelain"]), "");
}

#[tokio::test]
async fn test_diverged_local_commits_are_discarded() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    fixture.push_commit("site", "main", "index.html", "v1");

    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let repo = registry.get("site").unwrap();
    let engine = fixture.engine();
    engine.sync(repo).await;

    let path = fixture.working_copy("site");
    std::fs::write(path.join("local.txt"), "local work").unwrap();
    git(&path, &["add", "local.txt"]);
    git(&path, &["commit", "-q", "-m", "local divergence"]);
    let tip = fixture.push_commit("site", "main", "index.html", "v2");

    let report = engine.sync(repo).await;

    assert_matches!(report.outcome, SyncOutcome::Updated { .. });
    assert_eq!(head(&path), tip);
    assert!(!path.join("local.txt").exists());
}

#[tokio::test]
async fn test_non_default_branch_is_checked_out_after_clone() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    fixture.push_commit("site", "main", "index.html", "main");
    let release = fixture.push_commit("site", "release", "index.html", "release");

    let registry = fixture.registry(vec![("site", on_branch("release"))]);
    let repo = registry.get("site").unwrap();

    let report = fixture.engine().sync(repo).await;

    assert_matches!(report.outcome, SyncOutcome::ClonedFresh { .. });
    let path = fixture.working_copy("site");
    assert_eq!(current_branch(&path), "release");
    assert_eq!(head(&path), release);
    assert_eq!(
        git(&path, &["rev-parse", "--abbrev-ref", "release@{upstream}"]),
        "origin/release"
    );
}

#[tokio::test]
async fn test_working_copy_on_other_branch_is_switched() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    fixture.push_commit("site", "main", "index.html", "main");
    fixture.push_commit("site", "release", "index.html", "release v1");

    let registry = fixture.registry(vec![("site", on_branch("release"))]);
    let repo = registry.get("site").unwrap();
    let engine = fixture.engine();
    engine.sync(repo).await;

    let path = fixture.working_copy("site");
    git(&path, &["checkout", "-q", "main"]);
    let tip = fixture.push_commit("site", "release", "index.html", "release v2");

    let report = engine.sync(repo).await;

    assert_matches!(report.outcome, SyncOutcome::Updated { .. });
    assert_eq!(current_branch(&path), "release");
    assert_eq!(head(&path), tip);
}

#[tokio::test]
async fn test_detached_head_at_remote_tip_is_put_back_on_branch() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    let tip = fixture.push_commit("site", "main", "index.html", "v1");

    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let repo = registry.get("site").unwrap();
    let engine = fixture.engine();
    engine.sync(repo).await;

    let path = fixture.working_copy("site");
    git(&path, &["checkout", "-q", "--detach"]);
    assert_eq!(head(&path), tip);

    let report = engine.sync(repo).await;

    assert_matches!(report.outcome, SyncOutcome::Updated { ref to, .. } if *to == tip);
    assert_eq!(current_branch(&path), "main");

    // Back on the branch, the next run has nothing to do
    let report = engine.sync(repo).await;
    assert_matches!(report.outcome, SyncOutcome::AlreadyUpToDate { .. });
}

#[tokio::test]
async fn test_missing_branch_fails_and_cleans_up() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    fixture.push_commit("site", "main", "index.html", "v1");

    let registry = fixture.registry(vec![("site", on_branch("ghost"))]);
    let repo = registry.get("site").unwrap();

    let report = fixture.engine().sync(repo).await;

    assert_matches!(
        report.outcome,
        SyncOutcome::Failed(SyncError::ReferenceNotFound { ref reference })
            if reference == "refs/remotes/origin/ghost"
    );
    assert!(!fixture.working_copy("site").exists());
}

#[tokio::test]
async fn test_unreachable_remote_is_a_network_failure() {
    let fixture = GitFixture::new();
    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let repo = registry.get("site").unwrap();

    let report = fixture.engine().sync(repo).await;

    assert_matches!(report.outcome, SyncOutcome::Failed(SyncError::Network { .. }));
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_missing_key_fails_before_any_git_command() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    fixture.push_commit("site", "main", "index.html", "v1");

    let entry = RepositoryEntry {
        branch: Some("main".to_string()),
        key: Some("deploy_site".to_string()),
        ..Default::default()
    };
    let registry = fixture.registry(vec![("site", entry)]);
    let repo = registry.get("site").unwrap();

    let report = fixture.engine().sync(repo).await;

    assert_matches!(
        report.outcome,
        SyncOutcome::Failed(SyncError::Auth(CredentialError::KeyNotFound { .. }))
    );
    assert!(!fixture.working_copy("site").exists());
}

#[tokio::test]
async fn test_stale_directory_is_replaced_by_clone() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    let tip = fixture.push_commit("site", "main", "index.html", "v1");

    let path = fixture.working_copy("site");
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("leftover.html"), "old deploy").unwrap();

    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let report = fixture.engine().sync(registry.get("site").unwrap()).await;

    assert_matches!(report.outcome, SyncOutcome::ClonedFresh { .. });
    assert_eq!(head(&path), tip);
    assert!(!path.join("leftover.html").exists());
}

#[tokio::test]
async fn test_changed_remote_url_is_reconciled() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    fixture.push_commit("site", "main", "index.html", "v1");

    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let engine = fixture.engine();
    engine.sync(registry.get("site").unwrap()).await;

    // Same history, new location
    fixture.create_remote("mirror");
    let mirror = fixture.remote("mirror");
    git(
        &fixture.working_copy("site"),
        &["push", "-q", mirror.to_str().unwrap(), "HEAD:refs/heads/main"],
    );
    let entry = RepositoryEntry {
        branch: Some("main".to_string()),
        remote_path: Some(mirror.display().to_string()),
        ..Default::default()
    };
    let moved = fixture.registry(vec![("site", entry)]);

    let report = engine.sync(moved.get("site").unwrap()).await;

    assert_matches!(report.outcome, SyncOutcome::AlreadyUpToDate { .. });
    let origin = git(&fixture.working_copy("site"), &["remote", "get-url", "origin"]);
    assert_eq!(origin, mirror.display().to_string());
}

#[tokio::test]
async fn test_successful_script_skips_internal_sync() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    fixture.push_commit("site", "main", "index.html", "v1");
    let marker = fixture.path().join("marker");
    fixture.write_script(
        "deploy.sh",
        &format!("echo \"$REPOS $BRANCH $WORK_PATH\" > {}\n", marker.display()),
    );

    let entry = RepositoryEntry {
        branch: Some("main".to_string()),
        script: Some("deploy.sh".to_string()),
        ..Default::default()
    };
    let registry = fixture.registry(vec![("site", entry)]);

    let report = fixture.engine().sync(registry.get("site").unwrap()).await;

    assert_matches!(report.outcome, SyncOutcome::DelegatedToScript);
    assert_matches!(report.script, ScriptResult::Success { .. });
    assert!(!fixture.working_copy("site").exists());
    assert_eq!(
        std::fs::read_to_string(&marker).unwrap().trim(),
        format!("site main {}", fixture.working_copy("site").display())
    );
}

#[tokio::test]
async fn test_failed_script_falls_back_to_internal_sync() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    let tip = fixture.push_commit("site", "main", "index.html", "v1");
    fixture.write_script("deploy.sh", "echo broken deploy\nexit 2\n");

    let entry = RepositoryEntry {
        branch: Some("main".to_string()),
        script: Some("deploy.sh".to_string()),
        ..Default::default()
    };
    let registry = fixture.registry(vec![("site", entry)]);

    let report = fixture.engine().sync(registry.get("site").unwrap()).await;

    assert_matches!(report.script, ScriptResult::Failure { status: Some(2), .. });
    assert_matches!(report.outcome, SyncOutcome::ClonedFresh { ref head } if *head == tip);
}

#[tokio::test]
async fn test_missing_script_falls_back_to_internal_sync() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    fixture.push_commit("site", "main", "index.html", "v1");

    let entry = RepositoryEntry {
        branch: Some("main".to_string()),
        script: Some("nowhere.sh".to_string()),
        ..Default::default()
    };
    let registry = fixture.registry(vec![("site", entry)]);

    let report = fixture.engine().sync(registry.get("site").unwrap()).await;

    assert_matches!(report.script, ScriptResult::NotFound { .. });
    assert_matches!(report.outcome, SyncOutcome::ClonedFresh { .. });
}

#[tokio::test]
async fn test_slow_script_times_out() {
    let fixture = GitFixture::new();
    fixture.write_script("slow.sh", "sleep 10\n");

    let entry = RepositoryEntry {
        script: Some("slow.sh".to_string()),
        ..Default::default()
    };
    let registry = fixture.registry(vec![("site", entry)]);

    let config = fixture.config();
    let credentials = CredentialResolver::from_config(&config);
    let engine = SyncEngine::new(
        GitClient::new(),
        credentials.clone(),
        ScriptDelegate::from_config(&config, credentials),
        SyncSettings {
            timeout: Duration::from_secs(1),
            ..SyncSettings::from_config(&config)
        },
    );

    let report = engine.sync(registry.get("site").unwrap()).await;

    assert_matches!(report.outcome, SyncOutcome::Failed(SyncError::Timeout(1)));
    assert!(report.duration < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_triggers_serialize() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    let tip = fixture.push_commit("site", "main", "index.html", "v1");

    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let repo = registry.get("site").unwrap().clone();
    let engine = Arc::new(fixture.engine());

    let first = tokio::spawn({
        let engine = engine.clone();
        let repo = repo.clone();
        async move { engine.sync(&repo).await }
    });
    let second = tokio::spawn({
        let engine = engine.clone();
        let repo = repo.clone();
        async move { engine.sync(&repo).await }
    });

    let mut outcomes = vec![first.await.unwrap().outcome, second.await.unwrap().outcome];
    outcomes.sort_by_key(|o| matches!(o, SyncOutcome::AlreadyUpToDate { .. }));

    assert_matches!(outcomes[0], SyncOutcome::ClonedFresh { .. });
    assert_matches!(outcomes[1], SyncOutcome::AlreadyUpToDate { .. });
    assert_eq!(head(&fixture.working_copy("site")), tip);
}

#[tokio::test]
async fn test_dispatcher_accepts_matching_push() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    let tip = fixture.push_commit("site", "main", "index.html", "v1");

    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let dispatcher = TriggerDispatcher::from_config(&fixture.config(), registry);

    let ticket = match dispatcher.on_push_event("site", "refs/heads/main") {
        TriggerResponse::Accepted(ticket) => ticket,
        other => panic!("expected accepted, got {other:?}"),
    };
    assert_eq!(ticket.repository(), "site");

    let report = ticket.wait().await.unwrap();
    assert_matches!(report.outcome, SyncOutcome::ClonedFresh { ref head } if *head == tip);
}

#[tokio::test]
async fn test_dispatcher_ignores_other_branches() {
    let fixture = GitFixture::new();
    fixture.create_remote("site");
    fixture.push_commit("site", "main", "index.html", "v1");

    let registry = fixture.registry(vec![("site", on_branch("main"))]);
    let dispatcher = TriggerDispatcher::from_config(&fixture.config(), registry);

    let response = dispatcher.on_push_event("site", "refs/heads/feature");
    assert_matches!(response, TriggerResponse::Rejected(RejectReason::WrongBranch { .. }));

    let response = dispatcher.on_push_event("blog", "refs/heads/main");
    assert_matches!(response, TriggerResponse::Rejected(RejectReason::NotRegistered));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!fixture.working_copy("site").exists());
}

#[tokio::test]
async fn test_sync_all_updates_every_repository() {
    let fixture = GitFixture::new();
    for name in ["site", "docs", "api"] {
        fixture.create_remote(name);
        fixture.push_commit(name, "main", "README", name);
    }

    let registry = fixture.registry(vec![
        ("site", on_branch("main")),
        ("docs", on_branch("main")),
        ("api", on_branch("ghost")),
    ]);
    let dispatcher = TriggerDispatcher::from_config(&fixture.config(), registry);

    let summary = dispatcher.sync_all().await;

    assert_eq!(summary.total_repositories, 3);
    assert_eq!(summary.successful_operations, 2);
    assert_eq!(summary.failed_operations, 1);
    assert!(fixture.working_copy("site").join("README").exists());
    assert!(fixture.working_copy("docs").join("README").exists());
}

fn accepted(response: TriggerResponse) -> SyncTicket {
    match response {
        TriggerResponse::Accepted(ticket) => ticket,
        other => panic!("expected accepted, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queued_triggers_leave_room_for_other_repositories() {
    let fixture = GitFixture::new();
    fixture.write_script("slow.sh", "sleep 2\n");
    fixture.write_script("fast.sh", "true\n");

    let scripted = |script: &str| RepositoryEntry {
        branch: Some("main".to_string()),
        script: Some(script.to_string()),
        ..Default::default()
    };
    let registry = fixture.registry(vec![("a", scripted("slow.sh")), ("b", scripted("fast.sh"))]);
    let mut config = fixture.config();
    config.sync.max_parallel = 2;
    let dispatcher = TriggerDispatcher::from_config(&config, registry);

    // One run of `a` works, the other waits for the working copy
    let first = accepted(dispatcher.on_push_event("a", "refs/heads/main"));
    let second = accepted(dispatcher.on_push_event("a", "refs/heads/main"));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = std::time::Instant::now();
    let report = accepted(dispatcher.on_push_event("b", "refs/heads/main"))
        .wait()
        .await
        .unwrap();

    assert_matches!(report.outcome, SyncOutcome::DelegatedToScript);
    assert!(
        start.elapsed() < Duration::from_secs(1),
        "b waited {:?} behind a",
        start.elapsed()
    );

    for ticket in [first, second] {
        let report = ticket.wait().await.unwrap();
        assert_matches!(report.outcome, SyncOutcome::DelegatedToScript);
    }
}
