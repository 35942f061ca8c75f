use std::time::Duration;

use kiln_transform::CONSTRUCTOR_ERROR;

use crate::support::{
    eventually, init_tracing, next_report, reports, start, Behavior, CompilingLauncher,
    RecordingHost, Workspace,
};

#[tokio::test]
async fn requests_in_one_tick_share_a_session() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "", "");
    workspace.plugin("Beta", "", "");
    let launcher = CompilingLauncher::new(Behavior::default());
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher.clone(), host.clone());

    coordinator.request_compile("Beta");
    coordinator.request_compile("Alpha");

    let reports = reports(&mut rx, 2).await;
    assert!(reports.iter().all(|report| report.is_ok()), "{reports:?}");
    let modules: Vec<_> = reports.iter().map(|report| report.module.clone().unwrap()).collect();
    assert_eq!(modules[0], modules[1]);
    assert!(modules[0].starts_with("plugins_"));
    assert_eq!(launcher.launches(), 1);

    assert_eq!(launcher.jobs(), vec![vec!["Alpha.cs".to_owned(), "Beta.cs".to_owned()]]);
    assert!(coordinator.context().is_loaded("Alpha"));
    assert!(coordinator.context().is_loaded("Beta"));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn required_unit_is_folded_in_and_loaded_first() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "", "");
    workspace.plugin("Beta", "// Requires: Alpha", "");
    let launcher = CompilingLauncher::new(Behavior::default());
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher.clone(), host.clone());

    coordinator.request_compile("Beta");

    let first = next_report(&mut rx).await;
    let second = next_report(&mut rx).await;
    assert_eq!((first.unit.as_str(), second.unit.as_str()), ("Alpha", "Beta"));
    assert!(first.is_ok() && second.is_ok());
    assert_eq!(host.loaded_names(), vec!["Alpha", "Beta"]);
    assert_eq!(launcher.jobs().len(), 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn missing_dependency_fails_only_that_unit() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "// Requires: Ghost", "");
    workspace.plugin("Beta", "", "");
    let launcher = CompilingLauncher::new(Behavior::default());
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher.clone(), host.clone());

    coordinator.request_compile("Alpha");
    coordinator.request_compile("Beta");

    let reports = reports(&mut rx, 2).await;
    assert_eq!(reports[0].unit, "Alpha");
    assert_eq!(reports[0].error.as_deref(), Some("Missing dependency: Ghost"));
    assert!(reports[1].is_ok());
    assert_eq!(launcher.jobs(), vec![vec!["Beta.cs".to_owned()]]);
    assert_eq!(host.loaded_names(), vec!["Beta"]);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn compiler_errors_fail_the_whole_batch() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "", "#error broken on purpose");
    workspace.plugin("Beta", "", "");
    let launcher = CompilingLauncher::new(Behavior::default());
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher, host.clone());

    coordinator.request_compile("Alpha");
    coordinator.request_compile("Beta");

    let reports = reports(&mut rx, 2).await;
    assert_eq!(
        reports[0].error.as_deref(),
        Some("Failed to compile: #error: 'broken on purpose'")
    );
    assert!(reports[1]
        .error
        .as_deref()
        .is_some_and(|error| error.starts_with("Failed to compile")));
    assert!(host.loaded_names().is_empty());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn worker_failure_is_reported_for_every_unit() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "", "");
    workspace.plugin("Beta", "", "");
    let launcher = CompilingLauncher::new(Behavior {
        fail_with: Some("compiler process faulted".into()),
        ..Behavior::default()
    });
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher, host);

    coordinator.request_compile("Alpha");
    coordinator.request_compile("Beta");

    for report in reports(&mut rx, 2).await {
        assert_eq!(report.error.as_deref(), Some("compiler process faulted"));
    }
    let ctx = coordinator.context().clone();
    eventually(|| !ctx.is_loading("Alpha") && !ctx.is_loading("Beta")).await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn private_constructor_is_rejected_at_load() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "", "        private Alpha() { }");
    let launcher = CompilingLauncher::new(Behavior::default());
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher, host.clone());

    coordinator.request_compile("Alpha");

    let report = next_report(&mut rx).await;
    assert_eq!(report.error.as_deref(), Some(CONSTRUCTOR_ERROR));
    assert!(host.loaded_names().is_empty());
    assert!(!coordinator.context().is_loaded("Alpha"));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn refused_load_is_reported() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "", "");
    let launcher = CompilingLauncher::new(Behavior::default());
    let (host, mut rx) = RecordingHost::refusing(&["Alpha"]);
    let coordinator = start(&workspace, launcher, host);

    coordinator.request_compile("Alpha");

    let report = next_report(&mut rx).await;
    assert_eq!(report.error.as_deref(), Some("Host refused to load Alpha"));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn fresh_module_is_reused_and_edits_recompile() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "", "");
    let launcher = CompilingLauncher::new(Behavior::default());
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher.clone(), host.clone());

    coordinator.request_compile("Alpha");
    let first = next_report(&mut rx).await;
    assert!(first.is_ok());

    coordinator.request_compile("Alpha");
    let second = next_report(&mut rx).await;
    assert_eq!(second.module, first.module);
    assert_eq!(launcher.jobs().len(), 1);
    assert_eq!(host.unloaded_names(), vec!["Alpha"]);

    workspace.touch("Alpha");
    coordinator.request_compile("Alpha");
    let third = next_report(&mut rx).await;
    assert!(third.is_ok());
    assert_ne!(third.module, first.module);
    assert_eq!(launcher.jobs().len(), 2);
    assert_eq!(host.loaded_names(), vec!["Alpha", "Alpha", "Alpha"]);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn reload_while_loading_is_deferred() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "", "");
    let launcher = CompilingLauncher::new(Behavior {
        job_delay: Duration::from_millis(300),
        ..Behavior::default()
    });
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher.clone(), host.clone());

    coordinator.request_compile("Alpha");
    // Let the session reach the worker; a second request before that joins it.
    let jobs = launcher.clone();
    eventually(move || jobs.jobs().len() == 1).await;
    coordinator.request_compile("Alpha");

    assert!(next_report(&mut rx).await.is_ok());
    assert!(next_report(&mut rx).await.is_ok());
    // The deferred request found the module it was waiting for.
    assert_eq!(launcher.jobs().len(), 1);
    assert_eq!(host.loaded_names(), vec!["Alpha", "Alpha"]);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn unloading_cascades_to_dependents() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "", "");
    workspace.plugin("Beta", "// Requires: Alpha", "");
    workspace.plugin("Gamma", "", "");
    let launcher = CompilingLauncher::new(Behavior::default());
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher, host.clone());

    coordinator.request_compile("Beta");
    coordinator.request_compile("Gamma");
    reports(&mut rx, 3).await;

    coordinator.unloading("Alpha");
    eventually(|| host.unloaded_names() == vec!["Beta"]).await;
    let ctx = coordinator.context().clone();
    eventually(|| !ctx.is_loaded("Beta")).await;
    assert!(!ctx.is_loaded("Alpha"));
    assert!(ctx.is_loaded("Gamma"));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn include_change_rebuilds_referencing_units() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.include(
        "Ext.Discord",
        "namespace Oxide.Ext.Discord\n{\n    public static class DiscordApi\n    {\n    }\n}\n",
    );
    workspace.plugin("Alpha", "using Oxide.Ext.Discord;", "");
    workspace.plugin("Beta", "", "");
    let launcher = CompilingLauncher::new(Behavior::default());
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher.clone(), host);

    coordinator.request_compile("Alpha");
    coordinator.request_compile("Beta");
    assert!(reports(&mut rx, 2).await.iter().all(|report| report.is_ok()));
    assert_eq!(
        launcher.jobs(),
        vec![vec![
            "Ext.Discord.cs".to_owned(),
            "Alpha.cs".to_owned(),
            "Beta.cs".to_owned()
        ]]
    );

    coordinator.include_changed("Ext.Discord");
    let report = next_report(&mut rx).await;
    assert_eq!(report.unit, "Alpha");
    assert!(report.is_ok());
    assert_eq!(
        launcher.jobs()[1],
        vec!["Ext.Discord.cs".to_owned(), "Alpha.cs".to_owned()]
    );
    coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_are_served_while_a_unit_is_held() {
    init_tracing();
    let workspace = Workspace::new();
    workspace.plugin("Alpha", "// Requires: Beta", "");
    workspace.plugin("Beta", "", "");
    let launcher = CompilingLauncher::new(Behavior::default());
    let (host, mut rx) = RecordingHost::new();
    let coordinator = start(&workspace, launcher.clone(), host.clone());

    coordinator.request_compile("Alpha");
    assert!(reports(&mut rx, 2).await.iter().all(|report| report.is_ok()));

    // Stands in for a preparation stuck reading the script.
    let unit = coordinator.context().unit("Alpha");
    let held = unit.lock();
    coordinator.request_compile("Alpha");
    let report = next_report(&mut rx).await;
    drop(held);

    assert_eq!(report.unit, "Alpha");
    assert!(report.is_ok());
    assert_eq!(launcher.jobs().len(), 1);
    coordinator.shutdown().await;
}
