#![cfg(unix)]

mod test_utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use latex_runtime::backends::{ContainerBackend, InProcessBackend};
use latex_runtime::{
    BackendError, BackendKind, CompilationBackend, CompilationRequest, CompilerRouter,
    EngineLifecycleManager, EngineState, EngineVariant, FileKind, PositionMapBuilder, ProjectFile,
    RuntimeConfig, WorkbenchRuntime,
};
use tempfile::TempDir;
use test_utils::{FAKE_CONTAINER, HELLO, create_dummy_executable, init_logging};

async fn fake_container(dir: &TempDir) -> ContainerBackend {
    let runtime = create_dummy_executable(dir.path(), "fake-docker", FAKE_CONTAINER).await;
    ContainerBackend::new(Some(runtime), Some("texlive:test".to_string()))
}

#[tokio::test]
async fn container_compile_reads_pdf_log_and_synctex() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let backend = fake_container(&dir).await;

    let result = backend.compile(&CompilationRequest::single(HELLO)).await.unwrap();

    assert!(result.success, "log: {:?}", result.log);
    assert_eq!(result.backend, Some(BackendKind::Container));
    assert!(result.output().unwrap().starts_with(b"%PDF"));
    assert!(result.log.iter().any(|l| l.starts_with("Output written on main.pdf")));

    let map = PositionMapBuilder::default().build("main.tex", HELLO, 1, result.synctex.as_deref());
    assert!(!map.is_heuristic());
    assert_eq!(map.entries()[0].source.file, "/workdir/main.tex");
    assert_eq!(map.entries()[0].source.line, 3);
}

#[tokio::test]
async fn container_document_error_is_line_anchored() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let backend = fake_container(&dir).await;

    let source = "\\documentclass{article}\n\\begin{document}\n\\FAIL\n\\end{document}";
    let request = CompilationRequest::single(source);
    let result = backend.compile(&request).await.unwrap();

    assert!(!result.success);
    assert!(result.output().is_none());
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].line, Some(3));
    assert_eq!(result.errors[0].file.as_deref(), Some("main.tex"));
}

#[tokio::test]
async fn missing_runtime_is_unavailable() {
    let backend = ContainerBackend::new(Some(PathBuf::from("/nonexistent/bin/docker")), None);
    let err = backend.compile(&CompilationRequest::single(HELLO)).await.unwrap_err();
    assert!(matches!(err, BackendError::Unavailable(_)), "{:?}", err);
}

#[tokio::test]
async fn daemon_failure_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let runtime = create_dummy_executable(
        dir.path(),
        "broken-docker",
        "#!/bin/sh\necho 'Cannot connect to the Docker daemon' >&2\nexit 125\n",
    )
    .await;
    let backend = ContainerBackend::new(Some(runtime), None);

    let err = backend.compile(&CompilationRequest::single(HELLO)).await.unwrap_err();
    match err {
        BackendError::Unavailable(message) => assert!(message.contains("Docker daemon")),
        other => panic!("expected Unavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn slow_container_times_out() {
    let dir = TempDir::new().unwrap();
    let runtime = create_dummy_executable(dir.path(), "slow-docker", "#!/bin/sh\nsleep 5\n").await;
    let backend = ContainerBackend::new(Some(runtime), None);

    let request = CompilationRequest::single(HELLO).with_timeout(Duration::from_millis(200));
    let err = backend.compile(&request).await.unwrap_err();
    assert!(matches!(err, BackendError::Timeout(t) if t == Duration::from_millis(200)));
}

#[tokio::test]
async fn project_paths_may_not_escape() {
    let dir = TempDir::new().unwrap();
    let backend = fake_container(&dir).await;
    let request = CompilationRequest::project(
        vec![
            ProjectFile::new("main.tex", HELLO, FileKind::Tex),
            ProjectFile::new("../escape.tex", "x", FileKind::Tex),
        ],
        "main.tex",
    );
    assert!(matches!(backend.compile(&request).await, Err(BackendError::Unsupported(_))));
}

#[tokio::test]
async fn includegraphics_is_routed_to_the_container() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let engines = Arc::new(EngineLifecycleManager::default());
    let backends: Vec<Arc<dyn CompilationBackend>> = vec![
        Arc::new(InProcessBackend::new(Arc::clone(&engines))),
        Arc::new(fake_container(&dir).await),
    ];
    let router = CompilerRouter::new(backends);

    let request = CompilationRequest::project(
        vec![
            ProjectFile::new(
                "main.tex",
                concat!(
                    "\\documentclass{article}\n\\usepackage{graphicx}\n\\begin{document}\n",
                    "\\includegraphics{cow.png}\n\\end{document}",
                ),
                FileKind::Tex,
            ),
            ProjectFile::new("cow.png", "iVBORw0KGgo=", FileKind::Image),
        ],
        "main.tex",
    );
    let result = router.route_compile(&request).await;

    assert!(result.success, "log: {:?}", result.log);
    assert_eq!(result.backend, Some(BackendKind::Container));
    assert_eq!(result.attempted, vec![BackendKind::Container]);
    assert_eq!(engines.state(EngineVariant::PdfTex), EngineState::Uninitialized);
    assert!(result.log.iter().any(|l| l.contains("skipping in-process engine")));
}

#[tokio::test]
async fn runtime_prefers_synctex_positions() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let engines = Arc::new(EngineLifecycleManager::default());
    let backends: Vec<Arc<dyn CompilationBackend>> = vec![Arc::new(fake_container(&dir).await)];
    let router = CompilerRouter::new(backends);
    let runtime = WorkbenchRuntime::new_with_router(RuntimeConfig::default(), router, engines);

    runtime.open_document("paper".into(), HELLO.into()).unwrap();
    let result = runtime.compile_document("paper").await.unwrap();
    assert!(result.success);

    let map = runtime.position_map("paper").unwrap();
    assert!(!map.is_heuristic());

    // one inch right of the TeX origin on a 612bp wide page
    let out = runtime.source_to_output("paper", 3, None).unwrap().unwrap();
    assert_eq!(out.page, 1);
    assert!((out.x - 144.0 / 612.0).abs() < 1e-3);

    let back = runtime.output_to_source("paper", 1, out.x, out.y).unwrap().unwrap();
    assert_eq!(back.line, 3);
}
