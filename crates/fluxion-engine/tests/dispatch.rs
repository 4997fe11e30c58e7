//! End-to-end dispatch through the file runtime.

use std::path::Path;
use std::sync::Arc;

use fluxion_engine::{FileRuntime, FluxionConfig, RuntimeRequest, RuntimeResponse};
use fluxion_pool::{ExecutorOptions, WorkerSpec, WorkerStrategy};

fn write_file(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
}

fn runtime_for(dir: &tempfile::TempDir) -> Arc<FileRuntime> {
    let config = FluxionConfig {
        dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    FileRuntime::new(&config).unwrap()
}

fn get(path: &str) -> RuntimeRequest {
    RuntimeRequest {
        method: "GET".to_string(),
        url: path.to_string(),
        path: path.to_string(),
        headers: Vec::new(),
        body: None,
        ip: "127.0.0.1".to_string(),
    }
}

fn handler_body(response: &RuntimeResponse) -> String {
    match response {
        RuntimeResponse::Handler { body, .. } => {
            String::from_utf8(body.clone().unwrap_or_default()).unwrap()
        }
        other => panic!("expected a handler response, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn index_wins_over_sibling_module() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "aaa/bb/cc/index.mjs",
        "export default (req, res) => res.end(\"from index\");",
    );
    write_file(
        dir.path(),
        "aaa/bb/cc.mjs",
        "export default (req, res) => res.end(\"from named module\");",
    );

    let runtime = runtime_for(&dir);
    let response = runtime.dispatch(get("/aaa/bb/cc")).await.unwrap();
    assert_eq!(handler_body(&response), "from index");
    runtime.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn underscore_trees_and_literal_sources_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "_lib/secret.mjs",
        "export default (req, res) => res.end(\"secret\");",
    );
    write_file(
        dir.path(),
        "echo.mjs",
        "export default (req, res) => res.end(\"echo\");",
    );

    let runtime = runtime_for(&dir);
    assert!(matches!(
        runtime.dispatch(get("/_lib/secret")).await.unwrap(),
        RuntimeResponse::NotFound
    ));
    assert!(matches!(
        runtime.dispatch(get("/echo.mjs")).await.unwrap(),
        RuntimeResponse::NotFound
    ));

    let snapshot = runtime.route_snapshot().unwrap();
    assert!(snapshot.handlers.iter().all(|h| !h.route.contains("_lib")));
    runtime.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn statics_serve_on_handler_miss() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "public/app.js", "console.log(1);");

    let runtime = runtime_for(&dir);
    let response = runtime.dispatch(get("/public/app.js")).await.unwrap();
    let RuntimeResponse::Static(file) = response else {
        panic!("expected a static response");
    };
    assert_eq!(file.content_type, "text/javascript; charset=utf-8");
    assert_eq!(file.content_length, 15);
    runtime.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rewrite_reloads_and_restarts_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "page.mjs",
        "export default (req, res) => res.end(\"v1\");",
    );

    let runtime = runtime_for(&dir);
    let first = runtime.dispatch(get("/page")).await.unwrap();
    assert_eq!(handler_body(&first), "v1");

    // Different size guarantees a different version token.
    write_file(
        dir.path(),
        "page.mjs",
        "export default (req, res) => res.end(\"v2 rewritten\");",
    );

    let second = runtime.dispatch(get("/page")).await.unwrap();
    assert_eq!(handler_body(&second), "v2 rewritten");

    let workers = runtime.worker_snapshot().await;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].status.restart_count, 1);
    runtime.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn broken_export_fails_then_recovers_after_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "page.mjs", "export default { broken: true };");

    let runtime = runtime_for(&dir);
    let err = runtime.dispatch(get("/page")).await.unwrap_err();
    assert!(err.to_string().contains("no callable default export"));

    write_file(
        dir.path(),
        "page.mjs",
        "export default (req, res) => res.end(\"fixed now\");",
    );
    let response = runtime.dispatch(get("/page")).await.unwrap();
    assert_eq!(handler_body(&response), "fixed now");
    runtime.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn handlers_land_on_the_minimal_satisfying_worker() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "small.mjs",
        r#"export default {
            db: ["db1"],
            handler: (req, res) => res.end("small"),
        };"#,
    );
    write_file(
        dir.path(),
        "wide.mjs",
        r#"export default {
            db: ["db1", "db2"],
            handler: (req, res) => res.end("wide"),
        };"#,
    );

    let config = FluxionConfig {
        dir: dir.path().to_path_buf(),
        databases: vec!["db1".to_string(), "db2".to_string()],
        worker_strategy: WorkerStrategy::Custom(vec![WorkerSpec {
            id: "w1".to_string(),
            db: vec!["db1".to_string()],
            overrides: Default::default(),
        }]),
        worker_options: ExecutorOptions::default(),
        ..Default::default()
    };
    let runtime = FileRuntime::new(&config).unwrap();

    let small = runtime.dispatch(get("/small")).await.unwrap();
    assert_eq!(handler_body(&small), "small");
    let wide = runtime.dispatch(get("/wide")).await.unwrap();
    assert_eq!(handler_body(&wide), "wide");

    let workers = runtime.worker_snapshot().await;
    assert_eq!(workers.len(), 2);

    let w1 = workers.iter().find(|w| w.id == "w1").unwrap();
    let fallback = workers.iter().find(|w| w.is_fallback_all_db).unwrap();
    assert_eq!(fallback.id, "fluxion-worker-all");
    assert_eq!(fallback.db_set, vec!["db1", "db2"]);

    // small.mjs ran on w1; wide.mjs needed both databases and ran on the
    // synthesized fallback. The fallback also carries inspect loads.
    assert!(w1
        .status
        .handlers
        .iter()
        .any(|h| h.file_path.ends_with("small.mjs")));
    assert!(fallback
        .status
        .handlers
        .iter()
        .any(|h| h.file_path.ends_with("wide.mjs")));
    runtime.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_dispatch_is_idempotent_for_pure_handlers() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "pure.mjs",
        r#"export default (req, res) => {
            res.setHeader("x-kind", "pure");
            res.end("same every time");
        };"#,
    );

    let runtime = runtime_for(&dir);
    let first = runtime.dispatch(get("/pure")).await.unwrap();
    let second = runtime.dispatch(get("/pure")).await.unwrap();

    let RuntimeResponse::Handler {
        status: s1,
        headers: h1,
        body: b1,
    } = first
    else {
        panic!("expected handler response");
    };
    let RuntimeResponse::Handler {
        status: s2,
        headers: h2,
        body: b2,
    } = second
    else {
        panic!("expected handler response");
    };
    assert_eq!(s1, s2);
    assert_eq!(h1, h2);
    assert_eq!(b1, b2);
    runtime.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn root_route_is_served_by_root_index() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "index.mjs",
        "export default (req, res) => res.end(\"root index\");",
    );

    let runtime = runtime_for(&dir);
    let response = runtime.dispatch(get("/")).await.unwrap();
    assert_eq!(handler_body(&response), "root index");

    let snapshot = runtime.route_snapshot().unwrap();
    assert_eq!(snapshot.handlers[0].route, "/");
    runtime.close().await;
}
