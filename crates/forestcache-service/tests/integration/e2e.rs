use std::sync::atomic::Ordering;

use forestcache_test::{Encoding, request, send_raw, setup, tempdir, write_json_artifact};
use serde_json::{Value, json};

use crate::utils::{CountingBackend, FakeMemory, spawn_server, test_config};

fn sample_profile() -> Value {
    json!({
        "meta": {"interpreter": "cpython"},
        "flamegraph": {"name": "main", "samples": 120, "children": [{"name": "work", "samples": 80}]},
        "memorygraph": {"samples": [[0, 1024], [1, 2048]]},
    })
}

fn jitlog() -> Value {
    json!({
        "meta": {"interpreter": "pypy"},
        "traces": [
            {"id": 7, "tree": {"ops": ["label", "jump"]}},
            {"id": 42, "tree": {"ops": ["guard_true", "int_add"]}, "bridges": [{"id": 43, "ops": ["finish"]}]},
        ],
    })
}

/// Splits off the `measures` block and checks its shape.
fn take_measures(document: &mut Value) -> Value {
    let measures = document
        .as_object_mut()
        .unwrap()
        .remove("measures")
        .expect("document without measures");

    for key in ["parsing", "json"] {
        let value = measures[key].as_str().unwrap();
        assert!(value.ends_with("ms"), "{key} = {value}");
        value.trim_end_matches("ms").parse::<f64>().unwrap();
    }
    assert!(measures["log (zip)"].as_str().unwrap().ends_with("MB"));

    measures
}

#[tokio::test]
async fn test_cpu_flamegraph() {
    setup();
    let dir = tempdir();
    let path = write_json_artifact(dir.path(), "sample", &sample_profile(), Encoding::Plain);

    let backend = CountingBackend::new();
    let parses = backend.parses();
    let server = spawn_server(test_config(u64::MAX), backend, FakeMemory::default()).await;

    let line = format!("cpu {} abc123", path.display());
    let mut document = request(server.addr, &line).await.unwrap();
    let measures = take_measures(&mut document);

    assert_eq!(
        document,
        json!({"name": "main", "samples": 120, "children": [{"name": "work", "samples": 80}]})
    );
    assert_eq!(measures["log (zip)"], "0.0MB");
    assert_eq!(parses.load(Ordering::SeqCst), 1);
    assert_eq!(server.cached(), 1);
}

#[tokio::test]
async fn test_mem_and_meta_views() {
    setup();
    let dir = tempdir();
    let path = write_json_artifact(dir.path(), "sample", &sample_profile(), Encoding::Plain);
    let server = spawn_server(
        test_config(u64::MAX),
        CountingBackend::new(),
        FakeMemory::default(),
    )
    .await;

    let mut document = request(server.addr, &format!("mem {} abc123", path.display()))
        .await
        .unwrap();
    take_measures(&mut document);
    assert_eq!(document, json!({"samples": [[0, 1024], [1, 2048]]}));

    // served from the profile cached by the previous request
    let mut document = request(server.addr, &format!("meta {} abc123", path.display()))
        .await
        .unwrap();
    take_measures(&mut document);
    assert_eq!(document, json!({"interpreter": "cpython", "kind": "profile"}));
}

#[tokio::test]
async fn test_gzip_trace() {
    setup();
    let dir = tempdir();
    let path = write_json_artifact(dir.path(), "log.jitlog", &jitlog(), Encoding::Gzip);
    assert!(path.to_string_lossy().ends_with("log.jitlog.zip"));

    let backend = CountingBackend::new();
    let parses = backend.parses();
    let server = spawn_server(test_config(u64::MAX), backend, FakeMemory::default()).await;

    let line = format!("trace {} deadbeef 42", path.display());
    let mut document = request(server.addr, &line).await.unwrap();
    take_measures(&mut document);

    assert_eq!(document, json!({"id": 42, "ops": ["guard_true", "int_add"]}));
    assert_eq!(parses.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bzip2_stitch() {
    setup();
    let dir = tempdir();
    let path = write_json_artifact(dir.path(), "log.jitlog", &jitlog(), Encoding::Bzip2);
    let server = spawn_server(
        test_config(u64::MAX),
        CountingBackend::new(),
        FakeMemory::default(),
    )
    .await;

    let line = format!("stitch {} deadbeef 42", path.display());
    let mut document = request(server.addr, &line).await.unwrap();
    take_measures(&mut document);

    assert_eq!(
        document,
        json!({
            "id": 42,
            "ops": ["guard_true", "int_add"],
            "bridges": [{"id": 43, "ops": ["finish"]}],
        })
    );
}

#[tokio::test]
async fn test_jitlog_meta_lists_traces() {
    setup();
    let dir = tempdir();
    let path = write_json_artifact(dir.path(), "log.jitlog", &jitlog(), Encoding::Plain);
    let server = spawn_server(
        test_config(u64::MAX),
        CountingBackend::new(),
        FakeMemory::default(),
    )
    .await;

    // an uncached meta request parses the file as a jitlog
    let line = format!("meta {} deadbeef", path.display());
    let mut document = request(server.addr, &line).await.unwrap();
    take_measures(&mut document);

    assert_eq!(
        document,
        json!({"interpreter": "pypy", "kind": "jitlog", "traces": [7, 42]})
    );
}

#[tokio::test]
async fn test_unknown_trace() {
    setup();
    let dir = tempdir();
    let path = write_json_artifact(dir.path(), "log.jitlog", &jitlog(), Encoding::Plain);

    let backend = CountingBackend::new();
    let parses = backend.parses();
    let server = spawn_server(test_config(u64::MAX), backend, FakeMemory::default()).await;

    let line = format!("trace {} deadbeef 999", path.display());
    assert_eq!(request(server.addr, &line).await, None);

    // the artifact was still parsed and cached
    assert_eq!(parses.load(Ordering::SeqCst), 1);
    assert_eq!(server.cached(), 1);
}

#[tokio::test]
async fn test_missing_view() {
    setup();
    let dir = tempdir();
    let artifact = json!({"meta": {"interpreter": "cpython"}});
    let path = write_json_artifact(dir.path(), "sample", &artifact, Encoding::Plain);

    let backend = CountingBackend::new();
    let parses = backend.parses();
    let server = spawn_server(test_config(u64::MAX), backend, FakeMemory::default()).await;

    assert_eq!(request(server.addr, &format!("cpu {} abc123", path.display())).await, None);
    assert_eq!(request(server.addr, &format!("mem {} abc123", path.display())).await, None);

    // the meta view always has the artifact kind
    let document = request(server.addr, &format!("meta {} abc123", path.display()))
        .await
        .unwrap();
    assert_eq!(document["kind"], "profile");

    assert_eq!(parses.load(Ordering::SeqCst), 1);
    assert_eq!(server.cached(), 1);
}

#[tokio::test]
async fn test_missing_file() {
    setup();
    let backend = CountingBackend::new();
    let parses = backend.parses();
    let server = spawn_server(test_config(u64::MAX), backend, FakeMemory::default()).await;

    assert_eq!(request(server.addr, "meta /nope/missing.log xyz").await, None);
    assert_eq!(parses.load(Ordering::SeqCst), 0);
    assert_eq!(server.cached(), 0);
}

#[tokio::test]
async fn test_malformed_lines() {
    setup();
    let dir = tempdir();
    let path = write_json_artifact(dir.path(), "sample", &sample_profile(), Encoding::Plain);

    let backend = CountingBackend::new();
    let parses = backend.parses();
    let server = spawn_server(test_config(u64::MAX), backend, FakeMemory::default()).await;

    let lines = [
        "bogus input".to_owned(),
        String::new(),
        format!("frob {} abc123", path.display()),
        format!("cpu {} abc123 42", path.display()),
        format!("trace {} abc123", path.display()),
        format!("trace {} abc123 forty-two", path.display()),
        format!("cpu {}  abc123", path.display()),
    ];
    for line in &lines {
        assert_eq!(request(server.addr, line).await, None, "{line:?}");
    }

    let mut invalid_utf8 = format!("cpu {}", path.display()).into_bytes();
    invalid_utf8.extend_from_slice(b" \xff\xfe\r\n");
    assert!(send_raw(server.addr, &invalid_utf8).await.is_empty());
    assert!(send_raw(server.addr, b"meta /tmp/\xc3( abc123\n").await.is_empty());

    assert_eq!(parses.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unterminated_and_overlong_lines() {
    setup();
    let dir = tempdir();
    let path = write_json_artifact(dir.path(), "sample", &sample_profile(), Encoding::Plain);

    let backend = CountingBackend::new();
    let parses = backend.parses();
    let mut config = test_config(u64::MAX);
    config.max_line_length = 1024;
    let server = spawn_server(config, backend, FakeMemory::default()).await;

    // the client goes away before finishing the line
    let line = format!("cpu {} abc123", path.display());
    assert!(send_raw(server.addr, line.as_bytes()).await.is_empty());

    let overlong = vec![b'a'; 4096];
    assert!(send_raw(server.addr, &overlong).await.is_empty());

    assert_eq!(parses.load(Ordering::SeqCst), 0);

    // a plain `\n` terminator is accepted as well
    let response = send_raw(server.addr, format!("{line}\n").as_bytes()).await;
    assert!(response.ends_with(b"\r\n"));
    assert_eq!(parses.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_artifact_size_measure() {
    setup();
    let dir = tempdir();
    // roughly 2.5 MiB, reported in whole MiB
    let padding = "x".repeat(5 * 512 * 1024);
    let artifact = json!({"flamegraph": {"name": "main"}, "meta": {"padding": padding}});
    let path = write_json_artifact(dir.path(), "large", &artifact, Encoding::Plain);

    let server = spawn_server(
        test_config(u64::MAX),
        CountingBackend::new(),
        FakeMemory::default(),
    )
    .await;

    let line = format!("cpu {} large", path.display());
    let mut document = request(server.addr, &line).await.unwrap();
    let measures = take_measures(&mut document);

    assert_eq!(document, json!({"name": "main"}));
    assert_eq!(measures["log (zip)"], "2.0MB");
}
