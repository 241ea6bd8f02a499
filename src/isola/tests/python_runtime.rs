//! End-to-end tests against a built Python runtime bundle.
//!
//! These need the WASI interpreter image; set `ISOLA_PYTHON_RUNTIME` to a
//! directory containing `python3.wasm` (or `bin/python3.wasm`) with its
//! library tree next to it. Without it every test here skips, the same way
//! the SDK test-suite skips without a runtime build.

#![allow(clippy::disallowed_macros)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use isola::{
    Context, ContextPatch, Event, EventKind, HttpBody, HttpRequest, HttpResponse, IsolaError,
    RunArg, RunResult, Sandbox, SandboxPatch,
};
use serde_json::json;

const FETCH_SCRIPT: &str = "\
from sandbox.http import fetch

def main(url):
\twith fetch('GET', url) as resp:
\t\tdata = b''.join(resp.iter_bytes())
\t\treturn [resp.status, resp.headers.get('x-test'), data.decode()]
";

fn runtime_paths() -> Option<(PathBuf, PathBuf)> {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });

    let runtime_dir = match std::env::var_os("ISOLA_PYTHON_RUNTIME") {
        Some(dir) => PathBuf::from(dir),
        None => {
            eprintln!("skipping: ISOLA_PYTHON_RUNTIME is not set");
            return None;
        }
    };
    let lib_dir = runtime_dir.join("lib");
    if !lib_dir.is_dir() {
        eprintln!("skipping: missing runtime libs at '{}'", lib_dir.display());
        return None;
    }
    Some((runtime_dir, lib_dir))
}

async fn started_sandbox(timeout_secs: f64) -> Option<(Context, Sandbox)> {
    let (runtime_dir, lib_dir) = runtime_paths()?;
    let context = Context::new();
    context
        .configure(
            ContextPatch::default()
                .max_memory(64 * 1024 * 1024)
                .runtime_lib_dir(lib_dir),
        )
        .unwrap();
    context.initialize_template(runtime_dir).await.unwrap();

    let sandbox = context.instantiate().await.unwrap();
    sandbox
        .configure(SandboxPatch::default().timeout_secs(timeout_secs))
        .unwrap();
    sandbox.start().await.unwrap();
    Some((context, sandbox))
}

#[tokio::test(flavor = "multi_thread")]
async fn arithmetic_returns_final_value() {
    let Some((context, sandbox)) = started_sandbox(5.0).await else {
        return;
    };
    sandbox
        .load_script("def add(a, b):\n\treturn a + b\n")
        .await
        .unwrap();

    let result = sandbox
        .run("add", vec![json!(1).into(), json!(2).into()])
        .await
        .unwrap();
    assert_eq!(
        result,
        RunResult {
            final_value: Some(json!(3)),
            ..RunResult::default()
        }
    );

    sandbox.close().await;
    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn generator_yields_results_without_final() {
    let Some((context, sandbox)) = started_sandbox(5.0).await else {
        return;
    };
    sandbox
        .load_script("def stream_values(n):\n\tfor i in range(n):\n\t\tyield i\n")
        .await
        .unwrap();

    let result = sandbox
        .run("stream_values", vec![json!(3).into()])
        .await
        .unwrap();
    assert_eq!(result.results, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(result.final_value, None);

    sandbox.close().await;
    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn run_stream_yields_stdout_and_end() {
    let Some((context, sandbox)) = started_sandbox(5.0).await else {
        return;
    };
    sandbox
        .load_script("def emit():\n\tprint('hello')\n\treturn 7\n")
        .await
        .unwrap();

    let events: Vec<Event> = sandbox
        .run_stream("emit", Vec::new())
        .await
        .unwrap()
        .collect()
        .await;

    assert!(!events.is_empty());
    assert!(
        events
            .iter()
            .any(|e| e.kind == EventKind::Stdout
                && e.data.as_deref().is_some_and(|d| d.starts_with("hello")))
    );
    let ends: Vec<_> = events.iter().filter(|e| e.kind == EventKind::End).collect();
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].data.as_deref(), Some("7"));

    // Property 1: the streamed events aggregate to the run result.
    let aggregated = RunResult::from_events(events).unwrap();
    assert_eq!(aggregated.final_value, Some(json!(7)));

    sandbox.close().await;
    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stalling_call_times_out() {
    let Some((context, sandbox)) = started_sandbox(0.001).await else {
        return;
    };
    sandbox
        .load_script(
            "from sandbox.asyncio import sleep\n\nasync def stall():\n\tawait sleep(3600)\n",
        )
        .await
        .unwrap();

    let err = sandbox.run("stall", Vec::new()).await.unwrap_err();
    assert!(
        matches!(err, IsolaError::DeadlineExceeded),
        "expected a timeout, got {err:?}"
    );
    assert!(sandbox.poisoned().await);

    sandbox.close().await;
    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn http_handler_bytes_response_shape() {
    let Some((context, sandbox)) = started_sandbox(5.0).await else {
        return;
    };
    sandbox.set_http_handler(|_request: HttpRequest| async {
        Ok(HttpResponse {
            status: 201,
            headers: HashMap::from([
                ("content-type".to_string(), "text/plain".to_string()),
                ("x-test".to_string(), "bytes".to_string()),
            ]),
            body: HttpBody::Bytes(Bytes::from_static(b"ok")),
        })
    });
    sandbox.load_script(FETCH_SCRIPT).await.unwrap();

    let result = sandbox
        .run("main", vec![json!("https://example.test/bytes").into()])
        .await
        .unwrap();
    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    assert_eq!(result.final_value, Some(json!([201, "bytes", "ok"])));

    sandbox.close().await;
    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn http_handler_chunked_response_shape() {
    let Some((context, sandbox)) = started_sandbox(5.0).await else {
        return;
    };
    sandbox.set_http_handler(|request: HttpRequest| async move {
        assert_eq!(request.method, "GET");
        assert_eq!(request.url, "https://example.test/stream");
        let chunks = futures::stream::iter([
            Ok(Bytes::from_static(b"a")),
            Ok(Bytes::from_static(b"b")),
        ]);
        Ok(HttpResponse {
            status: 200,
            headers: HashMap::from([
                ("content-type".to_string(), "text/plain".to_string()),
                ("x-test".to_string(), "stream".to_string()),
            ]),
            body: HttpBody::from_chunks(chunks),
        })
    });
    sandbox.load_script(FETCH_SCRIPT).await.unwrap();

    let result = sandbox
        .run("main", vec![json!("https://example.test/stream").into()])
        .await
        .unwrap();
    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    assert_eq!(result.final_value, Some(json!([200, "stream", "ab"])));

    sandbox.close().await;
    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_argument_is_iterated_in_order() {
    let Some((context, sandbox)) = started_sandbox(5.0).await else {
        return;
    };
    sandbox
        .load_script(
            "def total(items):\n\tacc = 0\n\tfor item in items:\n\t\tacc += item\n\treturn acc\n",
        )
        .await
        .unwrap();

    let values = RunArg::stream_from(futures::stream::iter([1, 2, 3, 4]), 2).unwrap();
    let result = sandbox.run("total", vec![values]).await.unwrap();
    assert_eq!(result.final_value, Some(json!(10)));

    sandbox.close().await;
    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn named_arguments_bind_as_keywords() {
    let Some((context, sandbox)) = started_sandbox(5.0).await else {
        return;
    };
    sandbox
        .load_script("def add(a, b, c=1):\n\treturn a + b * c\n")
        .await
        .unwrap();

    let result = sandbox
        .run(
            "add",
            vec![
                RunArg::named("c", &5).unwrap(),
                json!(2).into(),
                json!(3).into(),
            ],
        )
        .await
        .unwrap();
    assert_eq!(result.final_value, Some(json!(17)));

    sandbox.close().await;
    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn guest_exception_surfaces_as_guest_abort() {
    let Some((context, sandbox)) = started_sandbox(5.0).await else {
        return;
    };
    sandbox
        .load_script("def boom(msg):\n\traise RuntimeError(msg)\n")
        .await
        .unwrap();

    let err = sandbox
        .run("boom", vec![json!("Hello").into()])
        .await
        .unwrap_err();
    match err {
        IsolaError::GuestAborted(message) => assert!(message.contains("Hello")),
        other => panic!("expected GuestAborted, got {other:?}"),
    }
    // A handled interpreter-level failure does not poison the sandbox.
    assert!(!sandbox.poisoned().await);
    let result = sandbox
        .run("boom", vec![json!("again").into()])
        .await
        .unwrap_err();
    assert!(matches!(result, IsolaError::GuestAborted(_)));

    sandbox.close().await;
    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_sees_events_in_emission_order() {
    let Some((context, sandbox)) = started_sandbox(5.0).await else {
        return;
    };
    sandbox
        .load_script("def chatty():\n\tprint('one')\n\tprint('two')\n\treturn None\n")
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    sandbox.set_callback(move |event: Event| {
        if event.kind == EventKind::Stdout {
            sink.lock().unwrap().push(event.data.unwrap_or_default());
        }
    });

    sandbox.run("chatty", Vec::new()).await.unwrap();
    let lines = seen.lock().unwrap().join("");
    let one = lines.find("one").expect("missing 'one'");
    let two = lines.find("two").expect("missing 'two'");
    assert!(one < two);

    sandbox.close().await;
    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_sandboxes_run_concurrently() {
    let Some((runtime_dir, lib_dir)) = runtime_paths() else {
        return;
    };
    let context = Context::new();
    context
        .configure(
            ContextPatch::default()
                .max_memory(64 * 1024 * 1024)
                .runtime_lib_dir(lib_dir),
        )
        .unwrap();
    context.initialize_template(runtime_dir).await.unwrap();

    let script = "import time\n\ndef identify(name, delay):\n\ttime.sleep(delay)\n\treturn name\n";
    let run_one = |name: &'static str| {
        let context = &context;
        async move {
            let sandbox = context.instantiate().await.unwrap();
            sandbox
                .configure(SandboxPatch::default().timeout_secs(2.0))
                .unwrap();
            sandbox.start().await.unwrap();
            sandbox.load_script(script).await.unwrap();
            let result = sandbox
                .run("identify", vec![json!(name).into(), json!(0.05).into()])
                .await
                .unwrap();
            sandbox.close().await;
            result.final_value
        }
    };

    let (a, b) = tokio::join!(run_one("sandbox-a"), run_one("sandbox-b"));
    assert_eq!(a, Some(json!("sandbox-a")));
    assert_eq!(b, Some(json!("sandbox-b")));

    context.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_run_terminates_producers() {
    let Some((context, sandbox)) = started_sandbox(30.0).await else {
        return;
    };
    sandbox
        .load_script(
            "def consume_one(items):\n\tfor item in items:\n\t\treturn item\n",
        )
        .await
        .unwrap();

    // An endless producer; the run future is dropped shortly after launch.
    let endless = futures::stream::iter(0u64..);
    let arg = RunArg::stream_from(endless, 1).unwrap();
    let run = sandbox.run("consume_one", vec![arg]);
    let timed_out = tokio::time::timeout(Duration::from_millis(100), run).await;
    drop(timed_out);

    // The producer must reach a terminal state promptly once the run is
    // cancelled; closing the sandbox must not hang on it.
    tokio::time::timeout(Duration::from_secs(5), sandbox.close())
        .await
        .expect("close should not hang after cancellation");
    context.close().await;
}
