// End-to-end tests for the capture daemon over real HTTP.
//
// Each test starts `gasoline_agentd::run` on a free loopback port with its own
// state directory.

use gasoline_agentd::{Settings, API_KEY_HEADER, VERSION};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

fn settings(temp: &TempDir, port: u16) -> Settings {
    Settings {
        port,
        state_dir: temp.path().join("state"),
        project_path: Some(temp.path().join("project")),
        auto_upgrade: false,
        ..Settings::default()
    }
}

fn start(settings: Settings) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(gasoline_agentd::run(settings))
}

async fn mcp(client: &reqwest::Client, port: u16, request: Value) -> Value {
    client
        .post(format!("http://127.0.0.1:{port}/mcp"))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn e2e_ingest_then_observe_over_mcp() {
    let temp = TempDir::new().unwrap();
    let port = find_free_port().await;
    let server = start(settings(&temp, port));
    wait_for_port(port).await;

    let client = reqwest::Client::new();
    let health: Value = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["service-name"], "gasoline");
    assert_eq!(health["version"], VERSION);
    assert_eq!(health["pid"], std::process::id());

    let ingest: Value = client
        .post(format!("http://127.0.0.1:{port}/logs"))
        .json(&json!({"entries": [
            {"level": "error", "message": "TypeError: x is undefined", "url": "http://localhost:3000/"}
        ]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ingest["received"], 1);
    assert_eq!(ingest["entries"], 1);

    let listed = mcp(
        &client,
        port,
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
    )
    .await;
    assert_eq!(listed["result"]["tools"].as_array().unwrap().len(), 5);

    let observed = mcp(
        &client,
        port,
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "observe", "arguments": {"what": "errors"}}
        }),
    )
    .await;
    let text = observed["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("TypeError: x is undefined"), "text was: {text}");

    let pid_file = temp
        .path()
        .join("state")
        .join("pids")
        .join(format!("gasoline-{port}.pid"));
    assert!(pid_file.exists());

    server.abort();
}

#[tokio::test]
async fn e2e_http_shutdown_cleans_up() {
    let temp = TempDir::new().unwrap();
    let port = find_free_port().await;
    let server = start(settings(&temp, port));
    wait_for_port(port).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{port}/shutdown"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let finished = timeout(Duration::from_secs(10), server)
        .await
        .expect("daemon stops after /shutdown")
        .unwrap();
    finished.unwrap();

    let state = temp.path().join("state");
    assert!(!state.join("pids").join(format!("gasoline-{port}.pid")).exists());
    let lifecycle = tokio::fs::read_to_string(state.join("logs").join("lifecycle.jsonl"))
        .await
        .unwrap();
    assert!(lifecycle.contains("\"daemon_started\""));
    assert!(lifecycle.contains("\"shutdown_requested\""));
    assert!(lifecycle.contains("\"daemon_shutdown\""));
}

#[tokio::test]
async fn e2e_api_key_and_host_checks() {
    let temp = TempDir::new().unwrap();
    let port = find_free_port().await;
    let mut settings = settings(&temp, port);
    settings.api_key = Some("e2e-key".into());
    let server = start(settings);
    wait_for_port(port).await;

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/health");
    let denied = client.get(&url).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = client
        .get(&url)
        .header(API_KEY_HEADER, "e2e-key")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);

    let foreign = client
        .get(&url)
        .header(API_KEY_HEADER, "e2e-key")
        .header("Origin", "https://attacker.test")
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status(), 403);

    server.abort();
}

#[tokio::test]
async fn e2e_second_daemon_on_same_port_fails_to_bind() {
    let temp = TempDir::new().unwrap();
    let port = find_free_port().await;
    let first = start(settings(&temp, port));
    wait_for_port(port).await;

    let other = TempDir::new().unwrap();
    let second = gasoline_agentd::run(settings(&other, port)).await;
    let err = second.expect_err("port is taken");
    assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));

    first.abort();
}

async fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn wait_for_port(port: u16) {
    let mut attempts = 0;
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => {
                drop(stream);
                break;
            }
            Err(_) if attempts < 50 => {
                attempts += 1;
                sleep(Duration::from_millis(50)).await;
            }
            Err(err) => {
                panic!("gasoline did not start listening on port {}: {}", port, err);
            }
        }
    }
}
