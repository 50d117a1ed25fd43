pub mod channels;
pub mod machines;
pub mod processes;
pub mod snapshots;

use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};

use crate::auth::auth_middleware;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    let authed = Router::new()
        // Machines
        .route(
            "/machines",
            post(machines::create_machine).get(machines::list_machines),
        )
        .route("/machines/recover", post(machines::recover_machine))
        .route(
            "/machines/{id}",
            get(machines::get_machine).delete(machines::destroy_machine),
        )
        .route("/machines/{id}/logs", get(machines::machine_logs))
        .route("/workspaces/{ws}/dev-machine", get(machines::dev_machine))
        // Processes
        .route(
            "/machines/{id}/processes",
            post(processes::exec).get(processes::list_processes),
        )
        .route(
            "/machines/{id}/processes/{pid}",
            delete(processes::stop_process),
        )
        .route(
            "/machines/{id}/processes/{pid}/logs",
            get(processes::process_logs),
        )
        // Snapshots
        .route("/machines/{id}/snapshots", post(snapshots::save_snapshot))
        .route(
            "/snapshots",
            get(snapshots::list_snapshots).delete(snapshots::remove_snapshots),
        )
        .route(
            "/snapshots/{id}",
            get(snapshots::get_snapshot).delete(snapshots::remove_snapshot),
        )
        // Live output
        .route("/channels/{channel}/ws", get(channels::subscribe))
        // Auth middleware
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/api", authed).with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use wm_core::{EventBus, MachineManager, RecipeLoader};
    use wm_db::MemorySnapshotStore;
    use wm_infra::ProviderRegistry;
    use wm_infra::local::LocalProvider;
    use wm_infra::types::{MachineConfig, Recipe};

    use super::*;
    use crate::config::AppConfig;

    const API_KEY: &str = "test-key";

    struct StaticRecipes;

    #[async_trait]
    impl RecipeLoader for StaticRecipes {
        async fn load(&self, _config: &MachineConfig) -> wm_core::Result<Recipe> {
            Ok(Recipe::dockerfile("FROM ubuntu\nRUN echo ready\n"))
        }
    }

    fn test_app(dir: &tempfile::TempDir) -> Router {
        let config = AppConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            api_key: API_KEY.into(),
            api_endpoint: "http://localhost:8080/api".into(),
            database_url: None,
            logs_dir: dir.path().join("logs"),
            default_mem_size_mb: 1024,
            shutdown_timeout_secs: 1,
            agent_command: None,
        };
        let providers = ProviderRegistry::new().register(
            "docker",
            Arc::new(LocalProvider::new(dir.path().join("machines"))),
        );
        let manager = MachineManager::new(
            config.manager_config(),
            providers,
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(StaticRecipes),
            EventBus::default(),
        );
        manager.start().unwrap();

        api_router(AppState { manager, config })
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        request_as("user1", method, uri, body)
    }

    fn request_as(user: &str, method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {API_KEY}"))
            .header("x-user-id", user);
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    fn create_body(name: &str) -> Value {
        json!({
            "config": {
                "name": name,
                "type": "docker",
                "source": { "type": "Recipe", "location": "http://localhost:8080/api/recipe/r1" },
            },
            "workspace_id": "ws1",
        })
    }

    #[tokio::test]
    async fn requests_without_api_key_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);

        let req = Request::builder()
            .uri("/api/machines")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let req = Request::builder()
            .uri("/api/machines")
            .header("authorization", format!("Bearer {API_KEY}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, req).await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn machine_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);

        let (status, machine) =
            send(&app, request("POST", "/api/machines", Some(create_body("dev")))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(machine["status"], "RUNNING");
        assert_eq!(machine["owner"], "user1");
        assert_eq!(machine["limits"]["ram_mb"], 1024);
        let id = machine["id"].as_str().unwrap().to_string();

        let (status, _) =
            send(&app, request("POST", "/api/machines", Some(create_body("dev")))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) =
            send(&app, request("POST", "/api/machines", Some(create_body("bad name!")))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, list) = send(&app, request("GET", "/api/machines?workspace=ws1", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, logs) = send(&app, request("GET", &format!("/api/machines/{id}/logs"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(logs.as_str().unwrap().contains("ready"));

        let (status, _) = send(&app, request("DELETE", &format!("/api/machines/{id}"), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, request("GET", &format!("/api/machines/{id}"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn machines_of_other_users_are_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);
        let (_, machine) =
            send(&app, request("POST", "/api/machines", Some(create_body("dev")))).await;
        let id = machine["id"].as_str().unwrap().to_string();
        let exec = json!({ "command": { "name": "hi", "command_line": "echo hi", "type": "custom" } });

        for (method, uri, body) in [
            ("GET", format!("/api/machines/{id}"), None),
            ("GET", format!("/api/machines/{id}/logs"), None),
            ("POST", format!("/api/machines/{id}/processes"), Some(exec)),
            ("GET", format!("/api/machines/{id}/processes"), None),
            ("POST", format!("/api/machines/{id}/snapshots"), Some(json!({ "sync": true }))),
            ("DELETE", format!("/api/machines/{id}"), None),
        ] {
            let (status, _) = send(&app, request_as("user2", method, &uri, body)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        }

        let (status, _) = send(&app, request("GET", &format!("/api/machines/{id}"), None)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, processes) =
            send(&app, request("GET", &format!("/api/machines/{id}/processes"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(processes.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exec_and_read_process_logs() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);
        let (_, machine) =
            send(&app, request("POST", "/api/machines", Some(create_body("dev")))).await;
        let id = machine["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            request(
                "POST",
                &format!("/api/machines/{id}/processes"),
                Some(json!({ "command": { "name": "hello", "command_line": null, "type": "custom" } })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Command line is required");

        let (status, process) = send(
            &app,
            request(
                "POST",
                &format!("/api/machines/{id}/processes"),
                Some(json!({ "command": { "name": "hello", "command_line": "echo hello", "type": "custom" } })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(process["pid"], 1);

        let uri = format!("/api/machines/{id}/processes/1/logs");
        let mut logs = Value::Null;
        for _ in 0..100 {
            let (status, body) = send(&app, request("GET", &uri, None)).await;
            if status == StatusCode::OK && body.as_str().is_some_and(|s| s.contains("hello")) {
                logs = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(logs, "hello\n");
    }

    #[tokio::test]
    async fn snapshots_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);
        let (_, machine) =
            send(&app, request("POST", "/api/machines", Some(create_body("dev")))).await;
        let id = machine["id"].as_str().unwrap().to_string();

        let (status, snapshot) = send(
            &app,
            request(
                "POST",
                &format!("/api/machines/{id}/snapshots"),
                Some(json!({ "description": "before upgrade", "sync": true })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(snapshot["machine_name"], "dev");
        let snapshot_id = snapshot["id"].as_str().unwrap().to_string();

        let (status, list) = send(&app, request("GET", "/api/snapshots?workspace=ws1", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, request("GET", "/api/snapshots", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) =
            send(&app, request("DELETE", &format!("/api/snapshots/{snapshot_id}"), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) =
            send(&app, request("GET", &format!("/api/snapshots/{snapshot_id}"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
