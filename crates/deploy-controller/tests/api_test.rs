//! Integration tests for the deploy controller API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use deploy_controller::build_trigger::BuildTrigger;
use deploy_controller::cluster::ClusterApi;
use deploy_controller::mock::{MockBuilds, MockCluster, MockRegistry};
use deploy_controller::registry_client::RegistryApi;
use deploy_controller::{create_router, AppState, Backends, Controller, ControllerSettings};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for `oneshot`

struct TestApp {
    app: Router,
    controller: Arc<Controller>,
    registry: Arc<MockRegistry>,
    cluster: Arc<MockCluster>,
    builds: Arc<MockBuilds>,
}

/// Helper to create a test app backed by in-memory collaborators
fn create_test_app() -> TestApp {
    let registry = Arc::new(MockRegistry::new());
    let cluster = Arc::new(MockCluster::new());
    let builds = Arc::new(MockBuilds::new());

    let controller = Arc::new(Controller::new(
        ControllerSettings {
            registry_host: "10.110.67.87:5000".to_string(),
            namespace: "holm".to_string(),
            dedup_window: Duration::from_secs(120),
        },
        Backends {
            registry: Arc::clone(&registry) as Arc<dyn RegistryApi>,
            cluster: Some(Arc::clone(&cluster) as Arc<dyn ClusterApi>),
            builds: Arc::clone(&builds) as Arc<dyn BuildTrigger>,
        },
    ));

    let app = create_router(AppState {
        controller: Arc::clone(&controller),
    });

    TestApp {
        app,
        controller,
        registry,
        cluster,
        builds,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };

    (status, json)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(
        app,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    send(
        app,
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

/// Poll `uri` until `done` accepts the body or the attempts run out
async fn wait_for(app: &Router, uri: &str, done: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..50 {
        let (_, json) = get(app, uri).await;
        if done(&json) {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition on {} not reached", uri);
}

fn registry_push(repository: &str, tag: &str, digest: &str) -> Value {
    json!({
        "events": [{
            "id": "evt-1",
            "timestamp": "2026-01-01T00:00:00Z",
            "action": "push",
            "target": {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": digest,
                "repository": repository,
                "url": format!("http://10.110.67.87:5000/v2/{}/manifests/{}", repository, digest),
                "tag": tag
            }
        }]
    })
}

#[tokio::test]
async fn test_health_check() {
    let t = create_test_app();

    let (status, json) = get(&t.app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "deploy-controller");
    assert!(json["time"].is_string());
}

#[tokio::test]
async fn test_registry_push_deploys_matching_rule() {
    let t = create_test_app();
    t.cluster
        .seed("holm", "svc-a", "10.110.67.87:5000/svc-a:v1")
        .await;

    let (status, json) = post_json(
        &t.app,
        "/api/autodeploy",
        json!({
            "imagePattern": "svc-a",
            "tagPattern": "*",
            "namespace": "holm",
            "deployment": "svc-a",
            "enabled": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "added");

    let (status, json) = post_json(
        &t.app,
        "/api/webhook/registry",
        registry_push("svc-a", "v2", "sha256:abc"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "received");
    assert_eq!(json["events"], 1);

    let events = wait_for(&t.app, "/api/events", |json| {
        json.as_array().map(|a| !a.is_empty()).unwrap_or(false)
    })
    .await;
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["status"], "success");
    assert_eq!(events[0]["trigger"], "registry-webhook");
    assert!(events[0]["image"].as_str().unwrap().ends_with("svc-a:v2"));
    assert_eq!(
        events[0]["previousImage"],
        "10.110.67.87:5000/svc-a:v1"
    );

    let (status, history) = get(&t.app, "/api/history?deployment=svc-a").await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["version"], 1);

    let workload = t.cluster.workload("holm", "svc-a").await.unwrap();
    assert_eq!(workload.image, "10.110.67.87:5000/svc-a:v2");

    // The poll path must not report the webhook-observed digest again
    t.registry.push("svc-a", "v2", "sha256:abc").await;
    assert!(t.controller.poll_registry().await.unwrap().is_empty());

    let registry_events = wait_for(&t.app, "/api/registry-events", |json| {
        json[0]["processed"] == true
    })
    .await;
    assert_eq!(registry_events[0]["autoDeployed"], true);
    assert_eq!(registry_events[0]["repository"], "svc-a");
}

#[tokio::test]
async fn test_push_without_matching_rule_deploys_nothing() {
    let t = create_test_app();
    t.cluster
        .seed("holm", "svc-a", "10.110.67.87:5000/svc-a:v1")
        .await;

    let (status, _) = post_json(
        &t.app,
        "/api/webhook/registry",
        registry_push("svc-b", "v2", "sha256:def"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let registry_events = wait_for(&t.app, "/api/registry-events", |json| {
        json[0]["processed"] == true
    })
    .await;
    assert_eq!(registry_events[0]["autoDeployed"], false);

    let (_, events) = get(&t.app, "/api/events").await;
    assert!(events.as_array().unwrap().is_empty());
    assert_eq!(t.cluster.update_count(), 0);
}

#[tokio::test]
async fn test_malformed_registry_webhook_rejected() {
    let t = create_test_app();

    let (status, json) = send(
        &t.app,
        Request::builder()
            .method("POST")
            .uri("/api/webhook/registry")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    let (_, events) = get(&t.app, "/api/registry-events").await;
    assert!(events.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_deploy_and_rollback() {
    let t = create_test_app();
    t.cluster.seed("holm", "api", "reg/api:v1").await;

    let (status, json) = post_json(
        &t.app,
        "/api/deploy",
        json!({ "deployment": "api", "namespace": "holm", "image": "reg/api:v2" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "deployed");
    assert_eq!(json["version"], 1);

    let (status, json) = post_json(
        &t.app,
        "/api/deploy",
        json!({ "deployment": "api", "image": "reg/api:v3" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["version"], 2);

    // No version: back to the image the last deploy replaced
    let (status, json) = post_json(&t.app, "/api/rollback", json!({ "deployment": "api" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "rolled back");
    assert_eq!(json["image"], "reg/api:v2");

    // Explicit version
    let (status, json) = post_json(
        &t.app,
        "/api/rollback",
        json!({ "deployment": "api", "version": 2 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["image"], "reg/api:v3");

    let (_, history) = get(&t.app, "/api/history?deployment=api").await;
    let versions: Vec<u64> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["version"].as_u64().unwrap())
        .collect();
    assert_eq!(versions, vec![4, 3, 2, 1]);

    let (_, events) = get(&t.app, "/api/events").await;
    assert_eq!(events[0]["trigger"], "rollback");
}

#[tokio::test]
async fn test_rollback_unknown_version() {
    let t = create_test_app();
    t.cluster.seed("holm", "api", "reg/api:v1").await;

    let (status, _) = post_json(
        &t.app,
        "/api/deploy",
        json!({ "deployment": "api", "image": "reg/api:v2" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = post_json(
        &t.app,
        "/api/rollback",
        json!({ "deployment": "api", "version": 7 }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_rollback_without_history() {
    let t = create_test_app();

    let (status, _) = post_json(&t.app, "/api/rollback", json!({ "deployment": "ghost" })).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deploy_unknown_deployment() {
    let t = create_test_app();

    let (status, _) = post_json(
        &t.app,
        "/api/deploy",
        json!({ "deployment": "ghost", "image": "reg/ghost:v1" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, events) = get(&t.app, "/api/events").await;
    assert_eq!(events[0]["status"], "failed");
}

#[tokio::test]
async fn test_deploy_cluster_unavailable() {
    let t = create_test_app();
    t.cluster.seed("holm", "api", "reg/api:v1").await;
    t.cluster.set_unavailable(true);

    let (status, _) = post_json(
        &t.app,
        "/api/deploy",
        json!({ "deployment": "api", "image": "reg/api:v2" }),
    )
    .await;

    assert!(status.is_server_error());
}

#[tokio::test]
async fn test_deploy_missing_image_rejected() {
    let t = create_test_app();

    let (status, _) = post_json(
        &t.app,
        "/api/deploy",
        json!({ "deployment": "api", "image": "" }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_autodeploy_rule_crud() {
    let t = create_test_app();

    let (status, _) = post_json(
        &t.app,
        "/api/autodeploy",
        json!({ "imagePattern": "svc-", "deploymentName": "svc", "enabled": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, rules) = get(&t.app, "/api/autodeploy").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rules["svc"]["imagePattern"], "svc-");
    assert_eq!(rules["svc"]["namespace"], "holm");
    assert_eq!(rules["svc"]["deployment"], "svc");
    assert_eq!(rules["svc"]["enabled"], true);

    let (status, json) = send(
        &t.app,
        Request::builder()
            .method("DELETE")
            .uri("/api/autodeploy?deployment=svc")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "deleted");

    let (_, rules) = get(&t.app, "/api/autodeploy").await;
    assert!(rules.as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_unknown_rule() {
    let t = create_test_app();

    let (status, _) = send(
        &t.app,
        Request::builder()
            .method("DELETE")
            .uri("/api/autodeploy?deployment=nope")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rule_without_deployment_rejected() {
    let t = create_test_app();

    let (status, _) = post_json(&t.app, "/api/autodeploy", json!({ "imagePattern": "svc" })).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deployments_sorted_by_name() {
    let t = create_test_app();
    t.cluster.seed("holm", "zeta", "reg/zeta:v1").await;
    t.cluster.seed("holm", "alpha", "reg/alpha:v1").await;
    t.cluster.seed("other", "beta", "reg/beta:v1").await;

    t.controller.refresh_read_model().await.unwrap();

    let (status, json) = get(&t.app, "/api/deployments").await;
    assert_eq!(status, StatusCode::OK);

    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[tokio::test]
async fn test_build_webhook_deploys_successful_build() {
    let t = create_test_app();
    t.cluster.seed("holm", "web", "reg/web:v1").await;

    let (status, json) = post_json(
        &t.app,
        "/api/webhook/build",
        json!({ "buildId": "b-1", "image": "reg/web:v2", "status": "success" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "processed");

    let events = wait_for(&t.app, "/api/events", |json| {
        json.as_array().map(|a| !a.is_empty()).unwrap_or(false)
    })
    .await;
    assert_eq!(events[0]["trigger"], "build-webhook");
    assert_eq!(events[0]["image"], "reg/web:v2");

    let (_, webhooks) = get(&t.app, "/api/webhook").await;
    assert_eq!(webhooks[0]["image"], "reg/web:v2");
}

#[tokio::test]
async fn test_build_webhook_ignores_failed_build() {
    let t = create_test_app();
    t.cluster.seed("holm", "web", "reg/web:v1").await;

    let (status, _) = post_json(
        &t.app,
        "/api/webhook/build",
        json!({ "buildId": "b-2", "image": "reg/web:v2", "status": "failed" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.cluster.update_count(), 0);

    let (_, webhooks) = get(&t.app, "/api/webhook").await;
    assert_eq!(webhooks.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_git_webhook_triggers_build() {
    let t = create_test_app();

    let (status, json) = post_json(
        &t.app,
        "/api/webhook/git",
        json!({
            "ref": "refs/heads/main",
            "after": "0123456789abcdef0123",
            "repository": { "name": "web", "full_name": "holm/web" }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "received");
    assert!(json["eventId"].is_string());

    for _ in 0..50 {
        if !t.builds.requests().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let requests = t.builds.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].repo, "holm/web");
    assert_eq!(requests[0].branch, "main");
    assert_eq!(requests[0].commit, "0123456789ab");

    let (_, webhooks) = get(&t.app, "/api/webhook").await;
    assert_eq!(webhooks[0]["repo"], "holm/web");
}

#[tokio::test]
async fn test_trigger_build_forwards_request() {
    let t = create_test_app();

    let (status, json) = post_json(
        &t.app,
        "/api/trigger-build",
        json!({ "repo": "holm/web", "branch": "main" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "triggered");

    for _ in 0..50 {
        if !t.builds.requests().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let requests = t.builds.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].repo, "holm/web");
    assert_eq!(requests[0].branch, "main");
    assert_eq!(requests[0].commit, "");

    let (status, builds) = get(&t.app, "/api/forge/builds").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(builds[0]["repo"], "holm/web");
}

#[tokio::test]
async fn test_forge_builds_empty_when_build_service_down() {
    let t = create_test_app();
    t.builds.set_unavailable(true);

    let (status, json) = get(&t.app, "/api/forge/builds").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn test_rule_with_empty_image_pattern_matches_every_push() {
    let t = create_test_app();
    t.cluster.seed("holm", "catch-all", "reg/any:v1").await;

    let (status, _) = post_json(
        &t.app,
        "/api/autodeploy",
        json!({ "imagePattern": "", "deployment": "catch-all", "enabled": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post_json(
        &t.app,
        "/api/webhook/registry",
        registry_push("whatever", "v9", "sha256:999"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = wait_for(&t.app, "/api/events", |json| {
        json.as_array().map(|a| !a.is_empty()).unwrap_or(false)
    })
    .await;
    assert_eq!(events[0]["deployment"], "catch-all");
    assert_eq!(events[0]["image"], "10.110.67.87:5000/whatever:v9");
}

#[tokio::test]
async fn test_images_lists_registry_tags() {
    let t = create_test_app();
    t.registry.push("svc-a", "v1", "sha256:1").await;
    t.registry.push("svc-a", "v2", "sha256:2").await;

    let (status, json) = get(&t.app, "/api/images").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["name"], "svc-a");
    assert_eq!(json[0]["tags"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_route() {
    let t = create_test_app();

    let (status, _) = get(&t.app, "/api/nope").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}
