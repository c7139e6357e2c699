//! Integration tests for the job control HTTP API

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use krusty_sdcard::config::Config;
use krusty_sdcard::gcode::HostDispatcher;
use krusty_sdcard::machine::TrackedMachine;
use krusty_sdcard::print_job::{JobContext, PrintJobController};
use krusty_sdcard::print_stats::PrintStats;
use krusty_sdcard::web::api::{create_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt; // for `oneshot`
use http_body_util::BodyExt; // for .collect().await

fn test_app(files: &[(&str, &str)]) -> (TempDir, Router) {
    let dir = tempdir().unwrap();
    let gcodes = dir.path().join("gcodes");
    for (name, contents) in files {
        let path = gcodes.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
    std::fs::create_dir_all(&gcodes).unwrap();
    let mut config = Config::default();
    config.virtual_sdcard.path = gcodes;
    config.resume.state_dir = dir.path().join("state");

    let machine = Arc::new(TrackedMachine::new());
    let dispatcher = Arc::new(HostDispatcher::new(machine.clone()));
    let stats = Arc::new(PrintStats::new());
    let ctx = JobContext::new(&config, dispatcher.clone(), stats.clone()).with_machine(machine);
    let controller = PrintJobController::new(ctx);
    dispatcher.attach(controller.clone());
    let app = create_router(AppState {
        controller,
        dispatcher,
        stats,
    });
    (dir, app)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn gcode(command: &str) -> Request<Body> {
    post("/api/v1/gcode", json!({ "command": command }))
}

#[tokio::test]
async fn test_idle_job_status() {
    let (_dir, app) = test_app(&[]);
    let (status, json) = send(&app, get("/api/v1/job")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["job"]["state"], "idle");
    assert_eq!(json["status"]["is_active"], false);
    assert_eq!(json["status"]["file_path"], Value::Null);
    assert_eq!(json["print_stats"]["state"], "standby");
}

#[tokio::test]
async fn test_file_listing() {
    let (_dir, app) = test_app(&[("b.gcode", "G28\n"), ("A.gcode", "G28\nG28\n"), ("sub/c.gco", "")]);
    let (status, json) = send(&app, get("/api/v1/files")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json,
        json!([
            { "path": "A.gcode", "size": 8 },
            { "path": "b.gcode", "size": 4 },
        ])
    );

    let (_, json) = send(&app, get("/api/v1/files?recursive=true")).await;
    let paths: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["A.gcode", "b.gcode", "sub/c.gco"]);
}

#[tokio::test]
async fn test_select_through_gcode_endpoint() {
    let (_dir, app) = test_app(&[("Cube.gcode", "G28\nG1 X5 Y5\n")]);
    let (status, json) = send(&app, gcode("M23 cube.gcode")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json["responses"],
        json!(["File opened:cube.gcode Size:13", "File selected"])
    );

    let (_, json) = send(&app, get("/api/v1/job")).await;
    assert_eq!(json["job"]["state"], "selected");
    assert_eq!(json["status"]["file_size"], 13);
    assert_eq!(json["print_stats"]["filename"], "cube.gcode");
}

#[tokio::test]
async fn test_gcode_error_is_bad_request() {
    let (_dir, app) = test_app(&[]);
    let (status, json) = send(&app, gcode("M30 old.gcode")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let reply: Value = serde_json::from_str(json["error"].as_str().unwrap()).unwrap();
    assert_eq!(reply["code"], "key125");
    assert_eq!(reply["msg"], "SD write not supported");
}

#[tokio::test]
async fn test_resume_without_file_conflicts() {
    let (_dir, app) = test_app(&[]);
    let (status, json) = send(&app, post("/api/v1/job/resume", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "key123");
    assert_eq!(json["values"], json!([]));
}

#[tokio::test]
async fn test_cancel_clears_selection() {
    let (_dir, app) = test_app(&[("Cube.gcode", "G28\nG1 X5 Y5\n")]);
    send(&app, gcode("M23 Cube.gcode")).await;
    send(&app, gcode("M26 S4")).await;

    let (status, json) = send(&app, post("/api/v1/job/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["file_position"], 0);
    assert_eq!(json["file_size"], 0);
    assert_eq!(json["is_active"], false);

    let (_, json) = send(&app, get("/api/v1/job")).await;
    assert_eq!(json["job"]["state"], "cancelled");
    assert_eq!(json["print_stats"]["state"], "cancelled");
}

#[tokio::test]
async fn test_pause_when_idle_reports_status() {
    let (_dir, app) = test_app(&[]);
    let (status, json) = send(&app, post("/api/v1/job/pause", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["is_active"], false);
    assert_eq!(json["progress"], 0.0);
}
