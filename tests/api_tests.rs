use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{App, test, web};
use gpirq::backend::MockGpioBackend;
use gpirq::config::AppConfig;
use gpirq::gpio::GpioManager;
use gpirq::routes::AppState;
use serde_json::Value;

fn sample_config() -> AppConfig {
    serde_json::from_str(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1",
                "timeout": 30
            },
            "gpios": {
                "1": {
                    "name": "LED 1",
                    "chip": "/dev/gpiochip0",
                    "line": 2,
                    "capabilities": [
                        "output"
                    ]
                },
                "2": {
                    "name": "BUTTON1",
                    "chip": "/dev/gpiochip0",
                    "line": 3,
                    "capabilities": [
                        "input",
                        "pull-up",
                        "pull-down"
                    ]
                },
                "42": {
                    "name": "P9_42",
                    "chip": "/dev/gpiochip1",
                    "line": 5,
                    "capabilities": [
                        "input",
                        "output"
                    ]
                }
            },
            "broadcast_capacity": 16,
            "event_history_capacity": 4
        }
        "#,
    )
    .unwrap()
}

fn app_state() -> (AppState<MockGpioBackend>, Arc<MockGpioBackend>, String) {
    let cfg = Arc::new(sample_config());
    let backend = Arc::new(MockGpioBackend::default());
    let manager = Arc::new(GpioManager::new(cfg.clone(), backend.clone()));
    (AppState { manager }, backend, cfg.http.path.clone())
}

macro_rules! init_app {
    ($state:expr, $scope_path:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .service($state.api_scope(&$scope_path)),
        )
        .await
    };
}

#[actix_rt::test]
async fn list_gpios_returns_all() {
    let (state, _, scope_path) = app_state();
    let app = init_app!(state, scope_path);

    let req = test::TestRequest::get().uri("/api/v1/gpios").to_request();
    let response: HashMap<String, Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response.len(), 3);
    assert!(response.contains_key("1"));

    let led = response.get("1").unwrap();
    assert_eq!(led["direction"], "unset");
    assert_eq!(led["watched"], false);
    let cfg = &led["info"];
    assert_eq!(cfg["name"], "LED 1");
    assert_eq!(cfg["chip"], "/dev/gpiochip0");
    assert_eq!(cfg["line"], 2);
}

#[actix_rt::test]
async fn unknown_channel_returns_404() {
    let (state, _, scope_path) = app_state();
    let app = init_app!(state, scope_path);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/P9_99/function")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let (state, _, scope_path) = app_state();
    let app = init_app!(state, scope_path);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/BUTTON1/detect")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn setup_output_and_write_value() {
    let (state, _, scope_path) = app_state();
    let app = init_app!(state, scope_path);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/setup")
        .set_payload(r#"{"direction":"output"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/value")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/1/value")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "1");

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/1/function")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "\"output\"");
}

#[actix_rt::test]
async fn reject_value_when_not_output() {
    let (state, _, scope_path) = app_state();
    let app = init_app!(state, scope_path);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/value")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn detect_requires_input_setup() {
    let (state, _, scope_path) = app_state();
    let app = init_app!(state, scope_path);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/detect")
        .set_payload(r#"{"edge":"rising"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/callback")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn edges_are_recorded_and_detect_conflicts() {
    let (state, backend, scope_path) = app_state();
    let app = init_app!(state, scope_path);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/setup")
        .set_payload(r#"{"direction":"input","pull":"down"}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/detect")
        .set_payload(r#"{"edge":"both"}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/detect")
        .set_payload(r#"{"edge":"rising"}"#)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 409);

    for _ in 0..3 {
        backend.pulse(2).unwrap();
    }

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/BUTTON1/events")
        .to_request();
    let events: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(events.len(), 4);
    assert_eq!(events[0]["channel"], "BUTTON1");
    assert_eq!(events[0]["pin_id"], 2);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/BUTTON1/events?limit=2")
        .to_request();
    let events: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(events.len(), 2);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/BUTTON1/detected")
        .to_request();
    let detected: bool = test::call_and_read_body_json(&app, req).await;
    assert!(detected);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/BUTTON1")
        .to_request();
    let desc: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(desc["watched"], true);
    assert_eq!(desc["handlers"], 1);

    let req = test::TestRequest::delete()
        .uri("/api/v1/gpio/BUTTON1/detect")
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/BUTTON1")
        .to_request();
    let desc: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(desc["watched"], false);
    assert_eq!(desc["handlers"], 0);
}

#[actix_rt::test]
async fn callback_requires_detection() {
    let (state, _, scope_path) = app_state();
    let app = init_app!(state, scope_path);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/42/setup")
        .set_payload(r#"{"direction":"input"}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/42/callback")
        .set_payload(r#"{"bouncetime":50}"#)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 409);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/42/detect")
        .set_payload(r#"{"edge":"falling","callback":false}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/42/callback")
        .set_payload(r#"{"bouncetime":50}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());
}

#[actix_rt::test]
async fn wait_for_edge_times_out_over_http() {
    let (state, _, scope_path) = app_state();
    let app = init_app!(state, scope_path);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/setup")
        .set_payload(r#"{"direction":"input"}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/wait")
        .set_payload(r#"{"edge":"rising","timeout_ms":20}"#)
        .to_request();
    let resp: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(resp["outcome"], "timeout");

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/wait")
        .set_payload(r#"{"edge":"none","timeout_ms":20}"#)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}

#[actix_rt::test]
async fn cleanup_resets_pins() {
    let (state, _, scope_path) = app_state();
    let app = init_app!(state, scope_path);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/setup")
        .set_payload(r#"{"direction":"input"}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/BUTTON1/detect")
        .set_payload(r#"{"edge":"both"}"#)
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    for _ in 0..2 {
        let req = test::TestRequest::post().uri("/api/v1/cleanup").to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
    }

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/BUTTON1")
        .to_request();
    let desc: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(desc["direction"], "unset");
    assert_eq!(desc["watched"], false);
}
