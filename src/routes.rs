use log::warn;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::EdgeDetect;
use crate::error::AppError;
use crate::gpio::{EdgeEvent, GpioManager};
use crate::watch::{Direction, GpioBackend, Pull};

pub struct AppState<B: GpioBackend + ?Sized> {
    pub manager: Arc<GpioManager<B>>,
}

impl<B: GpioBackend + ?Sized> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

#[derive(Deserialize)]
struct SetupPayload {
    direction: Direction,
    pull: Option<Pull>,
    initial: Option<u8>,
}

#[derive(Deserialize)]
struct DetectPayload {
    edge: EdgeDetect,
    bouncetime: Option<u32>,
    callback: Option<bool>,
}

#[derive(Deserialize, Default)]
struct CallbackPayload {
    bouncetime: Option<u32>,
}

#[derive(Deserialize)]
struct WaitPayload {
    edge: EdgeDetect,
    timeout_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
    pin_filter: Option<u32>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if pin_filter.as_ref().map(|p| *p == event.pin_id).unwrap_or(true) {
                            if let Ok(text) = serde_json::to_string(&event) {
                                if session.text(text).await.is_err() {
                                    warn!("WebSocket client disconnected");
                                    break;
                                }
                            }
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        if session.text(AppError::io(-1, format!("Event stream lagged by {n} messages")).to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl<B: GpioBackend + ?Sized + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/gpios")
                    .route(web::get().to(list_gpios::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpios/events")
                    .route(web::get().to(events_ws_all::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/cleanup")
                    .route(web::post().to(cleanup::<B>))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/gpio/{channel}")
                    .route(web::get().to(pin_descriptor::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpio/{channel}/setup")
                    .route(web::post().to(setup::<B>))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/gpio/{channel}/function")
                    .route(web::get().to(gpio_function::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpio/{channel}/value")
                    .route(web::get().to(get_value::<B>))
                    .route(web::post().to(set_value::<B>))
                    .route(not_allowed(&[Method::GET, Method::POST])),
            )
            .service(
                web::resource("/gpio/{channel}/detect")
                    .route(web::post().to(add_event_detect::<B>))
                    .route(web::delete().to(remove_event_detect::<B>))
                    .route(not_allowed(&[Method::POST, Method::DELETE])),
            )
            .service(
                web::resource("/gpio/{channel}/callback")
                    .route(web::post().to(add_event_callback::<B>))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/gpio/{channel}/detected")
                    .route(web::get().to(event_detected::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpio/{channel}/wait")
                    .route(web::post().to(wait_for_edge::<B>))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/gpio/{channel}/event")
                    .route(web::get().to(get_last_event::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpio/{channel}/events")
                    .route(web::get().to(get_events::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
    }
}

async fn list_gpios<B: GpioBackend + ?Sized + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.list_pins()))
}

async fn pin_descriptor<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;
    let desc = state.manager.get_pin_descriptor(&channel)?;

    Ok(web::Json(desc))
}

async fn setup<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;
    let payload: SetupPayload = parse_json(&body)?;

    state.manager.setup(
        &channel,
        payload.direction,
        payload.pull.unwrap_or_default(),
        payload.initial.unwrap_or(0),
    )?;

    Ok(HttpResponse::Ok())
}

async fn gpio_function<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;

    Ok(web::Json(state.manager.gpio_function(&channel)?))
}

async fn get_value<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;

    let value = state.manager.input(&channel)?;

    Ok(web::Json(value))
}

async fn set_value<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;
    let value = parse_value_payload(&body)?;

    state.manager.output(&channel, value)?;

    Ok(HttpResponse::Ok())
}

async fn add_event_detect<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;
    let payload: DetectPayload = parse_json(&body)?;

    let callback = if payload.callback.unwrap_or(true) {
        let pin_id = state.manager.resolve(&channel)?;
        Some(state.manager.event_callback(pin_id))
    } else {
        None
    };
    state.manager.add_event_detect(
        &channel,
        payload.edge,
        callback,
        payload.bouncetime.unwrap_or(0),
    )?;

    Ok(HttpResponse::Ok())
}

async fn remove_event_detect<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;

    state.manager.remove_event_detect(&channel)?;

    Ok(HttpResponse::Ok())
}

async fn add_event_callback<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;
    let payload: CallbackPayload = if body.is_empty() {
        CallbackPayload::default()
    } else {
        parse_json(&body)?
    };

    let pin_id = state.manager.resolve(&channel)?;
    let callback = state.manager.event_callback(pin_id);
    state
        .manager
        .add_event_callback(&channel, callback, payload.bouncetime.unwrap_or(0))?;

    Ok(HttpResponse::Ok())
}

async fn event_detected<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;

    Ok(web::Json(state.manager.event_detected(&channel)?))
}

async fn wait_for_edge<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;
    let payload: WaitPayload = parse_json(&body)?;
    let timeout = payload.timeout_ms.map(Duration::from_millis);

    let manager = state.manager.clone();
    let edge = web::block(move || manager.wait_for_edge(&channel, payload.edge, timeout))
        .await
        .map_err(|e| AppError::io(-1, format!("Blocking wait failed: {e}")))??;

    let outcome = if edge { "edge" } else { "timeout" };
    Ok(HttpResponse::Ok().json(json!({ "outcome": outcome })))
}

async fn get_last_event<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;

    let last = state.manager.get_last_event(&channel)?;

    match last {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::Ok().finish()),
    }
}

async fn get_events<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel = parse_channel(&req)?;

    let events = state.manager.get_events(&channel, query.limit)?;

    Ok(web::Json(events))
}

async fn cleanup<B: GpioBackend + ?Sized + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    state.manager.cleanup();

    Ok(HttpResponse::Ok())
}

async fn events_ws_all<B: GpioBackend + ?Sized + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let rx = state.manager.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::io(-1, format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, None).await;
    });

    Ok(response)
}

fn parse_value_payload(body: &[u8]) -> Result<u8, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty value payload".into()));
    }

    match std::str::from_utf8(body) {
        Ok(text) => text
            .trim()
            .parse::<u8>()
            .map_err(|_| AppError::InvalidValue("Value must be an integer".into())),
        _ => Err(AppError::InvalidValue(
            "Value payload must be valid UTF-8".into(),
        )),
    }
}

fn parse_channel(req: &HttpRequest) -> Result<String, AppError> {
    req.match_info()
        .get("channel")
        .map(str::to_string)
        .ok_or_else(|| AppError::InvalidValue("Missing channel".into()))
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty payload".into()));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid payload: {e}")))
}

fn not_allowed(methods: &[Method]) -> actix_web::Route {
    web::route()
        .guard(guard_not_methods(methods))
        .to(method_not_allowed)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
