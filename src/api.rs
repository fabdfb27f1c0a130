use std::io::Read;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Local};
use serde::Serialize;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::alarm::model::{Alarm, AlarmDefinition, AlarmError};
use crate::alarm::occurrence::next_occurrence;
use crate::alarm::scheduler::{AlarmEngine, SchedulerPhase};
use crate::alarm::trigger::{FiredLog, FiredRecord};
use crate::clock::Clock;
use crate::runtime::SharedEngine;

const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

pub struct ApiServer {
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(config: ApiServerConfig, engine: SharedEngine, fired: FiredLog) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow!("failed to start API server on {bind}: {err}"))?;
        info!(%bind, "alarm API listening");
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let http_join =
            thread::spawn(move || run_server_loop(server, engine, fired, stop_for_thread));
        Ok(Self {
            stop,
            http_join: Some(http_join),
        })
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlarmView {
    id: String,
    time: String,
    label: String,
    days: Vec<u8>,
    is_active: bool,
    next_occurrence: Option<String>,
}

impl AlarmView {
    fn new(alarm: &Alarm, next: Option<DateTime<Local>>) -> Self {
        Self {
            id: alarm.id.clone(),
            time: alarm.time.to_string(),
            label: alarm.label.clone(),
            days: alarm.days.clone(),
            is_active: alarm.is_active,
            next_occurrence: next.map(|dt| dt.to_rfc3339()),
        }
    }

    fn at(alarm: &Alarm, now: &DateTime<Local>) -> Self {
        let next = if alarm.is_active {
            next_occurrence(alarm, now)
        } else {
            None
        };
        Self::new(alarm, next)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NextDueView {
    at: String,
    alarm_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Route<'a> {
    Health,
    State,
    ListAlarms,
    AddAlarm,
    ToggleAlarm(&'a str),
    DeleteAlarm(&'a str),
    Fired,
    MethodNotAllowed,
    NotFound,
}

fn route<'a>(method: &Method, path: &'a str) -> Route<'a> {
    let segments = path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    match (method, segments.as_slice()) {
        (Method::Get, ["healthz"]) => Route::Health,
        (Method::Get, [] | ["v1"] | ["v1", "state"]) => Route::State,
        (Method::Get, ["v1", "alarms"]) => Route::ListAlarms,
        (Method::Post, ["v1", "alarms"]) => Route::AddAlarm,
        (Method::Post, ["v1", "alarms", id, "toggle"]) => Route::ToggleAlarm(*id),
        (Method::Delete, ["v1", "alarms", id]) => Route::DeleteAlarm(*id),
        (Method::Get, ["v1", "fired"]) => Route::Fired,
        (_, ["healthz"] | [] | ["v1"] | ["v1", "state"] | ["v1", "alarms"] | ["v1", "fired"])
        | (_, ["v1", "alarms", _] | ["v1", "alarms", _, "toggle"]) => Route::MethodNotAllowed,
        _ => Route::NotFound,
    }
}

fn run_server_loop(server: Server, engine: SharedEngine, fired: FiredLog, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => {
                if let Err(err) = handle_request(request, &engine, &fired) {
                    warn!("failed to answer API request: {err:#}");
                }
            }
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

fn handle_request(
    mut request: tiny_http::Request,
    engine: &SharedEngine,
    fired: &FiredLog,
) -> Result<()> {
    let remote = request.remote_addr().copied();
    let reply = match remote {
        None => ApiReply::text(400, "missing remote address"),
        Some(addr) if !is_local_network_ip(addr.ip()) => {
            ApiReply::text(403, "forbidden: local network only")
        }
        Some(_) => match read_body(&mut request) {
            Ok(body) => {
                let url = request.url().to_string();
                let method = request.method().clone();
                debug!(%method, url = %url, "API request");
                dispatch(&method, &url, &body, engine, fired)
            }
            Err(err) => ApiReply::error(400, format!("{err:#}")),
        },
    };
    reply.send(request)
}

/// A fully built response, kept apart from the socket so handlers can be
/// exercised without a server.
#[derive(Debug)]
struct ApiReply {
    status: StatusCode,
    content_type: &'static str,
    body: String,
}

impl ApiReply {
    fn text(status: u16, body: &str) -> Self {
        Self {
            status: StatusCode(status),
            content_type: "text/plain; charset=utf-8",
            body: body.to_string(),
        }
    }

    fn json<T: Serialize>(status: u16, payload: &T) -> Self {
        match serde_json::to_string(payload) {
            Ok(body) => Self {
                status: StatusCode(status),
                content_type: "application/json; charset=utf-8",
                body,
            },
            Err(err) => Self::text(500, &format!("failed to encode response: {err}")),
        }
    }

    fn error(status: u16, error: String) -> Self {
        Self::json(status, &ErrorResponse { error })
    }

    fn alarm_error(err: AlarmError) -> Self {
        let status = match err {
            AlarmError::UnknownAlarm(_) => 404,
            AlarmError::InvalidTime(_) | AlarmError::InvalidDay(_) => 400,
        };
        Self::error(status, err.to_string())
    }

    fn lock_poisoned() -> Self {
        Self::text(500, "internal state lock error")
    }

    fn send(self, request: tiny_http::Request) -> Result<()> {
        let header = Header::from_bytes(&b"Content-Type"[..], self.content_type.as_bytes())
            .map_err(|_| anyhow!("failed to build content-type header"))?;
        let response = Response::from_string(self.body)
            .with_status_code(self.status)
            .with_header(header);
        request.respond(response)?;
        Ok(())
    }
}

fn dispatch<C>(
    method: &Method,
    url: &str,
    body: &str,
    engine: &Mutex<AlarmEngine<C>>,
    fired: &FiredLog,
) -> ApiReply
where
    C: Clock<Tz = Local>,
{
    let (path, query) = split_path_query(url);
    match route(method, path) {
        Route::Health => ApiReply::text(200, "ok"),
        Route::NotFound => ApiReply::text(404, "not found"),
        Route::MethodNotAllowed => ApiReply::text(405, "method not allowed"),
        Route::Fired => {
            #[derive(Serialize)]
            struct FiredResponse {
                count: usize,
                fired: Vec<FiredRecord>,
            }

            let fired = fired.recent();
            ApiReply::json(
                200,
                &FiredResponse {
                    count: fired.len(),
                    fired,
                },
            )
        }
        Route::State => {
            #[derive(Serialize)]
            #[serde(rename_all = "camelCase")]
            struct StateResponse {
                phase: &'static str,
                armed_target: Option<String>,
                next_due: Option<NextDueView>,
                alarm_count: usize,
                active_count: usize,
                persist_warning: Option<String>,
                server_time: String,
            }

            let Ok(guard) = engine.lock() else {
                return ApiReply::lock_poisoned();
            };
            let state = guard.state();
            let payload = StateResponse {
                phase: phase_label(state.phase),
                armed_target: state.armed_target.map(|dt| dt.to_rfc3339()),
                next_due: guard.next_due().map(|(at, alarms)| NextDueView {
                    at: at.to_rfc3339(),
                    alarm_ids: alarms.into_iter().map(|alarm| alarm.id).collect(),
                }),
                alarm_count: guard.list().len(),
                active_count: guard.list().iter().filter(|alarm| alarm.is_active).count(),
                persist_warning: guard.last_persist_error().map(str::to_string),
                server_time: guard.now().to_rfc3339(),
            };
            drop(guard);
            ApiReply::json(200, &payload)
        }
        Route::ListAlarms => {
            #[derive(Serialize)]
            struct AlarmsResponse {
                count: usize,
                alarms: Vec<AlarmView>,
            }

            let Ok(guard) = engine.lock() else {
                return ApiReply::lock_poisoned();
            };
            let alarms = guard
                .upcoming()
                .into_iter()
                .map(|(alarm, next)| AlarmView::new(&alarm, next))
                .collect::<Vec<_>>();
            drop(guard);
            ApiReply::json(
                200,
                &AlarmsResponse {
                    count: alarms.len(),
                    alarms,
                },
            )
        }
        Route::AddAlarm => {
            let definition = match serde_json::from_str::<AlarmDefinition>(body) {
                Ok(definition) => definition,
                Err(err) => return ApiReply::error(400, format!("invalid alarm: {err}")),
            };
            let Ok(mut guard) = engine.lock() else {
                return ApiReply::lock_poisoned();
            };
            let result = guard
                .add(&definition)
                .map(|alarm| AlarmView::at(&alarm, &guard.now()));
            drop(guard);
            match result {
                Ok(view) => ApiReply::json(201, &view),
                Err(err) => ApiReply::alarm_error(err),
            }
        }
        Route::ToggleAlarm(id) => {
            let Some(active) = query_param(query, "active").and_then(parse_bool) else {
                return ApiReply::error(
                    400,
                    "query parameter 'active' must be true or false".to_string(),
                );
            };
            let Ok(mut guard) = engine.lock() else {
                return ApiReply::lock_poisoned();
            };
            let result = guard.toggle(id, active).map(|()| {
                let now = guard.now();
                guard.get(id).map(|alarm| AlarmView::at(alarm, &now))
            });
            drop(guard);
            match result {
                Ok(Some(view)) => ApiReply::json(200, &view),
                Ok(None) => ApiReply::alarm_error(AlarmError::UnknownAlarm(id.to_string())),
                Err(err) => ApiReply::alarm_error(err),
            }
        }
        Route::DeleteAlarm(id) => {
            let Ok(mut guard) = engine.lock() else {
                return ApiReply::lock_poisoned();
            };
            let result = guard.delete(id);
            drop(guard);
            match result {
                Ok(alarm) => ApiReply::json(200, &AlarmView::new(&alarm, None)),
                Err(err) => ApiReply::alarm_error(err),
            }
        }
    }
}

fn phase_label(phase: SchedulerPhase) -> &'static str {
    match phase {
        SchedulerPhase::Idle => "idle",
        SchedulerPhase::Armed => "armed",
        SchedulerPhase::Firing => "firing",
    }
}

fn read_body(request: &mut tiny_http::Request) -> Result<String> {
    let mut body = String::new();
    request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
        .map_err(|err| anyhow!("unable to read request body: {err}"))?;
    Ok(body)
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if k == key {
            return Some(v);
        }
    }
    None
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Some(true),
        "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}
