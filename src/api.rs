use std::{collections::HashMap, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::HeaderMap,
    response::{Sse, sse::KeepAlive},
    routing::{delete, get, post},
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use codec::message::{ApiKeyScope, EventMessage, ReceiveConfig};
use service::{ConnectRequest, Service, ServiceError};

use crate::{
    config::Config,
    observer::Observer,
    statistics::{Statistics, Stats},
};

pub struct ApiState {
    config: Arc<Config>,
    service: Service<Observer>,
    statistics: Statistics,
    uptime: Instant,
}

pub mod events {
    use std::sync::LazyLock;

    use axum::response::sse::Event;
    use serde::Serialize;
    use tokio::sync::broadcast::{Sender, channel};
    use tokio_stream::wrappers::BroadcastStream;

    static CHANNEL: LazyLock<Sender<Event>> = LazyLock::new(|| channel(10).0);

    pub fn get_event_stream() -> BroadcastStream<Event> {
        BroadcastStream::new(CHANNEL.subscribe())
    }

    pub fn send_with_stream<T, F>(event: &str, handle: F)
    where
        F: FnOnce() -> T,
        T: Serialize,
    {
        if CHANNEL.receiver_count() > 0 {
            if let Ok(event) = Event::default().event(event).json_data(handle()) {
                let _ = CHANNEL.send(event);
            }
        }
    }
}

/// Every operation answers inside the same wrapper; operational failures
/// ride in `statusMessage` with a 200, because clients branch on the
/// message text (`Agent session not found` triggers their reconnect).
fn success(data: impl Serialize) -> Json<Value> {
    Json(json!({
        "status": "success",
        "data": data,
    }))
}

fn failure(err: &ServiceError) -> Json<Value> {
    Json(json!({
        "status": "error",
        "statusMessage": err.to_string(),
    }))
}

fn respond<D: Serialize>(result: Result<D, ServiceError>) -> Json<Value> {
    match result {
        Ok(data) => success(data),
        Err(err) => failure(&err),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ConnectPayload {
    dev_api_key: String,
    api_key_scope: ApiKeyScope,
    channel_name: Option<String>,
    hashed_password: Option<String>,
    channel_id: Option<String>,
    session_id: Option<String>,
    agent_name: String,
    agent_type: String,
    descriptor: String,
    agent_context: HashMap<String, String>,
    role: String,
    custom_event_type: Option<String>,
    restricted_capabilities: Vec<String>,
    enable_webrtc_relay: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectPayload {
    session_id: String,
    #[serde(default)]
    async_disconnect: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendPayload {
    session_id: String,
    message: EventMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivePayload {
    session_id: String,
    #[serde(flatten)]
    config: ReceiveConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteChannelPayload {
    channel_id: String,
    dev_api_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: String,
}

/// Proxied deployments forward the client address; otherwise the field
/// stays empty and rosters simply omit it.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

pub fn router(config: Arc<Config>, service: Service<Observer>, statistics: Statistics) -> Router {
    let state = Arc::new(ApiState {
        config,
        service,
        statistics,
        uptime: Instant::now(),
    });

    Router::new()
        .route(
            "/connect",
            post(
                |State(state): State<Arc<ApiState>>, headers: HeaderMap, Json(payload): Json<ConnectPayload>| async move {
                    let request = ConnectRequest {
                        api_key: payload.dev_api_key,
                        scope: payload.api_key_scope,
                        channel_name: payload.channel_name,
                        hashed_password: payload.hashed_password,
                        channel_id: payload.channel_id,
                        session_id: payload.session_id,
                        agent_name: payload.agent_name,
                        agent_type: payload.agent_type,
                        descriptor: payload.descriptor,
                        ip_address: client_ip(&headers),
                        agent_context: payload.agent_context,
                        role: payload.role,
                        custom_event_type: payload.custom_event_type,
                        restricted_capabilities: payload.restricted_capabilities,
                        enable_relay: payload.enable_webrtc_relay,
                    };

                    match state.service.connect(request) {
                        Ok(response) => success(json!({
                            "sessionId": response.session_id,
                            "channelId": response.channel_id,
                            "date": response.date,
                            "state": response.state,
                            "iceServers": response.ice_servers,
                        })),
                        Err(err) => failure(&err),
                    }
                },
            ),
        )
        .route(
            "/disconnect",
            post(
                |State(state): State<Arc<ApiState>>, Json(payload): Json<DisconnectPayload>| async move {
                    // Page-unload beacons do not wait for the roster work.
                    if payload.async_disconnect {
                        let service = state.service.clone();
                        tokio::task::spawn_blocking(move || {
                            let _ = service.disconnect(&payload.session_id);
                        });

                        success(true)
                    } else {
                        respond(state.service.disconnect(&payload.session_id))
                    }
                },
            ),
        )
        .route(
            "/send",
            post(
                |State(state): State<Arc<ApiState>>, Json(payload): Json<SendPayload>| async move {
                    match state.service.send(&payload.session_id, payload.message) {
                        Ok(receipt) => {
                            state
                                .statistics
                                .add(&payload.session_id, &[Stats::SentEvents(1)]);

                            success(receipt)
                        }
                        Err(err) => {
                            state
                                .statistics
                                .add(&payload.session_id, &[Stats::ErrorCalls(1)]);

                            failure(&err)
                        }
                    }
                },
            ),
        )
        .route(
            "/receive",
            post(
                |State(state): State<Arc<ApiState>>, Json(payload): Json<ReceivePayload>| async move {
                    match state.service.receive(&payload.session_id, payload.config).await {
                        Ok(batch) => {
                            state.statistics.add(
                                &payload.session_id,
                                &[
                                    Stats::ReceivedEvents(batch.events.len()),
                                    Stats::ReceivedEphemerals(batch.ephemeral_events.len()),
                                ],
                            );

                            success(batch)
                        }
                        Err(err) => {
                            state
                                .statistics
                                .add(&payload.session_id, &[Stats::ErrorCalls(1)]);

                            failure(&err)
                        }
                    }
                },
            ),
        )
        .route(
            "/list-agents",
            get(
                |Query(query): Query<SessionQuery>, State(state): State<Arc<ApiState>>| async move {
                    respond(state.service.get_active_agents(&query.session_id))
                },
            ),
        )
        .route(
            "/list-system-agents",
            get(
                |Query(query): Query<SessionQuery>, State(state): State<Arc<ApiState>>| async move {
                    respond(state.service.get_system_agents(&query.session_id))
                },
            ),
        )
        .route(
            "/status",
            get(
                |Query(query): Query<SessionQuery>, State(state): State<Arc<ApiState>>| async move {
                    match state.service.status(&query.session_id) {
                        Ok(status) => {
                            let counts = state.statistics.get(&query.session_id);

                            success(json!({
                                "session": status,
                                "statistics": counts.map(|counts| json!({
                                    "sentEvents": counts.sent_events,
                                    "receivedEvents": counts.received_events,
                                    "receivedEphemerals": counts.received_ephemerals,
                                    "errorCalls": counts.error_calls,
                                })),
                            }))
                        }
                        Err(err) => failure(&err),
                    }
                },
            ),
        )
        .route(
            "/session/statistics",
            get(
                |Query(query): Query<SessionQuery>, State(state): State<Arc<ApiState>>| async move {
                    match state.statistics.get(&query.session_id) {
                        Some(counts) => success(json!({
                            "sentEvents": counts.sent_events,
                            "receivedEvents": counts.received_events,
                            "receivedEphemerals": counts.received_ephemerals,
                            "errorCalls": counts.error_calls,
                        })),
                        None => failure(&ServiceError::SessionNotFound),
                    }
                },
            ),
        )
        .route(
            "/channel/offsets",
            get(
                |Query(query): Query<ChannelQuery>, State(state): State<Arc<ApiState>>| async move {
                    respond(state.service.peek_channel_offsets(&query.channel_id))
                },
            ),
        )
        .route(
            "/channel",
            delete(
                |State(state): State<Arc<ApiState>>, Json(payload): Json<DeleteChannelPayload>| async move {
                    respond(
                        state
                            .service
                            .delete_channel(&payload.channel_id, &payload.dev_api_key),
                    )
                },
            ),
        )
        .route(
            "/info",
            get(|State(state): State<Arc<ApiState>>| async move {
                let limits = state.service.limits();

                success(json!({
                    "software": crate::SOFTWARE,
                    "uptime": state.uptime.elapsed().as_secs(),
                    "channels": state.service.channel_count(),
                    "sessions": state.service.session_count(),
                    "limits": {
                        "defaultReceiveLimit": limits.default_receive_limit,
                        "maxReceiveLimit": limits.max_receive_limit,
                        "longPollMs": limits.long_poll_ms,
                        "ephemeralTtlMs": limits.ephemeral_ttl_ms,
                        "sessionIdleTtlMs": limits.session_idle_ttl_ms,
                    },
                    "api": state.config.api.listen,
                }))
            }),
        )
        .route(
            "/events",
            get(|| async move {
                Sse::new(events::get_event_stream()).keep_alive(KeepAlive::default())
            }),
        )
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelQuery {
    channel_id: String,
}

/// start http server
///
/// Create an http server and start it; every broker operation is
/// reachable through it. The admin probes carry no authentication of
/// their own, do not expose this listener to an unsafe environment.
pub async fn start_server(
    config: Arc<Config>,
    service: Service<Observer>,
    statistics: Statistics,
) -> anyhow::Result<()> {
    let listen = config.api.listen;
    let app = router(config, service, statistics);

    let listener = TcpListener::bind(listen).await?;
    log::info!("api server listening={:?}", &listen);

    axum::serve(listener, app).await?;
    Ok(())
}
