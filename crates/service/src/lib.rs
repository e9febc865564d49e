//! ## Channel broker core
//!
//! Everything between the transport and the storage backends: channel
//! registry and offset allocation, session lifecycle, and the delivery
//! pipeline that merges the durable log with the ephemeral cache under
//! per-session watermarks.
//!
//! The crate is transport-agnostic; the embedding server supplies a
//! [`ServiceHandler`] for authorization and lifecycle callbacks, plus a
//! [`log::DurableLog`] backend. [`log::MemoryLog`] is the process-local
//! reference backend.

pub mod cache;
pub mod channels;
pub mod delivery;
pub mod error;
pub mod log;
pub mod sessions;

pub use self::{
    channels::{ChannelOffsetInfo, ChannelSnapshot},
    delivery::{EventBatch, SendReceipt},
    error::ServiceError,
    sessions::elect_host,
};

use std::{
    collections::HashMap,
    sync::Arc,
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use codec::{
    crypto,
    message::{AgentInfo, ApiKeyScope, BROADCAST, Envelope, EventType, IceServer},
};

use crate::{
    channels::{ChannelRegistry, ChannelState},
    log::DurableLog,
    sessions::{Session, SessionManager, Ticker, make_session_id},
};

/// Grant attached to an authorized developer api key.
#[derive(Debug, Clone)]
pub struct DeveloperKey {
    /// Stable identity mixed into private-scope channel derivation.
    pub key_id: String,
    /// Channel quota for this key.
    pub max_channels: usize,
}

/// Hooks the embedding server provides.
///
/// `authorize` gates every developer-authenticated operation; the `on_*`
/// callbacks mirror lifecycle transitions and default to no-ops. None of
/// them ever see message content.
pub trait ServiceHandler: Send + Sync {
    /// Resolve a developer api key to its grant; `None` rejects the call.
    fn authorize(&self, api_key: &str) -> Option<DeveloperKey>;

    #[allow(unused_variables)]
    fn on_channel_created(&self, channel_id: &str, channel_name: &str) {}

    #[allow(unused_variables)]
    fn on_channel_deleted(&self, channel_id: &str) {}

    #[allow(unused_variables)]
    fn on_connected(&self, session_id: &str, channel_id: &str, agent: &AgentInfo) {}

    /// `system_event` distinguishes reaper disconnects from client calls.
    #[allow(unused_variables)]
    fn on_disconnected(
        &self,
        session_id: &str,
        channel_id: &str,
        agent: &AgentInfo,
        system_event: bool,
    ) {
    }
}

/// Service tunables; the defaults match the documented configuration.
#[derive(Debug, Clone)]
pub struct Limits {
    pub default_receive_limit: usize,
    pub max_receive_limit: usize,
    pub long_poll_ms: u64,
    pub ephemeral_ttl_ms: u64,
    pub max_cache_size: usize,
    pub channel_default_age_ms: u64,
    pub session_idle_ttl_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            default_receive_limit: 50,
            max_receive_limit: 500,
            long_poll_ms: 40_000,
            ephemeral_ttl_ms: 30_000,
            max_cache_size: 1_024,
            channel_default_age_ms: 86_400_000,
            session_idle_ttl_ms: 90_000,
        }
    }
}

pub struct ServiceOptions<T> {
    pub handler: T,
    pub log: Arc<dyn DurableLog>,
    pub limits: Limits,
    /// Handed to connecting agents; entries with credentials are relay
    /// servers and are stripped unless the agent asked for relay support.
    pub ice_servers: Vec<IceServer>,
}

/// Connect inputs, already unmarshalled by the transport. Exactly one of
/// `channel_id`, `channel_name` or `session_id` (reattach) selects the
/// target.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub api_key: String,
    pub scope: ApiKeyScope,
    pub channel_name: Option<String>,
    pub hashed_password: Option<String>,
    pub channel_id: Option<String>,
    pub session_id: Option<String>,
    pub agent_name: String,
    pub agent_type: String,
    pub descriptor: String,
    pub ip_address: String,
    pub agent_context: HashMap<String, String>,
    pub role: String,
    pub custom_event_type: Option<String>,
    pub restricted_capabilities: Vec<String>,
    pub enable_relay: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub session_id: String,
    pub channel_id: String,
    pub date: u64,
    pub state: ChannelSnapshot,
    pub ice_servers: Vec<IceServer>,
}

/// Session/channel health as reported by `status`. Doubles as an explicit
/// keep-alive.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub agent: AgentInfo,
    pub channel: ChannelSnapshot,
    pub live_agents: usize,
    pub cached_ephemerals: usize,
}

pub(crate) struct ServiceInner<T> {
    pub(crate) handler: T,
    pub(crate) log: Arc<dyn DurableLog>,
    pub(crate) limits: Limits,
    pub(crate) ice_servers: Vec<IceServer>,
    pub(crate) channels: ChannelRegistry,
    pub(crate) sessions: SessionManager,
    pub(crate) ticker: Ticker,
}

/// Broker service facade. Cheap to clone; every clone shares the same
/// tables.
pub struct Service<T> {
    pub(crate) inner: Arc<ServiceInner<T>>,
}

impl<T> Clone for Service<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Service<T>
where
    T: ServiceHandler + 'static,
{
    pub fn new(options: ServiceOptions<T>) -> Self {
        let inner = Arc::new(ServiceInner {
            channels: ChannelRegistry::new(options.limits.max_cache_size),
            sessions: SessionManager::default(),
            ticker: Ticker::default(),
            handler: options.handler,
            log: options.log,
            limits: options.limits,
            ice_servers: options.ice_servers,
        });

        // Housekeeping: advance the coarse clock, reap idle sessions,
        // sweep caches and retention, drop abandoned channels. The thread
        // holds only a weak handle and winds down with the service.
        let weak = Arc::downgrade(&inner);
        thread::spawn(move || {
            while let Some(inner) = weak.upgrade() {
                let now = inner.ticker.advance();
                Service { inner }.housekeeping(now);

                thread::sleep(Duration::from_secs(1));
            }
        });

        Self { inner }
    }

    /// Attach an agent to a channel, creating the channel when the caller
    /// arrives by name with creation rights. Appends the CONNECT event
    /// that announces the join to the rest of the roster.
    pub fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, ServiceError> {
        let inner = &self.inner;
        let grant = inner
            .handler
            .authorize(&request.api_key)
            .ok_or(ServiceError::Unauthorized)?;

        // Reattach to a live session.
        if let Some(session_id) = &request.session_id {
            let session = inner
                .sessions
                .get(session_id)
                .ok_or(ServiceError::SessionNotFound)?;
            let handle = inner
                .channels
                .lookup(&session.channel_id)
                .ok_or(ServiceError::ChannelNotFound)?;

            session.touch(inner.ticker.now());
            return Ok(ConnectResponse {
                session_id: session.session_id.clone(),
                channel_id: session.channel_id.clone(),
                date: unix_ms(),
                state: handle.snapshot(),
                ice_servers: self.ice_servers_for(request.enable_relay),
            });
        }

        if request.agent_name.is_empty() {
            return Err(ServiceError::bad_request("agentName is required"));
        }

        let handle = if let Some(channel_id) = &request.channel_id {
            // Lookup by id never creates; the password-request flow joins
            // here without knowing the channel secret.
            inner
                .channels
                .lookup(channel_id)
                .ok_or(ServiceError::ChannelNotFound)?
        } else {
            let name = request
                .channel_name
                .as_deref()
                .ok_or_else(|| ServiceError::bad_request("channelName or channelId required"))?;
            let hashed = request.hashed_password.clone().unwrap_or_default();
            let channel_id = crypto::derive_channel_id(request.scope, &grant.key_id, name);

            match inner.channels.lookup(&channel_id) {
                Some(handle) => {
                    // The identity commits to the name alone; joining an
                    // existing channel stands or falls on the stored hash.
                    if !crypto::verify_password_hash(&handle.state().hashed_password, &hashed) {
                        return Err(ServiceError::Unauthorized);
                    }

                    handle
                }
                None => self.create_channel(&grant, request.scope, name, hashed)?,
            }
        };

        let allowed = &handle.state().allowed_agent_names;
        if !allowed.is_empty() && !allowed.contains(&request.agent_name) {
            return Err(ServiceError::Unauthorized);
        }

        let now_ms = unix_ms();
        let agent = AgentInfo {
            agent_name: request.agent_name,
            agent_type: request.agent_type,
            descriptor: request.descriptor,
            ip_address: request.ip_address,
            metadata: request.agent_context,
            role: request.role,
            custom_event_type: request.custom_event_type,
            restricted_capabilities: request.restricted_capabilities,
            connection_time: handle.next_connection_time(now_ms),
        };

        let session = Arc::new(Session::new(
            make_session_id(),
            handle.id().to_string(),
            agent.clone(),
            inner.ticker.now(),
        ));
        inner.sessions.insert(session.clone())?;

        // Join announcement; the only way peers learn about the arrival.
        let mut envelope = system_envelope(EventType::Connect, &agent, now_ms, false)?;
        if let Err(err) = self.append_with_retry(&handle, &mut envelope) {
            inner.sessions.remove(&session.session_id);
            return Err(err);
        }

        handle.touch(inner.ticker.now());
        inner
            .handler
            .on_connected(&session.session_id, handle.id(), &agent);

        Ok(ConnectResponse {
            session_id: session.session_id.clone(),
            channel_id: handle.id().to_string(),
            date: now_ms,
            state: handle.snapshot(),
            ice_servers: self.ice_servers_for(request.enable_relay),
        })
    }

    fn create_channel(
        &self,
        grant: &DeveloperKey,
        scope: ApiKeyScope,
        name: &str,
        hashed_password: String,
    ) -> Result<Arc<channels::ChannelHandle>, ServiceError> {
        let inner = &self.inner;

        // A password-less channel only makes sense when the developer key
        // already isolates it.
        if hashed_password.is_empty() && scope == ApiKeyScope::Public {
            return Err(ServiceError::Unauthorized);
        }

        if inner.channels.owned_by(&grant.key_id) >= grant.max_channels {
            return Err(ServiceError::QuotaExceeded);
        }

        let channel_id = crypto::derive_channel_id(scope, &grant.key_id, name);
        let head = inner.log.create(&channel_id)?;
        let (original_global, original_local) = head.unwrap_or((0, 0));

        let handle = inner.channels.create(
            ChannelState {
                channel_id: channel_id.clone(),
                channel_name: name.to_string(),
                hashed_password,
                dev_key_id: grant.key_id.clone(),
                topic_name: channel_id.clone(),
                created_at: unix_ms(),
                age_ms: inner.limits.channel_default_age_ms,
                public_channel: scope == ApiKeyScope::Public,
                allowed_agent_names: Vec::new(),
                original_global_offset: original_global,
                original_local_offset: original_local,
            },
            inner.ticker.now(),
        );

        inner.handler.on_channel_created(&channel_id, name);
        Ok(handle)
    }

    /// Detach a session. Idempotent: a missing session returns `false`
    /// without side effects.
    pub fn disconnect(&self, session_id: &str) -> Result<bool, ServiceError> {
        self.close_session(session_id, false)
    }

    pub(crate) fn close_session(
        &self,
        session_id: &str,
        system_event: bool,
    ) -> Result<bool, ServiceError> {
        let inner = &self.inner;
        let Some(session) = inner.sessions.remove(session_id) else {
            return Ok(false);
        };

        if let Some(handle) = inner.channels.lookup(&session.channel_id) {
            // Best effort: the roster is already updated, a log outage
            // must not keep the session half-alive.
            let now_ms = unix_ms();
            if let Ok(mut envelope) =
                system_envelope(EventType::Disconnect, &session.agent, now_ms, system_event)
            {
                let _ = self.append_with_retry(&handle, &mut envelope);
            }

            handle.touch(inner.ticker.now());
            // Wake in-flight long-polls so they observe the closed flag.
            handle.notify_waiters();
        }

        inner.handler.on_disconnected(
            &session.session_id,
            &session.channel_id,
            &session.agent,
            system_event,
        );

        Ok(true)
    }

    /// Tear down a channel: sessions dropped, cache evicted, log
    /// destroyed. Idempotent; the second call returns `false`.
    pub fn delete_channel(&self, channel_id: &str, api_key: &str) -> Result<bool, ServiceError> {
        let inner = &self.inner;
        let grant = inner
            .handler
            .authorize(api_key)
            .ok_or(ServiceError::Unauthorized)?;

        let Some(handle) = inner.channels.lookup(channel_id) else {
            return Ok(false);
        };

        if handle.state().dev_key_id != grant.key_id {
            return Err(ServiceError::Unauthorized);
        }

        self.teardown_channel(&handle);
        Ok(true)
    }

    fn teardown_channel(&self, handle: &channels::ChannelHandle) {
        let inner = &self.inner;

        inner.channels.remove(handle.id());
        for session in inner.sessions.drop_channel(handle.id()) {
            inner.handler.on_disconnected(
                &session.session_id,
                &session.channel_id,
                &session.agent,
                true,
            );
        }

        handle.notify_waiters();
        let _ = inner.log.destroy(handle.topic());
        inner.handler.on_channel_deleted(handle.id());
    }

    /// Full roster of the session's channel, system agents included.
    pub fn get_active_agents(&self, session_id: &str) -> Result<Vec<AgentInfo>, ServiceError> {
        let session = self.live_session(session_id)?;
        Ok(self.inner.sessions.roster(&session.channel_id))
    }

    /// Only the broker-side helper sessions (`system-*` roles).
    pub fn get_system_agents(&self, session_id: &str) -> Result<Vec<AgentInfo>, ServiceError> {
        let session = self.live_session(session_id)?;
        Ok(self
            .inner
            .sessions
            .roster(&session.channel_id)
            .into_iter()
            .filter(|agent| agent.is_system())
            .collect())
    }

    pub fn status(&self, session_id: &str) -> Result<SessionStatus, ServiceError> {
        let session = self.live_session(session_id)?;
        let handle = self
            .inner
            .channels
            .lookup(&session.channel_id)
            .ok_or(ServiceError::ChannelNotFound)?;

        Ok(SessionStatus {
            session_id: session.session_id.clone(),
            agent: session.agent.clone(),
            channel: handle.snapshot(),
            live_agents: self.inner.sessions.channel_len(&session.channel_id),
            cached_ephemerals: handle.cache().len(),
        })
    }

    /// Registry self-check projection for one channel.
    pub fn peek_channel_offsets(&self, channel_id: &str) -> Result<ChannelOffsetInfo, ServiceError> {
        let handle = self
            .inner
            .channels
            .lookup(channel_id)
            .ok_or(ServiceError::ChannelNotFound)?;

        handle.self_check(self.inner.log.as_ref())
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn limits(&self) -> &Limits {
        &self.inner.limits
    }

    pub(crate) fn live_session(&self, session_id: &str) -> Result<Arc<Session>, ServiceError> {
        let session = self
            .inner
            .sessions
            .get(session_id)
            .ok_or(ServiceError::SessionNotFound)?;

        session.touch(self.inner.ticker.now());
        Ok(session)
    }

    pub(crate) fn append_with_retry(
        &self,
        handle: &channels::ChannelHandle,
        envelope: &mut Envelope,
    ) -> Result<(u64, u64), ServiceError> {
        let mut attempts = 0;
        loop {
            match handle.append_durable(self.inner.log.as_ref(), envelope) {
                Err(ServiceError::Transient(_)) if attempts < 2 => attempts += 1,
                other => return other,
            }
        }
    }

    fn ice_servers_for(&self, enable_relay: bool) -> Vec<IceServer> {
        self.inner
            .ice_servers
            .iter()
            .filter(|server| enable_relay || !server.is_relay())
            .cloned()
            .collect()
    }

    fn housekeeping(&self, now: u64) {
        let inner = &self.inner;
        let idle_ttl_ticks = (inner.limits.session_idle_ttl_ms / 1_000).max(1);

        for session in inner.sessions.idle(now, idle_ttl_ticks) {
            let _ = self.close_session(&session.session_id, true);
        }

        let now_ms = unix_ms();
        for handle in inner.channels.all() {
            handle.cache().sweep(now_ms, inner.limits.ephemeral_ttl_ms);
            let _ = inner
                .log
                .sweep(handle.topic(), now_ms.saturating_sub(handle.state().age_ms));

            // Abandoned channels go the same way as idle sessions.
            let idle_ms = handle.idle_ticks(now).saturating_mul(1_000);
            if inner.sessions.channel_len(handle.id()) == 0 && idle_ms >= handle.state().age_ms {
                self.teardown_channel(&handle);
            }
        }
    }
}

/// CONNECT/DISCONNECT announcement carrying the roster projection of the
/// affected agent. Built by the broker, so serialization cannot be
/// influenced by client payloads.
fn system_envelope(
    kind: EventType,
    agent: &AgentInfo,
    now_ms: u64,
    system_event: bool,
) -> Result<Envelope, ServiceError> {
    Ok(Envelope {
        from: agent.agent_name.clone(),
        to: Some(BROADCAST.to_string()),
        filter: None,
        kind,
        custom_type: None,
        encrypted: false,
        content: serde_json::to_string(agent).map_err(|err| ServiceError::transient(err.to_string()))?,
        date: now_ms,
        global_offset: 0,
        local_offset: None,
        ephemeral: false,
        system_event,
    })
}

pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
