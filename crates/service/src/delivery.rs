//! Delivery pipeline: `send` routing into the durable log or the
//! ephemeral cache, and `receive` assembly merging both under the
//! session's watermarks with long-poll support.

use std::{pin::pin, time::Duration};

use serde::Serialize;
use tokio::time::{Instant, timeout_at};

use codec::{
    Filter,
    message::{AgentInfo, BROADCAST, Envelope, EventMessage, EventType, PollSource, ReceiveConfig},
};

use crate::{
    ChannelSnapshot, Service, ServiceHandler,
    error::ServiceError,
    unix_ms,
};

/// Result of a successful `send`: the assigned offsets plus a channel
/// snapshot for the client's bookkeeping.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub global_offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_offset: Option<u64>,
    pub date: u64,
    pub state: ChannelSnapshot,
}

/// Result of a `receive`: filtered durable and ephemeral batches plus the
/// offsets to resume from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    pub events: Vec<Envelope>,
    pub ephemeral_events: Vec<Envelope>,
    pub next_global_offset: u64,
    pub next_local_offset: u64,
}

impl<T> Service<T>
where
    T: ServiceHandler + 'static,
{
    /// Route an event into the channel of the sender's session.
    ///
    /// The broker stamps `from` itself and assigns offsets; `content`
    /// passes through byte for byte.
    pub fn send(&self, session_id: &str, message: EventMessage) -> Result<SendReceipt, ServiceError> {
        let inner = &self.inner;
        let session = self.live_session(session_id)?;
        let handle = inner
            .channels
            .lookup(&session.channel_id)
            .ok_or(ServiceError::ChannelNotFound)?;
        handle.touch(inner.ticker.now());

        let kind = message
            .kind
            .ok_or_else(|| ServiceError::bad_request("missing event type"))?;
        validate_addressing(&message)?;

        let now_ms = unix_ms();
        let mut envelope = Envelope {
            from: session.agent.agent_name.clone(),
            to: message.to,
            filter: message.filter,
            kind,
            custom_type: message.custom_type,
            encrypted: message.encrypted,
            content: message.content,
            date: now_ms,
            global_offset: 0,
            local_offset: None,
            ephemeral: message.ephemeral,
            system_event: false,
        };

        let (global_offset, local_offset) = if message.ephemeral {
            (handle.put_ephemeral(&mut envelope, now_ms), None)
        } else {
            let (global, local) = self.append_with_retry(&handle, &mut envelope)?;
            (global, Some(local))
        };

        Ok(SendReceipt {
            global_offset,
            local_offset,
            date: now_ms,
            state: handle.snapshot(),
        })
    }

    /// Read events strictly after the caller's offsets, blocking up to the
    /// poll budget when nothing is visible yet.
    ///
    /// Receives of one session are serialized on its read lock, which is
    /// what makes the ephemeral watermark advance idempotent. Anchors move
    /// past filtered-out events too, so a resuming caller never re-scans
    /// traffic that was addressed elsewhere.
    pub async fn receive(
        &self,
        session_id: &str,
        config: ReceiveConfig,
    ) -> Result<EventBatch, ServiceError> {
        let inner = &self.inner;
        let session = self.live_session(session_id)?;
        let handle = inner
            .channels
            .lookup(&session.channel_id)
            .ok_or(ServiceError::ChannelNotFound)?;
        handle.touch(inner.ticker.now());

        let limit = config
            .limit
            .unwrap_or(inner.limits.default_receive_limit)
            .min(inner.limits.max_receive_limit);

        let wait_ms = match config.poll_source {
            PollSource::Poll => 0,
            PollSource::Auto | PollSource::Blocking => inner.limits.long_poll_ms,
        };
        let deadline = Instant::now() + Duration::from_millis(wait_ms);

        let state = handle.state();
        let (mut from_global, mut from_local) = (
            config.global_offset.unwrap_or(state.original_global_offset),
            config.local_offset.unwrap_or(state.original_local_offset),
        );

        let mut read = session.read.lock().await;

        loop {
            // Arm the wakeup before reading so an append racing the reads
            // cannot be missed.
            let mut notified = pin!(handle.notify().notified());
            notified.as_mut().enable();

            if session.is_closed() {
                return Err(ServiceError::SessionNotFound);
            }

            let raw_durable = if limit == 0 {
                Vec::new()
            } else {
                inner
                    .log
                    .read_range(handle.topic(), from_global, from_local, limit)?
            };
            let window_full = limit != 0 && raw_durable.len() == limit;

            let (raw_ephemeral, watermark) =
                handle.cache().read_since(read.last_ephemeral_watermark);

            if let Some(last) = raw_durable.last() {
                from_global = last.global_offset;
                if let Some(local) = last.local_offset {
                    from_local = local;
                }
            }

            if watermark > read.last_ephemeral_watermark {
                read.last_ephemeral_watermark = watermark;
            }

            let events: Vec<Envelope> = raw_durable
                .into_iter()
                .filter(|event| visible_to(event, &session.agent))
                .collect();
            let ephemeral_events: Vec<Envelope> = raw_ephemeral
                .into_iter()
                .filter(|event| visible_to(event, &session.agent))
                .collect();

            if !events.is_empty()
                || !ephemeral_events.is_empty()
                || wait_ms == 0
                || Instant::now() >= deadline
            {
                read.last_persistence_read_ms = unix_ms();
                return Ok(EventBatch {
                    events,
                    ephemeral_events,
                    next_global_offset: from_global,
                    next_local_offset: from_local,
                });
            }

            // Everything read so far was addressed elsewhere. If the
            // window was full the log may hold more already; otherwise
            // sleep until the channel moves or the budget runs out.
            if window_full {
                continue;
            }

            let _ = timeout_at(deadline, notified).await;
        }
    }
}

/// `to` and `filter` are mutually exclusive, and `to` takes an exact
/// agent name or `*` only. The legacy quoted-regex recipient form is
/// rejected; the `filter` field covers those callers.
fn validate_addressing(message: &EventMessage) -> Result<(), ServiceError> {
    if message.to.is_some() && message.filter.is_some() {
        return Err(ServiceError::bad_request(
            "`to` and `filter` are mutually exclusive",
        ));
    }

    if let Some(to) = &message.to {
        if to.len() >= 2 && to.starts_with('"') && to.ends_with('"') {
            return Err(ServiceError::bad_request(
                "regex recipients are not supported, use `filter`",
            ));
        }
    }

    if let Some(filter) = &message.filter {
        filter
            .parse::<Filter>()
            .map_err(|err| ServiceError::bad_request(format!("invalid filter: {err}")))?;
    }

    Ok(())
}

/// Per-session delivery decision.
///
/// Lifecycle and chat kinds bypass the custom type gate; a CUSTOM event
/// must match the session's subscribed custom type when one is set. Own
/// echoes are suppressed except for lifecycle events and self-addressed
/// sends. Addressing then selects by exact name, broadcast, or filter
/// match against the session's roster projection.
pub(crate) fn visible_to(envelope: &Envelope, agent: &AgentInfo) -> bool {
    // Always-delivered kinds skip the type gate; of the rest, CUSTOM is
    // held against the session's subscription when one is set.
    if !envelope.kind.always_delivered() {
        if envelope.kind == EventType::Custom {
            if let Some(expected) = &agent.custom_event_type {
                if envelope.custom_type.as_deref() != Some(expected.as_str()) {
                    return false;
                }
            }
        }
    }

    if envelope.from == agent.agent_name {
        return matches!(envelope.kind, EventType::Connect | EventType::Disconnect)
            || envelope.to.as_deref() == Some(agent.agent_name.as_str());
    }

    if let Some(to) = &envelope.to {
        return to == BROADCAST || *to == agent.agent_name;
    }

    if let Some(filter) = &envelope.filter {
        return filter
            .parse::<Filter>()
            .map(|filter| filter.matches(agent))
            .unwrap_or(false);
    }

    true
}
