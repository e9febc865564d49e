use std::sync::Arc;

use service::{DeveloperKey, ServiceHandler};

use codec::message::AgentInfo;

use crate::{config::Config, statistics::Statistics};

#[cfg(feature = "api")]
use serde_json::json;

/// Wires the service's lifecycle hooks to configuration-backed
/// authorization, logging, the statistics table and the api event stream.
#[derive(Clone)]
pub struct Observer {
    config: Arc<Config>,
    statistics: Statistics,
}

impl Observer {
    pub fn new(config: Arc<Config>, statistics: Statistics) -> Self {
        Self { config, statistics }
    }
}

impl ServiceHandler for Observer {
    fn authorize(&self, api_key: &str) -> Option<DeveloperKey> {
        self.config.auth.keys.get(api_key).map(|grant| DeveloperKey {
            key_id: grant.key_id.clone(),
            max_channels: grant.max_channels,
        })
    }

    fn on_channel_created(&self, channel_id: &str, channel_name: &str) {
        log::info!(
            "channel created: channel={:?}, name={:?}",
            channel_id,
            channel_name
        );

        #[cfg(feature = "api")]
        {
            crate::api::events::send_with_stream("channel-created", || {
                json!({
                    "channelId": channel_id,
                    "channelName": channel_name,
                })
            });
        }
    }

    fn on_channel_deleted(&self, channel_id: &str) {
        log::info!("channel deleted: channel={:?}", channel_id);

        #[cfg(feature = "api")]
        {
            crate::api::events::send_with_stream("channel-deleted", || {
                json!({
                    "channelId": channel_id,
                })
            });
        }
    }

    fn on_connected(&self, session_id: &str, channel_id: &str, agent: &AgentInfo) {
        log::info!(
            "connected: channel={:?}, agent={:?}, role={:?}",
            channel_id,
            agent.agent_name,
            agent.role
        );

        self.statistics.register(session_id);

        #[cfg(feature = "api")]
        {
            crate::api::events::send_with_stream("connected", || {
                json!({
                    "channelId": channel_id,
                    "agentName": agent.agent_name,
                    "role": agent.role,
                    "connectionTime": agent.connection_time,
                })
            });
        }
    }

    fn on_disconnected(
        &self,
        session_id: &str,
        channel_id: &str,
        agent: &AgentInfo,
        system_event: bool,
    ) {
        log::info!(
            "disconnected: channel={:?}, agent={:?}, system={}",
            channel_id,
            agent.agent_name,
            system_event
        );

        self.statistics.unregister(session_id);

        #[cfg(feature = "api")]
        {
            crate::api::events::send_with_stream("disconnected", || {
                json!({
                    "channelId": channel_id,
                    "agentName": agent.agent_name,
                    "systemEvent": system_event,
                })
            });
        }
    }
}
