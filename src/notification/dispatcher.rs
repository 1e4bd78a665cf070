use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::listener::ListenerRegistry;
use super::parse::{NotificationParser, ParseError, ParsedMessage};
use super::stats::NotificationStats;
use super::{MeasurementNotification, SourceIdentity};
use crate::attribute::{AttributeRegistry, DispatchReport};
use crate::cluster::DistributedCounter;
use crate::descriptor::keys;
use crate::metrics::now_millis;

/// Transport headers of one raw message.
pub type Headers = HashMap<String, String>;

/// Header carrying the notification message text.
pub const MESSAGE_HEADER: &str = "message";

/// Case-insensitive header lookup.
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Turns raw transport messages into stamped notifications and delivers
/// them to the attribute registry and the listeners of one resource.
pub struct NotificationDispatcher {
    resource: String,
    identity: SourceIdentity,
    parser: Arc<dyn NotificationParser>,
    counter: Arc<dyn DistributedCounter>,
    registry: Arc<AttributeRegistry>,
    listeners: Arc<ListenerRegistry>,
    stats: Arc<NotificationStats>,
    // Held from stamping until fan-out completes so every attribute sees
    // notifications in sequence order.
    delivery: tokio::sync::Mutex<()>,
}

impl NotificationDispatcher {
    pub fn new(
        identity: SourceIdentity,
        parser: Arc<dyn NotificationParser>,
        counter: Arc<dyn DistributedCounter>,
        registry: Arc<AttributeRegistry>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            resource: registry.resource().to_string(),
            identity,
            parser,
            counter,
            registry,
            listeners,
            stats: Arc::new(NotificationStats::new()),
            delivery: tokio::sync::Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn stats(&self) -> &Arc<NotificationStats> {
        &self.stats
    }

    /// Parses and delivers one raw message. Returns false when the message
    /// was dropped; drops are logged and never retried.
    pub async fn handle(&self, headers: &Headers, body: &[u8]) -> bool {
        self.stats.record_received();

        let parsed = match self.parser.parse(body) {
            Ok(Some(parsed)) => parsed,
            Ok(None) | Err(ParseError::EmptyPayload) => {
                debug!(resource = %self.resource, "ignored empty message");
                self.stats.record_dropped();
                return false;
            }
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "dropping unparseable message");
                self.stats.record_dropped();
                return false;
            }
        };

        let Some(notification) = self.resolve(headers, parsed) else {
            self.stats.record_dropped();
            return false;
        };

        self.deliver(notification).await.is_some()
    }

    /// Applies header and resource defaults to a parsed message. `None`
    /// when the message belongs to another component.
    fn resolve(&self, headers: &Headers, parsed: ParsedMessage) -> Option<MeasurementNotification> {
        let component_name = parsed
            .component_name
            .or_else(|| header(headers, keys::COMPONENT_NAME).map(str::to_string))
            .unwrap_or_else(|| self.identity.component_name.clone());
        if component_name != self.identity.component_name {
            debug!(
                resource = %self.resource,
                component = %component_name,
                "message for another component dropped",
            );
            return None;
        }

        let component_instance = parsed
            .component_instance
            .or_else(|| header(headers, keys::COMPONENT_INSTANCE).map(str::to_string))
            .unwrap_or_else(|| self.identity.component_instance.clone());
        let message = parsed
            .message
            .or_else(|| header(headers, MESSAGE_HEADER).map(str::to_string))
            .unwrap_or_default();

        Some(
            MeasurementNotification::new(
                SourceIdentity::new(component_name, component_instance),
                parsed.measurement,
            )
            .with_message(message)
            .with_timestamp(parsed.timestamp_ms.unwrap_or_else(now_millis)),
        )
    }

    /// Stamps a notification with the next cluster sequence number and
    /// fans it out. `None` if no sequence number could be obtained.
    pub async fn deliver(
        &self,
        mut notification: MeasurementNotification,
    ) -> Option<DispatchReport> {
        let _ordered = self.delivery.lock().await;

        notification.sequence = match self.counter.next_value().await {
            Ok(sequence) => sequence,
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "sequence counter unavailable, message dropped");
                self.stats.record_dropped();
                return None;
            }
        };

        let notification = Arc::new(notification);
        self.listeners.fire(Arc::clone(&notification)).await;
        let report = self.registry.dispatch(notification).await;
        self.stats.record_attribute_failures(report.failed);
        Some(report)
    }
}
