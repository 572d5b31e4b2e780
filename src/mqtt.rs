use crate::registers::RegisterGroup;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, ClientError, Event, EventLoop, MqttOptions};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not queue a publish to `{1}`")]
    Publish(#[source] ClientError, String),
    #[error("could not queue a subscription to `{1}`")]
    Subscribe(#[source] ClientError, String),
    #[error("could not queue an unsubscription from `{1}`")]
    Unsubscribe(#[source] ClientError, String),
    #[error("could not queue the disconnect")]
    Disconnect(#[source] ClientError),
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "mqtt::Args")]
pub struct Args {
    /// Host name of the MQTT broker.
    #[arg(long, env = "MTEC_MQTT_HOST")]
    mqtt_host: String,

    #[arg(long, env = "MTEC_MQTT_PORT", default_value = "1883")]
    mqtt_port: u16,

    #[arg(long, env = "MTEC_MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "MTEC_MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    #[arg(long, env = "MTEC_MQTT_CLIENT_ID", default_value = "M-TEC-MQTT")]
    mqtt_client_id: String,

    #[arg(long, env = "MTEC_MQTT_KEEP_ALIVE", default_value = "30s")]
    mqtt_keep_alive: humantime::Duration,

    /// First segment of every published topic.
    #[arg(long, env = "MTEC_MQTT_TOPIC_ROOT", default_value = "MTEC")]
    pub topic_root: String,

    /// Number of decimals in published floating point values.
    #[arg(long, env = "MTEC_MQTT_FLOAT_PRECISION", default_value = "3")]
    pub float_precision: usize,
}

/// Outbound side of the message bus.
#[allow(async_fn_in_trait)]
pub trait MessageBus {
    async fn publish(&self, topic: String, payload: String, retain: bool) -> Result<(), Error>;
    async fn subscribe(&self, topic: &str) -> Result<(), Error>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), Error>;
    async fn disconnect(&self) -> Result<(), Error>;
}

/// An inbound publish, forwarded from the event loop to the poller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
}

#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
}

impl MqttClient {
    pub fn new(args: &Args) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&args.mqtt_client_id, &args.mqtt_host, args.mqtt_port);
        options
            .set_keep_alive(*args.mqtt_keep_alive)
            .set_clean_start(true);
        if let Some(username) = &args.mqtt_username {
            options.set_credentials(username, args.mqtt_password.as_deref().unwrap_or_default());
        }
        let (client, eventloop) = AsyncClient::new(options, 64);
        let client = Self {
            client,
            subscriptions: Default::default(),
        };
        (client, eventloop)
    }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-issue all subscriptions, as a clean session starts without any.
    fn resubscribe(&self) {
        let topics = self.subscriptions().iter().cloned().collect::<Vec<_>>();
        for topic in topics {
            if let Err(e) = self.client.try_subscribe(&topic, QoS::AtLeastOnce) {
                warn!(topic, err = %e, "could not restore subscription");
            }
        }
    }
}

/// Requests are queued without waiting: while the broker is unreachable the queue fills up and
/// further requests fail instead of stalling the caller.
impl MessageBus for MqttClient {
    async fn publish(&self, topic: String, payload: String, retain: bool) -> Result<(), Error> {
        debug!(topic, payload, retain, "publishing");
        self.client
            .try_publish(topic.clone(), QoS::AtMostOnce, retain, payload)
            .map_err(|e| Error::Publish(e, topic))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        if !self.subscriptions().insert(topic.to_string()) {
            return Ok(());
        }
        debug!(topic, "subscribing");
        // Remembered even when queueing fails, the next ConnAck restores it.
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| Error::Subscribe(e, topic.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        if !self.subscriptions().remove(topic) {
            return Ok(());
        }
        debug!(topic, "unsubscribing");
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| Error::Unsubscribe(e, topic.to_string()))
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let topics = self.subscriptions().iter().cloned().collect::<Vec<_>>();
        for topic in topics {
            if let Err(e) = self.unsubscribe(&topic).await {
                debug!(topic, err = %e, "could not unsubscribe");
            }
        }
        self.client.try_disconnect().map_err(Error::Disconnect)
    }
}

/// Poll the MQTT event loop until the client disconnects, forwarding inbound publishes.
///
/// Connection errors are logged and the loop keeps polling, which makes rumqttc reconnect.
pub async fn drive(mut eventloop: EventLoop, client: MqttClient, inbound: mpsc::UnboundedSender<Message>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to the MQTT broker");
                client.resubscribe();
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Ok(topic) = String::from_utf8(publish.topic.to_vec()) else {
                    warn!("ignoring a publish with a non-UTF-8 topic");
                    continue;
                };
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                debug!(topic, payload, "received");
                if inbound.send(Message { topic, payload }).is_err() {
                    return;
                }
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                info!("disconnected from the MQTT broker");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(err = %e, "MQTT connection failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Topic layout of one inverter: `<root>/<serial>/<group>/<param>/{state,set}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(root: &str, serial: &str) -> Self {
        Self {
            base: format!("{root}/{serial}"),
        }
    }

    pub fn state(&self, group: RegisterGroup, param: &str) -> String {
        format!("{}/{group}/{param}/state", self.base)
    }

    pub fn set(&self, group: RegisterGroup, param: &str) -> String {
        format!("{}/{group}/{param}/set", self.base)
    }

    /// Subscription filter matching the `set` topic of every parameter.
    pub fn set_filter(&self) -> String {
        format!("{}/+/+/set", self.base)
    }

    /// Parse a `set` topic back into its group and parameter name.
    pub fn parse_set<'t>(&self, topic: &'t str) -> Option<(RegisterGroup, &'t str)> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let group = parts.next()?.parse().ok()?;
        let param = parts.next()?;
        (parts.next()? == "set" && parts.next().is_none() && !param.is_empty())
            .then_some((group, param))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Set {
        group: RegisterGroup,
        param: String,
        value: String,
    },
    /// Birth or will message of the home automation server.
    HassStatus(String),
}

impl Command {
    pub fn try_from_message(
        message: Message,
        topics: &Topics,
        hass_status_topic: Option<&str>,
    ) -> Result<Self, Message> {
        if hass_status_topic == Some(message.topic.as_str()) {
            return Ok(Self::HassStatus(message.payload));
        }
        match topics.parse_set(&message.topic) {
            Some((group, param)) => Ok(Self::Set {
                group,
                param: param.to_string(),
                value: message.payload,
            }),
            None => Err(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, payload: &str) -> Message {
        Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
    }

    fn unreachable_broker() -> (MqttClient, EventLoop) {
        use clap::Parser as _;
        // Nothing listens on port 1; the event loop is never polled so the queue never drains.
        let args = Args::try_parse_from(["test", "--mqtt-host", "127.0.0.1", "--mqtt-port", "1"])
            .expect("valid arguments");
        MqttClient::new(&args)
    }

    #[tokio::test]
    async fn requests_fail_instead_of_waiting_for_the_broker() {
        let (client, _eventloop) = unreachable_broker();
        client.subscribe("MTEC/SN1/+/+/set").await.expect("queued");
        let attempts = tokio::time::timeout(Duration::from_secs(5), async {
            let mut failed = 0;
            for n in 0..200 {
                if client.publish(format!("MTEC/{n}"), "1".into(), false).await.is_err() {
                    failed += 1;
                }
            }
            failed
        })
        .await
        .expect("publishing does not block");
        assert!(attempts > 0);
        assert!(matches!(
            client.publish("MTEC/x".into(), "1".into(), false).await,
            Err(Error::Publish(_, topic)) if topic == "MTEC/x"
        ));
        // Disconnecting with a full queue reports the failure but still forgets the subscriptions.
        assert!(client.disconnect().await.is_err());
        assert!(client.subscriptions().is_empty());
    }

    #[test]
    fn topic_layout() {
        let topics = Topics::new("MTEC", "SN1");
        assert_eq!(
            topics.state(RegisterGroup::Base, "grid_power"),
            "MTEC/SN1/now-base/grid_power/state"
        );
        assert_eq!(topics.set(RegisterGroup::Config, "mode"), "MTEC/SN1/config/mode/set");
        assert_eq!(topics.set_filter(), "MTEC/SN1/+/+/set");
    }

    #[test]
    fn set_topics_parse_back() {
        let topics = Topics::new("MTEC", "SN1");
        assert_eq!(
            topics.parse_set("MTEC/SN1/config/mode/set"),
            Some((RegisterGroup::Config, "mode"))
        );
        assert_eq!(topics.parse_set("MTEC/SN1/config/mode/state"), None);
        assert_eq!(topics.parse_set("MTEC/SN2/config/mode/set"), None);
        assert_eq!(topics.parse_set("MTEC/SN1/bogus/mode/set"), None);
        assert_eq!(topics.parse_set("MTEC/SN1/config//set"), None);
        assert_eq!(topics.parse_set("MTEC/SN1/config/mode/set/extra"), None);
    }

    #[test]
    fn commands_from_messages() {
        let topics = Topics::new("MTEC", "SN1");
        let status = Some("homeassistant/status");
        assert_eq!(
            Command::try_from_message(message("homeassistant/status", "online"), &topics, status),
            Ok(Command::HassStatus("online".into()))
        );
        assert_eq!(
            Command::try_from_message(message("MTEC/SN1/config/mode/set", "UPS mode"), &topics, status),
            Ok(Command::Set {
                group: RegisterGroup::Config,
                param: "mode".into(),
                value: "UPS mode".into()
            })
        );
        assert!(
            Command::try_from_message(message("homeassistant/status", "online"), &topics, None)
                .is_err()
        );
    }
}
