use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, Notifier};
use crate::config::MqttConfig;
use crate::errors::{Result, MonitorError};

/// Publishes alerts as JSON to `<base_topic>/cameras/<camera_id>/alerts`
#[derive(Clone)]
pub struct MqttAlertPublisher {
    client: AsyncClient,
    base_topic: String,
    qos: QoS,
    retain: bool,
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub fn alert_topic(base_topic: &str, camera_id: &str) -> String {
    format!("{}/cameras/{}/alerts", base_topic.trim_end_matches('/'), camera_id)
}

impl MqttAlertPublisher {
    /// Connect and spawn the event loop driver
    pub fn start(config: &MqttConfig) -> Result<Self> {
        let url = url::Url::parse(&config.broker_url)
            .map_err(|e| MonitorError::mqtt(format!("Invalid MQTT broker URL '{}': {}", config.broker_url, e)))?;

        let host = url.host_str()
            .ok_or_else(|| MonitorError::mqtt(format!("No host found in MQTT broker URL: {}", config.broker_url)))?;

        let port = url.port().unwrap_or(1883);

        info!("Connecting to MQTT broker at {}:{}", host, port);

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        tokio::spawn(drive_event_loop(eventloop));

        Ok(Self {
            client,
            base_topic: config.base_topic.clone(),
            qos: qos_from_level(config.qos),
            retain: config.retain,
        })
    }
}

async fn drive_event_loop(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Disconnected from MQTT broker");
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

impl Notifier for MqttAlertPublisher {
    fn notify(&self, alert: &Alert) -> Result<()> {
        let topic = alert_topic(&self.base_topic, &alert.camera_id);
        let payload = serde_json::to_vec(alert)?;
        debug!("Publishing alert {} to {}", alert.detection_id, topic);
        self.client
            .try_publish(topic, self.qos, self.retain, payload)
            .map_err(|e| MonitorError::mqtt(format!("Failed to publish alert: {}", e)))
    }
}
