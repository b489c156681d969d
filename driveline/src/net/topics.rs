use rumqttc::QoS;

use crate::config::Config;

/// Topic layout: `PREFIX/DEVICE_ID/2c/...` for device-to-cloud publishes,
/// `PREFIX/DEVICE_ID/2d/...` for cloud-to-device subscriptions.
#[derive(Debug, Clone)]
pub struct TopicSet {
    prefix: String,
    device_id: String,
    events_topic: String,
    alerts_topic: String,
    config_topic: String,
    services: Vec<ServiceTopic>,
}

#[derive(Debug, Clone)]
pub struct ServiceTopic {
    pub name: String,
    pub publish_topic: String,
    pub subscribe_topic: String,
    pub qos: QoS,
}

impl TopicSet {
    pub fn from_config(config: &Config, device_id: &str) -> TopicSet {
        let prefix = config.get_string("mqtt.topicPrefix", "");

        let events_suffix = config.get_string("mqtt.pubTopics.events.suffix", "/2c/events");
        let alerts_suffix = config.get_string("mqtt.pubTopics.alerts.suffix", "/2c/alerts");

        let mut services = Vec::new();
        if let serde_json::Value::Array(entries) = config.get_json("mqtt.servicesTopics") {
            for entry in entries {
                let Some(name) = entry.get("serviceName").and_then(|v| v.as_str()) else {
                    log::error!("Service topic entry without a serviceName, skipping");
                    continue;
                };
                let Some(publish) = entry.get("pub").and_then(|v| v.as_str()) else {
                    continue;
                };
                let Some(subscribe) = entry.get("sub").and_then(|v| v.as_str()) else {
                    continue;
                };
                let qos = entry.get("qos").and_then(|v| v.as_i64()).unwrap_or(1);
                services.push(ServiceTopic {
                    name: name.to_owned(),
                    publish_topic: format!("{prefix}{device_id}/{publish}"),
                    subscribe_topic: format!("{prefix}{device_id}/{subscribe}"),
                    qos: qos_from(qos),
                });
            }
        }

        TopicSet {
            events_topic: format!("{prefix}{device_id}{events_suffix}"),
            alerts_topic: format!("{prefix}{device_id}{alerts_suffix}"),
            config_topic: format!("{prefix}{device_id}/2d/config"),
            prefix,
            device_id: device_id.to_owned(),
            services,
        }
    }

    pub fn events_topic(&self) -> &str {
        &self.events_topic
    }

    pub fn alerts_topic(&self) -> &str {
        &self.alerts_topic
    }

    pub fn config_topic(&self) -> &str {
        &self.config_topic
    }

    pub fn vendor_events_topic(&self, vendor: &str) -> String {
        format!("{}{}/2c/{vendor}events", self.prefix, self.device_id)
    }

    pub fn vendor_alerts_topic(&self, vendor: &str) -> String {
        format!("{}{}/2c/{vendor}alerts", self.prefix, self.device_id)
    }

    /// Per-topic event rows carry a suffix routed under the device prefix.
    pub fn routed_topic(&self, suffix: &str) -> String {
        format!(
            "{}{}/{}",
            self.prefix,
            self.device_id,
            suffix.trim_start_matches('/')
        )
    }

    pub fn services(&self) -> &[ServiceTopic] {
        &self.services
    }

    /// Everything subscribed after CONNACK: the config push topic plus one
    /// topic per configured service.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        let mut topics = vec![(self.config_topic.clone(), QoS::AtLeastOnce)];
        for service in &self.services {
            topics.push((service.subscribe_topic.clone(), service.qos));
        }
        topics
    }
}

pub fn qos_from(value: i64) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topics() -> TopicSet {
        let config = Config::from_value(json!({
            "mqtt": {
                "topicPrefix": "haa/harman/dev/",
                "servicesTopics": [
                    { "serviceName": "RemoteOperation", "pub": "2c/ro", "sub": "2d/ro", "qos": 1 }
                ]
            }
        }));
        TopicSet::from_config(&config, "DEVICE1")
    }

    #[test]
    fn default_publish_topics() {
        let topics = topics();
        assert_eq!(topics.events_topic(), "haa/harman/dev/DEVICE1/2c/events");
        assert_eq!(topics.alerts_topic(), "haa/harman/dev/DEVICE1/2c/alerts");
        assert_eq!(topics.config_topic(), "haa/harman/dev/DEVICE1/2d/config");
    }

    #[test]
    fn vendor_variants() {
        let topics = topics();
        assert_eq!(
            topics.vendor_events_topic("acme"),
            "haa/harman/dev/DEVICE1/2c/acmeevents"
        );
        assert_eq!(
            topics.vendor_alerts_topic("acme"),
            "haa/harman/dev/DEVICE1/2c/acmealerts"
        );
    }

    #[test]
    fn service_topics_and_subscriptions() {
        let topics = topics();
        assert_eq!(topics.services().len(), 1);
        assert_eq!(
            topics.services()[0].publish_topic,
            "haa/harman/dev/DEVICE1/2c/ro"
        );

        let subs = topics.subscriptions();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].0, "haa/harman/dev/DEVICE1/2d/config");
        assert_eq!(subs[1].0, "haa/harman/dev/DEVICE1/2d/ro");
    }
}
