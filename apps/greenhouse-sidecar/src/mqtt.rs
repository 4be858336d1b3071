use crate::config::Config;
use crate::pipeline::{EnqueueOutcome, PipelineHandle};
use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

pub async fn run_listener(
    config: Config,
    pipeline: PipelineHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let stats = pipeline.stats();

    while !cancel.is_cancelled() {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        if let Err(err) = client
            .subscribe(config.mqtt_topic.clone(), QoS::AtLeastOnce)
            .await
        {
            tracing::warn!(error=%err, "failed to subscribe to MQTT; retrying");
            backoff(&cancel, Duration::from_secs(2)).await;
            continue;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = client.try_disconnect();
                    stats.set_mqtt_connected(false);
                    tracing::info!("MQTT listener stopped");
                    return Ok(());
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        stats.set_mqtt_connected(true);
                        tracing::info!(
                            host=%config.mqtt_host,
                            port=config.mqtt_port,
                            "connected to MQTT broker"
                        );
                    }
                    Ok(Event::Incoming(Incoming::SubAck(_))) => {
                        tracing::info!(topic=%config.mqtt_topic, "subscribed to sensor feed");
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        route_publish(&pipeline, &publish.topic, publish.payload);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        stats.set_mqtt_connected(false);
                        tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                        break;
                    }
                }
            }
        }

        backoff(&cancel, Duration::from_secs(1)).await;
    }

    Ok(())
}

async fn backoff(cancel: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sleep(delay) => {}
    }
}

/// Never blocks the event loop: a full queue drops the message.
fn route_publish(pipeline: &PipelineHandle, topic: &str, payload: Bytes) -> Option<EnqueueOutcome> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        tracing::warn!(topic=%topic, "ignoring empty MQTT payload");
        return None;
    }
    Some(pipeline.try_enqueue(topic, payload, Utc::now()))
}
