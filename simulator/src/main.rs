mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use telemetry::{generate_telemetry, respond, CommandMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Simulates a fleet of air-quality sensors talking to the bridge.
#[derive(Debug, Parser)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "TOPIC_PREFIX", default_value = "airsense")]
    prefix: String,

    /// Telemetry messages per second across all devices
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// Fraction of commands left unanswered, to exercise bridge timeouts
    #[arg(long, env = "DROP_RATE", default_value_t = 0.1)]
    drop_rate: f64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    info!("Starting AirSense device simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}, Drop rate: {}",
        args.broker, args.port, args.rate, args.devices, args.drop_rate
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);
    let (command_tx, command_rx) = mpsc::channel::<(String, CommandMessage)>(1000);

    let command_filter = format!("{}/+/command", args.prefix);
    let subscriber = client.clone();
    let prefix = args.prefix.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Err(e) = subscriber.try_subscribe(command_filter.as_str(), QoS::AtLeastOnce) {
                        error!("Failed to subscribe to {}: {}", command_filter, e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(device_id) = command_device(&prefix, &publish.topic) else {
                        continue;
                    };
                    match serde_json::from_slice::<CommandMessage>(&publish.payload) {
                        Ok(command) => {
                            if command_tx.try_send((device_id.to_string(), command)).is_err() {
                                warn!("Command backlog full, dropping command");
                            }
                        }
                        Err(e) => warn!("Unparsable command on {}: {}", publish.topic, e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    tokio::spawn(answer_commands(
        client.clone(),
        args.prefix.clone(),
        args.drop_rate,
        command_rx,
    ));

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish telemetry");
    publish_telemetry(&client, &args).await;
}

async fn publish_telemetry(client: &AsyncClient, args: &Args) {
    let mut rng = rand::thread_rng();
    let mut counter = 0u64;

    const BURST_SIZE: usize = 200;
    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / args.rate.max(1));

    info!(
        "Publishing in bursts of {} messages every {:?}",
        BURST_SIZE, burst_interval
    );

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let device_id = format!("dev-{}", counter % args.devices.max(1) as u64);
            let telemetry = generate_telemetry(&mut rng, device_id);

            let topic = format!("{}/{}/telemetry", args.prefix, telemetry.device_id);
            let payload = match serde_json::to_string(&telemetry) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize telemetry: {}", e);
                    continue;
                }
            };

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => {
                    counter += 1;
                }
                Err(e) => {
                    warn!("Failed to publish: {}", e);
                }
            }
        }

        if counter % 10000 == 0 {
            info!("Published {} messages", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - system may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}

async fn answer_commands(
    client: AsyncClient,
    prefix: String,
    drop_rate: f64,
    mut rx: mpsc::Receiver<(String, CommandMessage)>,
) {
    while let Some((device_id, command)) = rx.recv().await {
        let drop = rand::thread_rng().gen_bool(drop_rate.clamp(0.0, 1.0));
        if drop {
            debug!(device_id = %device_id, command_id = %command.command_id, "Ignoring command");
            continue;
        }

        let response = respond(&command);
        let topic = format!("{}/{}/response/{}", prefix, device_id, command.command_id);
        let payload = match serde_json::to_vec(&response) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize response: {}", e);
                continue;
            }
        };

        match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            Ok(()) => info!(
                device_id = %device_id,
                command_id = %command.command_id,
                action = %command.action,
                status = response.status,
                "Answered command"
            ),
            Err(e) => warn!("Failed to publish response: {}", e),
        }
    }
}

fn command_device<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(prefix)?
        .strip_prefix('/')?
        .strip_suffix("/command")
        .filter(|device_id| !device_id.is_empty() && !device_id.contains('/'))
}
