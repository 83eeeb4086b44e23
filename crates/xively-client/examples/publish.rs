//! Connects a device, listens on its command topic and publishes a
//! temperature reading every five seconds.
//!
//! Run with:
//! XIVELY_ACCOUNT_ID=... XIVELY_DEVICE_ID=... XIVELY_PASSWORD=... \
//!     cargo run -p xively-client --example publish -- [config.toml]

use std::env;

use log::{error, info, warn};
use xively_client::{Config, PublishCallback, QoS, Repeat, State, SubscriptionData, Xively};

fn required(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    env::var(name).map_err(|_| format!("{} is not set", name).into())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = env::args().nth(1).unwrap_or_else(|| "xively.toml".to_string());
    let config = Config::load(&path)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log.filter())).init();

    let account = required("XIVELY_ACCOUNT_ID")?;
    let device = required("XIVELY_DEVICE_ID")?;
    let password = required("XIVELY_PASSWORD")?;

    let mut xi = Xively::initialize(&account, &device)?
        .with_config(config)
        .with_password(password);
    let ctx = xi.create_context()?;

    xi.connect(
        ctx,
        Box::new(|xi, ctx, data, state| {
            if state != State::Ok {
                warn!("connection {:?}: {}", data.connection_state, state);
                return;
            }
            info!("connected to {}:{}", data.host, data.port);

            let commands = match xi.telemetry_topic("commands") {
                Ok(topic) => topic,
                Err(err) => {
                    error!("no command topic: {}", err);
                    return;
                }
            };
            let subscribed = xi.subscribe(
                ctx,
                &commands,
                QoS::AtLeastOnce,
                Box::new(|_xi, _ctx, data, state| match data {
                    SubscriptionData::Suback { topic, .. } => info!("{} on {}", state, topic),
                    SubscriptionData::Message { topic, payload, .. } => {
                        info!("command on {}: {}", topic, String::from_utf8_lossy(payload))
                    }
                }),
            );
            if let Err(err) = subscribed {
                error!("subscribe failed: {}", err);
            }
        }),
    )?;

    let mut reading = 20.0f32;
    xi.schedule_timed_task(
        ctx,
        Box::new(move |xi, ctx, _task| {
            if !xi.is_context_connected(ctx) {
                return;
            }
            reading += 0.5;
            let topic = match xi.telemetry_topic("temperature") {
                Ok(topic) => topic,
                Err(err) => {
                    error!("no telemetry topic: {}", err);
                    return;
                }
            };
            let callback: PublishCallback = Box::new(|_xi, _ctx, state| info!("reading delivered: {}", state));
            if let Err(err) = xi.publish_timeseries(ctx, &topic, reading, QoS::AtLeastOnce, Some(callback)) {
                warn!("publish failed: {}", err);
            }
        }),
        5,
        Repeat::Forever,
    )?;

    let state = xi.events_process_blocking();
    xi.shutdown();
    if state != State::Ok {
        return Err(state.into());
    }
    Ok(())
}
