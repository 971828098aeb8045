//! Application supervisor.
//!
//! Wires the bike driver, pipeline, pedal simulator, BLE servers, ANT+
//! broadcaster and heart-rate relay together, owns every timer, and turns
//! failures into the documented exit codes: 0 for a clean stop or a bike
//! gone quiet, 1 for anything unrecoverable.

use std::time::Duration;

use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use crate::ant::{AntStick, PowerBroadcast};
use crate::ble::adapter::{adapter_index, AdapterCapabilities, AdapterPlan};
use crate::ble::connect::ConnectOptions;
use crate::ble::DeviceFilter;
use crate::bike::{self, BikeClient, BikeError, BikeEvent, BikeKind};
use crate::config::Settings;
use crate::heart_rate::{HeartRateClient, HrEvent};
use crate::pipeline::{
    CalibratedSample, CrankCounter, PedalSimulator, PowerCalibration, PowerPipeline, PowerSmoother,
    WheelCounter,
};
use crate::server::{GattServer, MultiServer};

/// Scan window for bike autodetection.
const AUTODETECT_WINDOW: Duration = Duration::from_secs(30);

/// Run the bridge until shutdown; returns the process exit code.
pub async fn run(settings: Settings) -> anyhow::Result<i32> {
    let caps = AdapterCapabilities::from_env();
    tracing::debug!(
        "radio capabilities: multi-role={} extended-scan={}",
        caps.multi_role,
        caps.extended_scan
    );
    let plan = AdapterPlan::new(
        &settings.bike_adapter,
        &settings.server_adapter_list(),
        settings.heart_rate_adapter.as_deref(),
        caps.multi_role,
    )?;
    plan.export_env()?;

    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    anyhow::ensure!(!adapters.is_empty(), "no Bluetooth adapter available");
    let bike_adapter = pick_adapter(&adapters, &plan.bike);

    let mut kind: BikeKind = settings
        .bike
        .parse()
        .map_err(|err: String| anyhow::anyhow!(err))?;
    if kind == BikeKind::Autodetect {
        kind = bike::autodetect(
            bike_adapter,
            &settings.peloton_path,
            AUTODETECT_WINDOW,
            BikeKind::Keiser,
        )
        .await?;
    }
    tracing::info!("bike type: {}", kind);

    let (bike_tx, mut bike_events) = mpsc::channel::<BikeEvent>(64);
    let connect_opts = ConnectOptions::default();
    let connect_deadline = Duration::from_secs_f64(settings.bike_connect_timeout);
    let client = match tokio::time::timeout(
        connect_deadline,
        create_bike(kind, &settings, bike_adapter, &connect_opts, bike_tx.clone()),
    )
    .await
    {
        Ok(Ok(client)) => client,
        Ok(Err(err)) => {
            tracing::error!("bike connection failed: {}", err);
            return Ok(1);
        }
        Err(_) => {
            tracing::error!(
                "bike did not connect within {:.0}s",
                settings.bike_connect_timeout
            );
            return Ok(1);
        }
    };

    let mut servers = MultiServer::new(
        plan.servers
            .iter()
            .map(|(name, _)| GattServer::new(&settings.server_name, Some(name.as_str())))
            .collect(),
    );
    match servers.start().await {
        Ok(started) => tracing::info!("{} server adapter(s) up", started),
        Err(err) => {
            tracing::error!("{}", err);
            client.disconnect().await;
            return Ok(1);
        }
    }

    let mut ant_broadcast = if settings.ant_plus {
        let device_id = settings.ant_device_id;
        match tokio::task::spawn_blocking(move || AntStick::open(device_id)).await? {
            Ok(stick) => Some(PowerBroadcast::start(stick)),
            Err(crate::ant::AntError::NoStickFound) => {
                tracing::info!("no ANT+ stick present");
                None
            }
            Err(err) => {
                tracing::warn!("ANT+ disabled: {}", err);
                None
            }
        }
    } else {
        None
    };

    let (hr_tx, mut hr_events) = mpsc::channel::<HrEvent>(16);
    let hr_client = start_heart_rate(&settings, &caps, &adapters, &plan, hr_tx.clone()).await;

    let mut power_pipeline = PowerPipeline::new(
        PowerCalibration::new(settings.power_scale, settings.power_offset),
        PowerSmoother::default(),
    );
    let (pedal, mut pedal_events) = PedalSimulator::spawn();
    let start = Instant::now();
    let mut crank = CrankCounter::new(start);
    let mut wheel = WheelCounter::new(start, settings.speed_circumference);
    let mut has_wheel = false;
    let mut current = CalibratedSample::default();

    let mut ping = interval(Duration::from_secs_f64(settings.server_ping_interval));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let receive_timeout = Duration::from_secs_f64(settings.bike_receive_timeout);
    let mut receive_deadline = Instant::now() + receive_timeout;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let exit_code = loop {
        tokio::select! {
            event = bike_events.recv() => match event {
                Some(BikeEvent::Sample(sample)) => {
                    receive_deadline = Instant::now() + receive_timeout;
                    current.power_w = power_pipeline.process(sample.power_w);
                    current.cadence_rpm = sample.cadence_rpm;
                    current.speed_mps = sample
                        .speed_mps
                        .map(|speed| clamp_speed(speed, &settings));
                    pedal.set_cadence(sample.cadence_rpm);
                    if let Some(speed) = current.speed_mps {
                        if wheel.advance(speed as f64, Instant::now()).is_some() && !has_wheel {
                            has_wheel = true;
                            servers.ensure_csc_capabilities(true).await;
                        }
                    }
                    if let Some(ant) = &ant_broadcast {
                        ant.update(current.power_w, current.cadence_rpm);
                    }
                }
                Some(BikeEvent::Disconnect { address }) => {
                    tracing::warn!("bike {} disconnected", address);
                    break 0;
                }
                None => break 0,
            },
            stroke = pedal_events.recv() => {
                let Some(at) = stroke else { break 0 };
                // The crank counter advances before the keep-alive timer is
                // touched, so a ping can never overtake this stroke.
                let event = crank.stroke(at);
                servers.update_power(current.power_w as i16, &event).await;
                servers
                    .update_csc(wheel.current().filter(|_| has_wheel), Some(event))
                    .await;
                ping.reset();
            }
            hr = hr_events.recv() => match hr {
                Some(HrEvent::Sample(sample)) => servers.update_heart_rate(sample.bpm).await,
                Some(HrEvent::Disconnect { address }) => {
                    tracing::warn!("heart-rate monitor {} disconnected", address);
                }
                None => {}
            },
            _ = ping.tick() => {
                let event = crank.current();
                servers.update_power(current.power_w as i16, &event).await;
                servers
                    .update_csc(wheel.current().filter(|_| has_wheel), Some(event))
                    .await;
            }
            _ = sleep_until(receive_deadline) => {
                tracing::warn!(
                    "no bike data for {:.0}s, exiting",
                    settings.bike_receive_timeout
                );
                break 0;
            }
            _ = sigint.recv() => {
                tracing::info!("interrupted, shutting down");
                break 0;
            }
            _ = sigterm.recv() => {
                tracing::info!("terminated, shutting down");
                break 0;
            }
        }
    };

    // Timers die with this scope; ingress teardown runs in parallel and
    // failures only get logged.
    pedal.stop();
    let hr_teardown = async {
        if let Some(hr) = &hr_client {
            hr.disconnect().await;
        }
    };
    tokio::join!(client.disconnect(), hr_teardown);
    servers.stop().await;
    if let Some(ant) = &mut ant_broadcast {
        ant.stop();
    }
    drop(hr_tx);
    drop(bike_tx);

    Ok(exit_code)
}

/// Adapter whose hci index matches `name`, or the first one.
fn pick_adapter<'a>(adapters: &'a [Adapter], name: &str) -> &'a Adapter {
    adapter_index(name)
        .ok()
        .and_then(|index| adapters.get(index as usize))
        .unwrap_or(&adapters[0])
}

fn clamp_speed(speed_mps: f32, settings: &Settings) -> f32 {
    let adjusted = speed_mps as f64 * settings.speed_gear_factor;
    adjusted.clamp(settings.speed_min, settings.speed_max) as f32
}

async fn create_bike(
    kind: BikeKind,
    settings: &Settings,
    adapter: &Adapter,
    opts: &ConnectOptions,
    events: mpsc::Sender<BikeEvent>,
) -> Result<BikeClient, BikeError> {
    match kind {
        BikeKind::Flywheel => bike::flywheel::FlywheelBike::connect(
            adapter,
            DeviceFilter::new(
                settings.flywheel_name.as_deref(),
                settings.flywheel_address.as_deref(),
            ),
            opts,
            events,
        )
        .await
        .map(BikeClient::Flywheel),
        BikeKind::Ic4 | BikeKind::Ic5 => {
            bike::ftms::FtmsBike::connect(adapter, DeviceFilter::default(), opts, events)
                .await
                .map(BikeClient::Ftms)
        }
        BikeKind::Ic8 => bike::ic8::Ic8Bike::connect(adapter, DeviceFilter::default(), opts, events)
            .await
            .map(BikeClient::Ic8),
        BikeKind::Keiser => bike::keiser::KeiserBike::connect(adapter, events)
            .await
            .map(BikeClient::Keiser),
        BikeKind::Peloton => bike::peloton::PelotonBike::connect(&settings.peloton_path, events)
            .await
            .map(BikeClient::Peloton),
        BikeKind::Bot => bike::bot::BotBike::connect(
            &settings.bot_host,
            settings.bot_port,
            settings.bot_power,
            settings.bot_cadence,
            events,
        )
        .await
        .map(BikeClient::Bot),
        BikeKind::Autodetect => unreachable!("autodetect resolves to a concrete type first"),
    }
}

/// Best-effort heart-rate relay startup.
///
/// A dedicated adapter is used when configured; otherwise the bike adapter
/// is shared only on a multi-role radio, and the relay is skipped entirely
/// on single-role hardware.
async fn start_heart_rate(
    settings: &Settings,
    caps: &AdapterCapabilities,
    adapters: &[Adapter],
    plan: &AdapterPlan,
    events: mpsc::Sender<HrEvent>,
) -> Option<HeartRateClient> {
    if !settings.heart_rate_enabled {
        return None;
    }
    let adapter = match &plan.heart_rate {
        Some(name) => pick_adapter(adapters, name),
        None if caps.multi_role => pick_adapter(adapters, &plan.bike),
        None => {
            tracing::warn!("heart-rate relay needs a dedicated adapter on this radio; disabled");
            return None;
        }
    };
    match HeartRateClient::connect(adapter, None, &ConnectOptions::default(), events).await {
        Ok(client) => Some(client),
        Err(err) => {
            tracing::warn!("heart-rate relay unavailable: {}", err);
            None
        }
    }
}
