use std::sync::Arc;

use log::{debug, error, info, warn};
use luba_sync::coordinator::Coordinator;
use luba_sync::messages::{MowerAction, MowerRequest, SyncEvent};
use luba_sync::mower::LawnMower;
use luba_sync::poller::{PollHandle, spawn_polling};
use luba_sync::session::Connector;
use luba_sync::state::DeviceRef;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use crate::config::{MowerDevice, PollConfig};
use crate::mqtt::{MqttClient, sanitize_name};

pub struct Manager {
    connector: Arc<dyn Connector>,
    mqtt_client: MqttClient,
    mqtt_event_loop: rumqttc::EventLoop,
    devices: Vec<MowerDevice>,
    poll: PollConfig,
}

impl Manager {
    pub fn new(
        connector: Arc<dyn Connector>,
        mqtt_client: MqttClient,
        mqtt_event_loop: rumqttc::EventLoop,
        devices: Vec<MowerDevice>,
        poll: PollConfig,
    ) -> Self {
        Manager {
            connector,
            mqtt_client,
            mqtt_event_loop,
            devices,
            poll,
        }
    }

    pub async fn run_loop(self) -> anyhow::Result<()> {
        let Manager {
            connector,
            mqtt_client,
            mut mqtt_event_loop,
            devices,
            poll,
        } = self;
        let (tx, _) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Handle incoming MQTT messages (mower commands)
        let mqtt_task = tokio::spawn({
            let mqtt_client = mqtt_client.clone();
            let tx = tx.clone();
            async move {
                mqtt_client.event_loop(&mut mqtt_event_loop, tx).await;
            }
        });

        let device_tasks: Vec<_> = devices
            .iter()
            .map(|device| {
                tokio::spawn(run_device(
                    device.device_ref(),
                    Arc::clone(&connector),
                    mqtt_client.clone(),
                    tx.subscribe(),
                    poll.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        let _ = shutdown_tx.send(true);

        for task in device_tasks {
            if let Err(err) = task.await {
                error!("Error stopping mower task: {:?}", err);
            }
        }
        info!("Exiting manager event loop");

        mqtt_client.disconnect().await?;
        if let Err(err) = mqtt_task.await {
            error!("Error stopping MQTT event loop: {:?}", err);
        }

        Ok(())
    }
}

/// Sets the device up (retrying until it succeeds or shutdown), then polls
/// it and bridges its updates and commands to MQTT.
async fn run_device(
    device: DeviceRef,
    connector: Arc<dyn Connector>,
    mqtt_client: MqttClient,
    mut requests: broadcast::Receiver<MowerRequest>,
    poll: PollConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let coordinator = loop {
        match Coordinator::setup(device.clone(), Arc::clone(&connector), poll.coordinator_options())
            .await
        {
            Ok(coordinator) => break coordinator,
            Err(err) => {
                error!(
                    "Setting up mower {} failed: {}; retrying in {:?}",
                    device,
                    err,
                    poll.setup_retry()
                );
                tokio::select! {
                    _ = tokio::time::sleep(poll.setup_retry()) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    };

    let mut events = coordinator.subscribe();
    let mut mower = LawnMower::new(coordinator.clone());
    let handle = spawn_polling(coordinator, poll.interval());
    publish_status(&mqtt_client, &mower).await;

    let channel = sanitize_name(&device.name);
    let mut requests_open = true;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::Updated(state)) => {
                    mower.handle_update(&state);
                    publish_status(&mqtt_client, &mower).await;
                }
                Ok(SyncEvent::UpdateFailed(err)) => {
                    let failures = mower.coordinator().runtime().consecutive_failures;
                    if let Err(err) = mqtt_client.publish_failure(&device.name, &err, failures).await {
                        error!("Error publishing failure for {}: {:?}", device.name, err);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} updates for {}", skipped, device.name);
                }
                Err(RecvError::Closed) => break,
            },
            request = requests.recv(), if requests_open => match request {
                Ok(request) if request.device == channel => {
                    handle_action(&mower, &handle, request.action).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} commands for {}", skipped, device.name);
                }
                Err(RecvError::Closed) => {
                    debug!("Command channel closed");
                    requests_open = false;
                }
            },
        }
    }

    handle.stop().await;
}

async fn handle_action(mower: &LawnMower, handle: &PollHandle, action: MowerAction) {
    info!("Received {:?} for {}", action, mower.coordinator().device().name);
    let result = match action {
        MowerAction::Start => mower.start_mowing().await,
        MowerAction::Pause => mower.pause().await,
        MowerAction::Dock => mower.dock().await,
        MowerAction::Refresh => {
            // outcome arrives through the coordinator's events
            let _ = handle.request_refresh().await;
            Ok(())
        }
    };
    if let Err(err) = result {
        error!("{}", err);
    }
}

async fn publish_status(mqtt_client: &MqttClient, mower: &LawnMower) {
    let status = mower.status();
    if let Err(err) = mqtt_client.publish_status(&status).await {
        error!("Error publishing status for {}: {:?}", status.name, err);
    }
}
