use std::{
    io::BufReader,
    net::{Shutdown, TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use heater_common::{
    ControllerState, MemoryProbe, NetworkConfig, Request, RequestHandler, RuntimeConfig,
    StatusBody, TelemetryReading, MAX_MQTT_PAYLOAD_BYTES, TOPIC_CONTROLLER_STATE,
    TOPIC_TELEMETRY,
};

const INDEX_HTML: &str = include_str!("../web/index.html");
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

type SharedController = Arc<Mutex<ControllerState>>;
type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

/// Free heap as reported by ESP-IDF.
struct HeapProbe;

impl MemoryProbe for HeapProbe {
    fn free_bytes(&self) -> i32 {
        let free = unsafe { esp_idf_svc::sys::esp_get_free_heap_size() };
        i32::try_from(free).unwrap_or(i32::MAX)
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = RuntimeConfig::default();
    apply_build_env(&mut runtime.network);
    runtime.sanitize();

    info!(
        "config: ssid=`{}`, mqtt=`{}:{}`, http port {}",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.network.http_port,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let controller: SharedController = Arc::new(Mutex::new(ControllerState::with_threshold(
        runtime.controller.default_threshold,
    )));
    let handler = RequestHandler::new(&runtime.controller, INDEX_HTML);

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client: SharedMqtt = Arc::new(Mutex::new(mqtt_client));
    subscribe_topics(&mqtt_client)?;
    spawn_mqtt_receiver(controller.clone(), mqtt_conn, mqtt_client.clone());
    spawn_housekeeping_loop(
        controller.clone(),
        mqtt_client,
        handler.clone(),
        &runtime,
    );

    let listener = TcpListener::bind(("0.0.0.0", runtime.network.http_port))
        .with_context(|| format!("failed to bind port {}", runtime.network.http_port))?;
    info!("controller listening on port {}", runtime.network.http_port);

    // Keep wifi alive for the program lifetime.
    let _wifi = wifi;

    let read_timeout = Duration::from_millis(runtime.network.read_timeout_ms);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(err) = handle_connection(stream, &controller, &handler, read_timeout) {
                    warn!("connection failed: {err:#}");
                }
            }
            Err(err) => warn!("accept failed: {err}"),
        }
    }

    Ok(())
}

fn apply_build_env(network: &mut NetworkConfig) {
    if let Some(ssid) = option_env!("WIFI_SSID") {
        network.wifi_ssid = ssid.to_string();
    }
    if let Some(pass) = option_env!("WIFI_PASS") {
        network.wifi_pass = pass.to_string();
    }
    if let Some(host) = option_env!("MQTT_HOST") {
        network.mqtt_host = host.to_string();
    }
    if let Some(user) = option_env!("MQTT_USER") {
        network.mqtt_user = user.to_string();
    }
    if let Some(pass) = option_env!("MQTT_PASS") {
        network.mqtt_pass = pass.to_string();
    }
}

fn handle_connection(
    stream: TcpStream,
    controller: &Mutex<ControllerState>,
    handler: &RequestHandler,
    read_timeout: Duration,
) -> anyhow::Result<()> {
    stream
        .set_read_timeout(Some(read_timeout))
        .context("failed to set read timeout")?;
    let mut reader = BufReader::new(stream.try_clone().context("failed to clone stream")?);

    let Some(request) = Request::read_with(&mut reader, handler.policy()) else {
        debug!("client closed without sending a request");
        return Ok(());
    };

    let response = {
        let mut controller = controller
            .lock()
            .map_err(|_| anyhow!("controller state lock poisoned"))?;
        handler.handle(&request, &mut controller)
    };

    let mut stream = stream;
    response
        .write_to(&mut stream)
        .context("failed to write response")?;
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("WIFI_SSID was not set at build time"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"
        ));
    }

    if let Ok(ip_info) = wifi.wifi().sta_netif().get_ip_info() {
        info!("control panel at http://{}", ip_info.ip);
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("heater-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &SharedMqtt) -> anyhow::Result<()> {
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    mqtt.subscribe(TOPIC_TELEMETRY, QoS::AtMostOnce)?;
    Ok(())
}

fn spawn_mqtt_receiver(controller: SharedController, mut conn: EspMqttConnection, mqtt: SharedMqtt) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    if let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if let Err(err) = handle_mqtt_message(&controller, topic, data) {
                            warn!("mqtt message handling failed: {err:#}");
                        }
                    }
                }
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn handle_mqtt_message(
    controller: &Mutex<ControllerState>,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    if topic == TOPIC_TELEMETRY {
        let reading =
            TelemetryReading::from_json(payload).context("invalid telemetry payload")?;
        let mut controller = controller
            .lock()
            .map_err(|_| anyhow!("controller state lock poisoned"))?;
        controller.apply_reading(reading.temp, reading.gravity, reading.battery);
    }

    Ok(())
}

/// Samples free heap and publishes the state snapshot on their configured periods.
fn spawn_housekeeping_loop(
    controller: SharedController,
    mqtt: SharedMqtt,
    handler: RequestHandler,
    runtime: &RuntimeConfig,
) {
    let sample_every = Duration::from_millis(runtime.controller.memory_sample_interval_ms);
    let publish_every = Duration::from_millis(runtime.controller.state_publish_interval_ms);
    let tick = sample_every.min(publish_every);

    thread::Builder::new()
        .name("housekeeping".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let mut since_sample = sample_every;
            let mut since_publish = Duration::ZERO;
            loop {
                if since_sample >= sample_every {
                    since_sample = Duration::ZERO;
                    if let Ok(mut controller) = controller.lock() {
                        controller.sample_memory(&HeapProbe);
                    }
                }

                if since_publish >= publish_every {
                    since_publish = Duration::ZERO;
                    if let Err(err) = publish_state(&controller, &mqtt, &handler) {
                        warn!("state publish failed: {err:#}");
                    }
                }

                thread::sleep(tick);
                since_sample += tick;
                since_publish += tick;
            }
        })
        .expect("failed to spawn housekeeping thread");
}

fn publish_state(
    controller: &Mutex<ControllerState>,
    mqtt: &SharedMqtt,
    handler: &RequestHandler,
) -> anyhow::Result<()> {
    let snapshot = controller
        .lock()
        .map_err(|_| anyhow!("controller state lock poisoned"))?
        .snapshot();
    let payload = serde_json::to_vec(&StatusBody::new(&snapshot, handler.capabilities()))?;

    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    mqtt.publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}
