use std::{
    io::{Cursor, ErrorKind},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::Mutex,
};
use tracing::{debug, info, warn};

use heater_common::{
    http::request_is_complete, state::MEMORY_SENTINEL, ControllerState, Request, RequestHandler,
    RuntimeConfig, StatusBody, TelemetryReading, MAX_MQTT_PAYLOAD_BYTES, TOPIC_CONTROLLER_STATE,
    TOPIC_TELEMETRY,
};

const INDEX_HTML: &str = include_str!("../web/index.html");
const HOST_HTTP_PORT: u16 = 8080;
const READ_CHUNK_BYTES: usize = 512;
const MAX_REQUEST_BYTES: usize = 8 * 1024;
const MEMINFO_PATH: &str = "/proc/meminfo";

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<ControllerState>>,
    handler: Arc<RequestHandler>,
    mqtt: AsyncClient,
    runtime: Arc<RuntimeConfig>,
}

#[derive(Clone)]
struct ConfigStore {
    runtime_path: Arc<PathBuf>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = match store.load_runtime_config().await {
        Ok(Some(runtime)) => runtime,
        Ok(None) => host_defaults(),
        Err(err) => {
            warn!("failed to load runtime config from store: {err:#}");
            host_defaults()
        }
    };
    apply_env_overrides(&mut runtime);

    info!(
        "runtime config loaded: variant={:?}, threshold={}, mqtt=`{}:{}`",
        runtime.controller.variant,
        runtime.controller.default_threshold,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
    );

    let controller = ControllerState::with_threshold(runtime.controller.default_threshold);
    let handler = RequestHandler::new(&runtime.controller, INDEX_HTML);

    let mut mqtt_options = MqttOptions::new(
        "heater-controller-rust",
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        controller: Arc::new(Mutex::new(controller)),
        handler: Arc::new(handler),
        mqtt,
        runtime: Arc::new(runtime),
    };

    app_state
        .mqtt
        .subscribe(TOPIC_TELEMETRY, QoS::AtMostOnce)
        .await
        .context("failed to subscribe to telemetry topic")?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_memory_sample_loop(app_state.clone());
    spawn_state_publish_loop(app_state.clone());

    let port = app_state.runtime.network.http_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    serve(listener, app_state).await
}

fn host_defaults() -> RuntimeConfig {
    let mut runtime = RuntimeConfig::default();
    runtime.network.http_port = HOST_HTTP_PORT;
    runtime.network.mqtt_host = "127.0.0.1".to_string();
    runtime
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = env_u16("MQTT_PORT") {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
    if let Some(port) = env_u16("CONTROLLER_HTTP_PORT") {
        runtime.network.http_port = port;
    }
    runtime.sanitize();
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
}

/// One connection at a time: the next client is accepted only after the current
/// response has been written.
async fn serve(listener: TcpListener, app_state: AppState) -> anyhow::Result<()> {
    let read_timeout = Duration::from_millis(app_state.runtime.network.read_timeout_ms);

    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!("client connected: {peer}");

        if let Err(err) = handle_connection(
            &mut stream,
            &app_state.controller,
            &app_state.handler,
            read_timeout,
        )
        .await
        {
            warn!("connection {peer} failed: {err:#}");
        }
    }
}

async fn handle_connection<S>(
    stream: &mut S,
    controller: &Mutex<ControllerState>,
    handler: &RequestHandler,
    read_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut raw = Vec::new();
    match tokio::time::timeout(read_timeout, read_request_bytes(stream, &mut raw)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!("request read ended early after {} bytes: {err}", raw.len()),
        Err(_) => debug!("request read timed out after {} bytes", raw.len()),
    }

    let Some(request) = Request::read_with(&mut Cursor::new(raw), handler.policy()) else {
        debug!("client closed without sending a request");
        return Ok(());
    };

    let response = {
        let mut controller = controller.lock().await;
        handler.handle(&request, &mut controller)
    };

    stream
        .write_all(&response.to_bytes())
        .await
        .context("failed to write response")?;
    if let Err(err) = stream.shutdown().await {
        if err.kind() != ErrorKind::NotConnected {
            debug!("shutdown after response failed: {err}");
        }
    }
    Ok(())
}

async fn read_request_bytes<S>(stream: &mut S, raw: &mut Vec<u8>) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0_u8; READ_CHUNK_BYTES];
    while !request_is_complete(raw) && raw.len() < MAX_REQUEST_BYTES {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state.controller, &message.topic, &message.payload)
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    if let Err(err) = app_state
                        .mqtt
                        .subscribe(TOPIC_TELEMETRY, QoS::AtMostOnce)
                        .await
                    {
                        warn!("mqtt re-subscribe failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_mqtt_message(
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
        let mut controller = controller.lock().await;
        controller.apply_reading(reading.temp, reading.gravity, reading.battery);
        debug!("telemetry applied: {}", controller.snapshot());
    }

    Ok(())
}

fn spawn_memory_sample_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = Duration::from_millis(app_state.runtime.controller.memory_sample_interval_ms);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            sample_host_memory(&app_state.controller, Path::new(MEMINFO_PATH)).await;
        }
    });
}

/// Reads `MemAvailable`, saturated to `i32`, then records it. The file is read before the
/// state lock is taken.
async fn sample_host_memory(controller: &Mutex<ControllerState>, meminfo_path: &Path) {
    let free = match tokio::fs::read_to_string(meminfo_path).await {
        Ok(meminfo) => parse_mem_available(&meminfo)
            .map(|bytes| i32::try_from(bytes).unwrap_or(i32::MAX))
            .unwrap_or(MEMORY_SENTINEL),
        Err(err) => {
            debug!("memory sample unavailable: {err}");
            MEMORY_SENTINEL
        }
    };

    controller.lock().await.sample_memory(&|| free);
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = Duration::from_millis(app_state.runtime.controller.state_publish_interval_ms);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            let snapshot = { app_state.controller.lock().await.snapshot() };
            let body = StatusBody::new(&snapshot, app_state.handler.capabilities());

            match serde_json::to_vec(&body) {
                Ok(payload) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, payload)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("HEATER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heater"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<Option<RuntimeConfig>> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(Some(RuntimeConfig::from_json(&raw).with_context(|| {
                format!("invalid config at {}", self.runtime_path.display())
            })?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn parse_mem_available(meminfo: &str) -> Option<i64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<i64>().ok())
        .map(|kib| kib.saturating_mul(1024))
}
