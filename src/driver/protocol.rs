//! Per-device protocol engine.
//!
//! A [`DeviceProtocol`] owns one device's driver, command runtime and
//! connection state machine. Status transitions are serialized by a
//! per-device FIFO lock; the connect/retry/disconnect policy lives here
//! while the wire work is delegated to the per-scheme [`ProtocolDriver`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, trace};

use crate::core::data::{now_millis, Response, Status, StatusCode};
use crate::core::device::{Command, Device};
use crate::core::error::{GatewayError, Result};
use crate::core::tasks::TaskSet;
use crate::driver::command::{CommandRuntime, ExecContext};
use crate::driver::options::ConnectionUrl;
use crate::driver::service::DriverService;
use crate::script::{ScriptHost, ScriptValue};

/// Result of one driver-level command invocation.
pub enum CommandOutcome {
    /// Write/request style command, or an unmatched read.
    NoResponse,
    /// A read command matched an inbound packet.
    Received {
        values: Vec<ScriptValue>,
        received_time: i64,
    },
}

/// Wire-level driver of one scheme.
///
/// Drivers are stateful (sockets, servers) but never own the connection
/// policy: retry, timeouts between attempts and status bookkeeping belong
/// to the engine.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    async fn request_connect(&self, proto: &Arc<DeviceProtocol>) -> Result<()>;

    async fn request_disconnect(&self, proto: &Arc<DeviceProtocol>) -> Result<()>;

    /// Transmit a command. Read commands block for the next matching packet
    /// within the command timeout.
    async fn request_command(
        &self,
        proto: &Arc<DeviceProtocol>,
        command: &Command,
        request_info: Option<String>,
        ctx: &ExecContext,
    ) -> Result<CommandOutcome>;
}

/// Outcome of the per-scheme driver factory.
pub struct DriverBuild {
    pub driver: Box<dyn ProtocolDriver>,
    /// Driver-level default; the URL option overrides it.
    pub connection_lost_on_exception: bool,
}

/// An inbound packet waiting for a read command.
struct ReceivedData {
    cmd_id: Option<String>,
    values: Vec<ScriptValue>,
    received_time: i64,
}

/// Latest-wins queue between the framing layer and read commands.
#[derive(Default)]
struct RequestQueue {
    inner: StdMutex<VecDeque<ReceivedData>>,
    notify: Notify,
}

impl RequestQueue {
    fn push_latest(&self, data: ReceivedData) {
        let mut queue = self.inner.lock().unwrap();
        queue.clear();
        queue.push_back(data);
        drop(queue);
        self.notify.notify_one();
    }

    async fn poll(&self, timeout: Duration) -> Option<ReceivedData> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(data) = self.inner.lock().unwrap().pop_front() {
                return Some(data);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.inner.lock().unwrap().pop_front();
            }
        }
    }
}

/// Script host surface: device data lives under `[device_id, "data", ...]`
/// in this node's shared subtree.
struct ProtocolScriptHost {
    device_id: String,
    service: Arc<DriverService>,
}

impl ProtocolScriptHost {
    fn full_path(&self, path: Vec<String>) -> Vec<String> {
        let mut full = Vec::with_capacity(path.len() + 2);
        full.push(self.device_id.clone());
        full.push("data".to_string());
        full.extend(path);
        full
    }
}

impl ScriptHost for ProtocolScriptHost {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn set_data(&self, path: Vec<String>, value: serde_json::Value) {
        let Some(cluster) = self.service.cluster_opt() else {
            return;
        };
        let full = self.full_path(path);
        tokio::spawn(async move {
            cluster.merge_shared_object_at(&full, value).await;
        });
    }

    fn get_data(&self, path: Vec<String>) -> serde_json::Value {
        let Some(cluster) = self.service.cluster_opt() else {
            return serde_json::Value::Null;
        };
        cluster
            .get_item(cluster.node_index(), &self.full_path(path))
            .unwrap_or(serde_json::Value::Null)
    }

    fn delete_data(&self, path: Vec<String>) {
        let Some(cluster) = self.service.cluster_opt() else {
            return;
        };
        let full = self.full_path(path);
        tokio::spawn(async move {
            cluster.delete_shared_object(vec![full]).await;
        });
    }
}

/// Engine state of one connected device.
pub struct DeviceProtocol {
    pub device: Device,
    pub device_id: String,
    service: Arc<DriverService>,
    driver: Box<dyn ProtocolDriver>,
    runtime: CommandRuntime,

    status: StdMutex<Option<StatusCode>>,
    status_lock: Mutex<()>,
    retry_connect: AtomicI32,
    disposables: TaskSet,
    response_monitor: StdMutex<Option<JoinHandle<()>>>,
    starting_task: StdMutex<Option<JoinHandle<()>>>,
    response_tx: StdMutex<Option<tokio::sync::mpsc::UnboundedSender<Vec<Response>>>>,
    request_queue: RequestQueue,

    set_disconnected_flag: AtomicBool,
    connection_lost_flag: AtomicBool,
    connection_lost_on_exception: bool,
    initial_command_delay: Duration,
}

impl DeviceProtocol {
    /// Build the engine for a device: parse the connection URL, compile the
    /// scripts, and construct the scheme driver. Every failure here is a
    /// validation error reported synchronously to the caller.
    pub fn build(service: Arc<DriverService>, mut device: Device) -> Result<Arc<Self>> {
        trace!("[{}] create", device.id);
        let url = ConnectionUrl::parse(&device.connection_url)
            .map_err(|e| GatewayError::Validation(format!("[{}] {e}", device.id)))?;

        let host = Arc::new(ProtocolScriptHost {
            device_id: device.id.clone(),
            service: service.clone(),
        });
        let runtime = CommandRuntime::new(service.default_script(), host)?;
        runtime.compile_protocol_script(&device)?;
        runtime.compile_device(&device)?;

        let build = crate::protocols::build_driver(&mut device, &url, &runtime)?;
        let connection_lost_on_exception = url
            .bool_option("connectionLostOnException")
            .unwrap_or(build.connection_lost_on_exception);

        let initial_command_delay = Duration::from_millis(device.initial_command_delay.max(100));
        let device_id = device.id.clone();
        Ok(Arc::new(Self {
            device,
            device_id,
            service,
            driver: build.driver,
            runtime,
            status: StdMutex::new(None),
            status_lock: Mutex::new(()),
            retry_connect: AtomicI32::new(0),
            disposables: TaskSet::new(),
            response_monitor: StdMutex::new(None),
            starting_task: StdMutex::new(None),
            response_tx: StdMutex::new(None),
            request_queue: RequestQueue::default(),
            set_disconnected_flag: AtomicBool::new(false),
            connection_lost_flag: AtomicBool::new(false),
            connection_lost_on_exception,
            initial_command_delay,
        }))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn status(&self) -> Option<StatusCode> {
        *self.status.lock().unwrap()
    }

    pub fn runtime(&self) -> &CommandRuntime {
        &self.runtime
    }

    pub(crate) fn disposables(&self) -> &TaskSet {
        &self.disposables
    }

    pub fn service(&self) -> &Arc<DriverService> {
        &self.service
    }

    pub fn is_set_disconnected(&self) -> bool {
        self.set_disconnected_flag.load(Ordering::SeqCst)
    }

    pub fn connection_lost_on_exception(&self) -> bool {
        self.connection_lost_on_exception
    }

    pub fn connection_lost_occurred(&self) -> bool {
        self.connection_lost_flag.load(Ordering::SeqCst)
    }

    pub fn clear_connection_lost_flag(&self) {
        self.connection_lost_flag.store(false, Ordering::SeqCst);
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.device.socket_timeout)
    }

    // ------------------------------------------------------------------
    // Inbound packets
    // ------------------------------------------------------------------

    /// Hand an inbound packet to the next waiting read command; latest
    /// packet wins.
    pub fn push_received(&self, cmd_id: Option<String>, values: Vec<ScriptValue>, received_time: i64) {
        self.request_queue.push_latest(ReceivedData {
            cmd_id,
            values,
            received_time,
        });
    }

    /// Block for the next inbound packet matching `cmd_id` (anonymous
    /// packets match everything) within `timeout`.
    pub async fn poll_received(&self, cmd_id: &str, timeout: Duration) -> Result<CommandOutcome> {
        match self.request_queue.poll(timeout).await {
            None => Err(GatewayError::Timeout(format!(
                "cmdId={cmd_id}, command timeout"
            ))),
            Some(data) => match &data.cmd_id {
                None => {
                    trace!("[{}] cmdId={}, received command is null", self.device_id, cmd_id);
                    Ok(CommandOutcome::Received {
                        values: data.values,
                        received_time: data.received_time,
                    })
                }
                Some(id) if id == cmd_id => {
                    trace!("[{}] cmdId={}, received command match", self.device_id, cmd_id);
                    Ok(CommandOutcome::Received {
                        values: data.values,
                        received_time: data.received_time,
                    })
                }
                Some(other) => {
                    error!(
                        "[{}] cmdId={}, received command not match, ignore received message, received cmdId={}",
                        self.device_id, cmd_id, other
                    );
                    Ok(CommandOutcome::NoResponse)
                }
            },
        }
    }

    /// Drop anything queued for read commands.
    pub fn clear_received(&self) {
        self.request_queue.inner.lock().unwrap().clear();
    }

    // ------------------------------------------------------------------
    // Transport invocation
    // ------------------------------------------------------------------

    /// Invoke the driver for one command; connection-command devices
    /// connect and disconnect around the invocation.
    pub(crate) async fn transport_command(
        self: &Arc<Self>,
        command: &Command,
        request_info: Option<String>,
        ctx: &ExecContext,
    ) -> Result<CommandOutcome> {
        if self.device.connection_command {
            self.driver.request_connect(self).await?;
            let result = self
                .driver
                .request_command(self, command, request_info, ctx)
                .await;
            if let Err(e) = self.driver.request_disconnect(self).await {
                error!("[{}] disconnect after command failed: {}", self.device_id, e);
            }
            result
        } else {
            self.driver
                .request_command(self, command, request_info, ctx)
                .await
        }
    }

    // ------------------------------------------------------------------
    // Response channel
    // ------------------------------------------------------------------

    /// Queue responses to the sink channel.
    pub fn on_response(&self, responses: Vec<Response>) {
        if responses.is_empty() {
            return;
        }
        if let Some(tx) = self.response_tx.lock().unwrap().as_ref() {
            let _ = tx.send(responses);
        }
    }

    /// (Re)arm the response channel and its monitor: absence of responses
    /// for `response_timeout` seconds raises CONNECTION_LOST.
    fn init_response(self: &Arc<Self>) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<Response>>();
        *self.response_tx.lock().unwrap() = Some(tx);

        let proto = self.clone();
        let response_timeout = self.device.response_timeout;
        let handle = tokio::spawn(async move {
            loop {
                let next = if response_timeout > 0 {
                    match tokio::time::timeout(
                        Duration::from_secs(response_timeout as u64),
                        rx.recv(),
                    )
                    .await
                    {
                        Ok(next) => next,
                        Err(_) => {
                            error!(
                                "[{}] response timeout for {} [sec]",
                                proto.device_id, response_timeout
                            );
                            proto.set_connection_lost();
                            break;
                        }
                    }
                } else {
                    rx.recv().await
                };
                match next {
                    Some(responses) => proto.deliver_responses(responses).await,
                    None => break,
                }
            }
        });
        if let Some(old) = self.response_monitor.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    async fn deliver_responses(&self, responses: Vec<Response>) {
        if let Err(e) = self.service.send_response(responses.clone()).await {
            error!("[{}] send response error: {}", self.device_id, e);
            for response in &responses {
                error!(
                    "[{}] send failed response, tag-id: {}, value: {}, received-time: {}",
                    self.device_id, response.tag_id, response.value, response.received_time
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Status machine
    // ------------------------------------------------------------------

    async fn status_changed(&self, status: StatusCode, issued_time: i64) {
        info!(
            "[{}] status changed: {:?} -> {}",
            self.device_id,
            self.status(),
            status
        );
        *self.status.lock().unwrap() = Some(status);
        let device_status = Status::new(self.device_id.clone(), status, issued_time);
        trace!("[{}] send status, status: {:?}", self.device_id, device_status);
        if let Err(e) = self.service.send_status(device_status).await {
            error!("[{}] send status error: {}", self.device_id, e);
        }
    }

    /// Request a status change on a background task.
    pub fn call_change_status(self: &Arc<Self>, desired: StatusCode) {
        let proto = self.clone();
        self.disposables.spawn(async move {
            let _ = proto.change_status(desired).await;
        });
    }

    /// Drive the state machine toward `desired`. Transitions not listed in
    /// the table are ignored.
    pub async fn change_status(self: &Arc<Self>, desired: StatusCode) -> Result<()> {
        let pre = self.status();
        trace!("[{}] try to change status: {:?} -> {}", self.device_id, pre, desired);
        let _guard = self.status_lock.lock().await;
        trace!(
            "[{}] change status started: {:?} -> {}",
            self.device_id,
            self.status(),
            desired
        );
        let issued_time = now_millis();
        let current = self.status();
        let result = match (desired, current) {
            (
                StatusCode::Connecting,
                None | Some(StatusCode::ConnectionFail) | Some(StatusCode::ConnectionLost),
            ) => self.on_connecting(issued_time).await,
            (StatusCode::Connected, Some(StatusCode::Connecting)) => {
                self.status_changed(StatusCode::Connected, issued_time).await;
                Ok(())
            }
            (StatusCode::ConnectionFail, Some(StatusCode::Connecting)) => {
                self.status_changed(StatusCode::ConnectionFail, issued_time).await;
                let retry = self.retry_connect.load(Ordering::SeqCst);
                let max = self.device.max_retry_connect;
                if max < 0 || retry < max {
                    self.retry_connect.fetch_add(1, Ordering::SeqCst);
                    info!(
                        "[{}] retry to connect ({}/{})",
                        self.device_id,
                        retry + 1,
                        if max < 0 { "INF".to_string() } else { max.to_string() }
                    );
                    self.schedule_reconnect();
                } else {
                    info!("[{}] retry process ended ({}/{})", self.device_id, retry, max);
                    self.set_disconnected();
                }
                Ok(())
            }
            (StatusCode::ConnectionLost, Some(StatusCode::Connected)) => {
                if let Some(task) = self.starting_task.lock().unwrap().take() {
                    task.abort();
                }
                self.runtime.dispose();
                self.status_changed(StatusCode::ConnectionLost, issued_time).await;
                self.schedule_reconnect();
                Ok(())
            }
            (StatusCode::Disconnected, s) if s != Some(StatusCode::Disconnected) => {
                self.set_disconnected_flag.store(true, Ordering::SeqCst);
                self.runtime.dispose();
                self.disposables.clear();
                if let Some(task) = self.starting_task.lock().unwrap().take() {
                    task.abort();
                }
                if let Some(old) = self.response_monitor.lock().unwrap().take() {
                    old.abort();
                }
                if s == Some(StatusCode::Connected) {
                    self.runtime.stopping_commands(self).await;
                }
                match self.driver.request_disconnect(self).await {
                    Ok(()) => {
                        self.status_changed(StatusCode::Disconnected, issued_time).await;
                        Ok(())
                    }
                    Err(e) => {
                        error!("[{}] disconnect failed: {}", self.device_id, e);
                        if self.status() != Some(StatusCode::DisconnectionFail) {
                            self.status_changed(StatusCode::DisconnectionFail, issued_time).await;
                        }
                        Err(GatewayError::Connection(format!("disconnect failed::{e}")))
                    }
                }
            }
            (StatusCode::DisconnectionFail, s) if s != Some(StatusCode::DisconnectionFail) => {
                self.status_changed(StatusCode::DisconnectionFail, issued_time).await;
                Ok(())
            }
            _ => {
                trace!(
                    "[{}] invalid status changing ignored: {:?} -> {}",
                    self.device_id, current, desired
                );
                Ok(())
            }
        };
        trace!(
            "[{}] change status to {} finished: {:?} -> {:?}",
            self.device_id,
            desired,
            pre,
            self.status()
        );
        result
    }

    async fn on_connecting(self: &Arc<Self>, issued_time: i64) -> Result<()> {
        self.status_changed(StatusCode::Connecting, issued_time).await;
        self.init_response();
        let connect = async {
            if !self.device.connection_command {
                self.driver.request_connect(self).await?;
            }
            Ok::<(), GatewayError>(())
        };
        match connect.await {
            Ok(()) => {
                self.retry_connect.store(0, Ordering::SeqCst);
                info!("[{}] connected successfully", self.device_id);
                self.status_changed(StatusCode::Connected, now_millis()).await;

                let proto = self.clone();
                let delay = self.initial_command_delay;
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    proto.runtime.starting_commands(&proto).await;
                });
                if let Some(old) = self.starting_task.lock().unwrap().replace(handle) {
                    old.abort();
                }
                Ok(())
            }
            Err(e) => {
                error!("[{}] connect failed: {}", self.device_id, e);
                self.call_change_status(StatusCode::ConnectionFail);
                Err(GatewayError::Connection(format!("connect failed::{e}")))
            }
        }
    }

    /// Retry path: tear the wire down, wait the retry delay, reconnect.
    fn schedule_reconnect(self: &Arc<Self>) {
        let proto = self.clone();
        self.disposables.spawn(async move {
            trace!("[{}] start disconnect", proto.device_id);
            if let Err(e) = proto.driver.request_disconnect(&proto).await {
                error!("[{}] disconnect failed: {}", proto.device_id, e);
                let _ = proto.change_status(StatusCode::DisconnectionFail).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(proto.device.retry_connect_delay)).await;
            let _ = proto.change_status(StatusCode::Connecting).await;
        });
    }

    /// Raise CONNECTION_LOST (response timeout, transport failure, script
    /// escalation).
    pub fn set_connection_lost(self: &Arc<Self>) {
        trace!("[{}] set connection-lost", self.device_id);
        self.connection_lost_flag.store(true, Ordering::SeqCst);
        self.call_change_status(StatusCode::ConnectionLost);
    }

    /// Detach the device entirely: routed through the driver service so
    /// that maps and shared state stay consistent.
    pub fn set_disconnected(self: &Arc<Self>) {
        trace!("[{}] set disconnected", self.device_id);
        let service = self.service.clone();
        let device_id = self.device_id.clone();
        tokio::spawn(async move {
            service.disconnect_list(vec![device_id], true).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_queue_latest_wins() {
        let queue = RequestQueue::default();
        queue.push_latest(ReceivedData {
            cmd_id: Some("old".into()),
            values: vec![],
            received_time: 1,
        });
        queue.push_latest(ReceivedData {
            cmd_id: Some("new".into()),
            values: vec![],
            received_time: 2,
        });
        let data = queue.poll(Duration::from_millis(50)).await.unwrap();
        assert_eq!(data.cmd_id.as_deref(), Some("new"));
        assert!(queue.poll(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_request_queue_wakes_waiter() {
        let queue = Arc::new(RequestQueue::default());
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.poll(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push_latest(ReceivedData {
            cmd_id: None,
            values: vec![ScriptValue::Int(1)],
            received_time: 7,
        });
        let data = waiter.await.unwrap().unwrap();
        assert_eq!(data.received_time, 7);
    }
}
