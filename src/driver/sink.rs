//! Output sinks for responses and status changes.
//!
//! Four implementations: CSV file append, load-balanced REST POST, Kafka
//! (feature `kafka`) and log-only. The REST and Kafka sinks format records
//! through a `${placeholder}` template.

use std::collections::HashMap;
#[cfg(feature = "kafka")]
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cluster::LoadBalancer;
use crate::core::data::{Response, Status};
use crate::core::error::{GatewayError, Result};

/// Downstream delivery of tagged readings and status changes.
#[async_trait]
pub trait DriverOutput: Send + Sync {
    async fn send_response(
        &self,
        responses: &[Response],
        driver_id: &str,
        node_index: u32,
    ) -> Result<()>;

    async fn send_status(&self, status: &Status, driver_id: &str, node_index: u32) -> Result<()>;
}

/// Substitute `${key}` placeholders. String values are JSON-encoded so the
/// template can be a JSON body.
pub fn render_template(template: &str, values: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("${{{key}}}"), value);
    }
    out
}

fn json_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn response_values<'a>(
    response: &Response,
    driver_id: &str,
    node_index: u32,
) -> HashMap<&'a str, String> {
    HashMap::from([
        ("deviceId", json_str(&response.device_id)),
        ("tagId", json_str(&response.tag_id)),
        ("value", json_str(&response.value)),
        ("receivedTime", response.received_time.to_string()),
        ("driverId", json_str(driver_id)),
        ("nodeIndex", node_index.to_string()),
    ])
}

fn status_values<'a>(status: &Status, driver_id: &str, node_index: u32) -> HashMap<&'a str, String> {
    HashMap::from([
        ("deviceId", json_str(&status.device_id)),
        ("status", json_str(&status.status.to_string())),
        ("issuedTime", status.issued_time.to_string()),
        ("driverId", json_str(driver_id)),
        ("nodeIndex", node_index.to_string()),
    ])
}

// ============================================================================
// Log output
// ============================================================================

/// Log-only output, the default.
#[derive(Default)]
pub struct LogOutput;

#[async_trait]
impl DriverOutput for LogOutput {
    async fn send_response(
        &self,
        responses: &[Response],
        _driver_id: &str,
        _node_index: u32,
    ) -> Result<()> {
        for response in responses {
            debug!(
                "[{}] tag-id: {}, value: {}, received-time: {}",
                response.device_id, response.tag_id, response.value, response.received_time
            );
        }
        Ok(())
    }

    async fn send_status(&self, status: &Status, driver_id: &str, node_index: u32) -> Result<()> {
        debug!(
            "[{}] status: {}, driver-id: {}, node-index: {}",
            status.device_id, status.status, driver_id, node_index
        );
        Ok(())
    }
}

// ============================================================================
// File output
// ============================================================================

/// CSV append output (`<name>.csv` in the working directory).
pub struct FileOutput {
    response_file: String,
    status_file: String,
}

impl FileOutput {
    pub fn new(response_file: impl Into<String>, status_file: impl Into<String>) -> Self {
        Self {
            response_file: response_file.into(),
            status_file: status_file.into(),
        }
    }

    fn append(path: &str, records: Vec<Vec<String>>) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(format!("./{path}.csv"))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        for record in records {
            writer
                .write_record(&record)
                .map_err(|e| GatewayError::Internal(format!("write csv record failed: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| GatewayError::Internal(format!("flush csv failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl DriverOutput for FileOutput {
    async fn send_response(
        &self,
        responses: &[Response],
        _driver_id: &str,
        _node_index: u32,
    ) -> Result<()> {
        let records = responses
            .iter()
            .map(|r| {
                vec![
                    r.tag_id.clone(),
                    r.value.clone(),
                    r.device_id.clone(),
                    r.received_time.to_string(),
                ]
            })
            .collect();
        let path = self.response_file.clone();
        tokio::task::spawn_blocking(move || Self::append(&path, records))
            .await
            .map_err(|e| GatewayError::Internal(format!("csv writer task failed: {e}")))?
            .map_err(|e| {
                GatewayError::Internal(format!(
                    "write response to {}.csv failed: {e}",
                    self.response_file
                ))
            })
    }

    async fn send_status(&self, status: &Status, _driver_id: &str, _node_index: u32) -> Result<()> {
        let record = vec![
            status.device_id.clone(),
            status.status.to_string(),
            status.issued_time.to_string(),
        ];
        let path = self.status_file.clone();
        tokio::task::spawn_blocking(move || Self::append(&path, vec![record]))
            .await
            .map_err(|e| GatewayError::Internal(format!("csv writer task failed: {e}")))?
            .map_err(|e| {
                GatewayError::Internal(format!(
                    "write status to {}.csv failed: {e}",
                    self.status_file
                ))
            })
    }
}

// ============================================================================
// REST output
// ============================================================================

/// Templated POST to one of a set of target URLs, routed through a load
/// balancer that skips failing targets.
pub struct RestOutput {
    urls: Vec<String>,
    response_path: String,
    response_format: String,
    status_path: String,
    status_format: String,
    http: reqwest::Client,
    balancer: LoadBalancer,
}

impl RestOutput {
    pub fn new(
        urls: Vec<String>,
        response_path: impl Into<String>,
        response_format: impl Into<String>,
        status_path: impl Into<String>,
        status_format: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        let balancer = LoadBalancer::new(urls.len());
        Ok(Self {
            urls,
            response_path: response_path.into(),
            response_format: response_format.into(),
            status_path: status_path.into(),
            status_format: status_format.into(),
            http,
            balancer,
        })
    }

    async fn post(&self, path: &str, body: String) -> Result<()> {
        self.balancer
            .run(|idx| {
                let body = body.clone();
                async move {
                    let url = format!("{}{}", self.urls[idx].trim_end_matches('/'), path);
                    let resp = self
                        .http
                        .post(&url)
                        .header("Content-Type", "application/json")
                        .body(body)
                        .send()
                        .await?;
                    if resp.status().is_success() {
                        Ok(())
                    } else {
                        Err(GatewayError::Protocol(format!(
                            "rest output answered {}",
                            resp.status()
                        )))
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl DriverOutput for RestOutput {
    async fn send_response(
        &self,
        responses: &[Response],
        driver_id: &str,
        node_index: u32,
    ) -> Result<()> {
        let rendered: Vec<String> = responses
            .iter()
            .map(|r| {
                render_template(
                    &self.response_format,
                    &response_values(r, driver_id, node_index),
                )
            })
            .collect();
        let body = format!("[{}]", rendered.join(","));
        self.post(&self.response_path, body)
            .await
            .map_err(|e| GatewayError::Protocol(format!("rest send responses failed::{e}")))
    }

    async fn send_status(&self, status: &Status, driver_id: &str, node_index: u32) -> Result<()> {
        let body = render_template(
            &self.status_format,
            &status_values(status, driver_id, node_index),
        );
        self.post(&self.status_path, body)
            .await
            .map_err(|e| GatewayError::Protocol(format!("rest send status failed::{e}")))
    }
}

// ============================================================================
// Kafka output
// ============================================================================

/// Templated records to a pair of Kafka topics.
#[cfg(feature = "kafka")]
pub struct KafkaOutput {
    response_topic: String,
    response_format: String,
    status_topic: String,
    status_format: String,
    client: rskafka::client::Client,
    partitions: tokio::sync::Mutex<
        HashMap<String, Arc<rskafka::client::partition::PartitionClient>>,
    >,
}

#[cfg(feature = "kafka")]
impl KafkaOutput {
    pub async fn connect(
        bootstrap: Vec<String>,
        response_topic: impl Into<String>,
        response_format: impl Into<String>,
        status_topic: impl Into<String>,
        status_format: impl Into<String>,
    ) -> Result<Self> {
        let client = rskafka::client::ClientBuilder::new(bootstrap)
            .build()
            .await
            .map_err(|e| GatewayError::Connection(format!("kafka connect failed: {e}")))?;
        Ok(Self {
            response_topic: response_topic.into(),
            response_format: response_format.into(),
            status_topic: status_topic.into(),
            status_format: status_format.into(),
            client,
            partitions: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    async fn produce(&self, topic: &str, payload: String) -> Result<()> {
        use rskafka::client::partition::{Compression, UnknownTopicHandling};
        use rskafka::record::Record;

        let partition = {
            let mut partitions = self.partitions.lock().await;
            match partitions.get(topic) {
                Some(p) => p.clone(),
                None => {
                    let p = Arc::new(
                        self.client
                            .partition_client(topic, 0, UnknownTopicHandling::Retry)
                            .await
                            .map_err(|e| {
                                GatewayError::Connection(format!("kafka partition failed: {e}"))
                            })?,
                    );
                    partitions.insert(topic.to_string(), p.clone());
                    p
                }
            }
        };
        let record = Record {
            key: None,
            value: Some(payload.into_bytes()),
            headers: Default::default(),
            timestamp: chrono::Utc::now(),
        };
        partition
            .produce(vec![record], Compression::default())
            .await
            .map_err(|e| GatewayError::Protocol(format!("kafka produce failed: {e}")))?;
        Ok(())
    }
}

#[cfg(feature = "kafka")]
#[async_trait]
impl DriverOutput for KafkaOutput {
    async fn send_response(
        &self,
        responses: &[Response],
        driver_id: &str,
        node_index: u32,
    ) -> Result<()> {
        for response in responses {
            let payload = render_template(
                &self.response_format,
                &response_values(response, driver_id, node_index),
            );
            self.produce(&self.response_topic, payload)
                .await
                .map_err(|e| GatewayError::Protocol(format!("kafka send responses failed::{e}")))?;
        }
        Ok(())
    }

    async fn send_status(&self, status: &Status, driver_id: &str, node_index: u32) -> Result<()> {
        let payload = render_template(
            &self.status_format,
            &status_values(status, driver_id, node_index),
        );
        self.produce(&self.status_topic, payload)
            .await
            .map_err(|e| GatewayError::Protocol(format!("kafka send status failed::{e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template() {
        let response = Response::new("d1", "t1", "21.5", 1700000000000);
        let values = response_values(&response, "drv", 2);
        let out = render_template(
            r#"{"device":${deviceId},"tag":${tagId},"v":${value},"t":${receivedTime},"node":${nodeIndex}}"#,
            &values,
        );
        assert_eq!(
            out,
            r#"{"device":"d1","tag":"t1","v":"21.5","t":1700000000000,"node":2}"#
        );
        // templates are valid JSON once substituted
        assert!(serde_json::from_str::<serde_json::Value>(&out).is_ok());
    }

    #[test]
    fn test_render_template_escapes_values() {
        let response = Response::new("d1", "t\"1", "line\nbreak", 5);
        let values = response_values(&response, "drv", 1);
        let out = render_template(r#"{"tag":${tagId},"v":${value}}"#, &values);
        assert!(serde_json::from_str::<serde_json::Value>(&out).is_ok());
    }

    #[test]
    fn test_status_values() {
        let status = Status::new("d9", crate::core::data::StatusCode::Connected, 123);
        let values = status_values(&status, "drv", 3);
        assert_eq!(values["status"], "\"CONNECTED\"");
        assert_eq!(values["issuedTime"], "123");
    }

    #[tokio::test]
    async fn test_log_output_accepts_everything() {
        let output = LogOutput;
        let responses = vec![Response::new("d", "t", "v", 1)];
        assert!(output.send_response(&responses, "drv", 1).await.is_ok());
        let status = Status::new("d", crate::core::data::StatusCode::Connecting, 1);
        assert!(output.send_status(&status, "drv", 1).await.is_ok());
    }
}
