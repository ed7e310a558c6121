//! Stream reassembly for the TCP/UDP drivers.
//!
//! Raw chunks accumulate per remote address until a frame boundary is
//! found: a user `bufferingFunc`, configured `endBytes`, a one-shot time
//! buffer, or immediately. Emitted packets are split into sub-packets on
//! `startBytes`/`endBytes` before reaching the command runtime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{error, trace};

use crate::core::data::now_millis;
use crate::core::util::{find_last, find_pattern, hex_dump};
use crate::driver::command::ExecContext;
use crate::driver::options::FramingOptions;
use crate::driver::protocol::DeviceProtocol;
use crate::script::ScriptValue;

/// Accumulated chunks from one remote sender.
#[derive(Default)]
pub struct PacketBuffer {
    chunks: Vec<Vec<u8>>,
    combined: Vec<u8>,
    timer_armed: bool,
}

impl PacketBuffer {
    fn push(&mut self, data: &[u8], combine: bool) {
        self.chunks.push(data.to_vec());
        if combine {
            self.combined.extend_from_slice(data);
        }
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Drop `n` bytes from the tail of the chunk list (used when a frame
    /// boundary falls inside the last chunk and chunks are kept separate).
    fn trim_tail(&mut self, mut n: usize) {
        while n > 0 {
            let Some(last) = self.chunks.last_mut() else {
                return;
            };
            if last.len() > n {
                last.truncate(last.len() - n);
                return;
            }
            n -= last.len();
            self.chunks.pop();
        }
    }

    fn chunk_values(&self) -> ScriptValue {
        ScriptValue::List(
            self.chunks
                .iter()
                .map(|c| ScriptValue::Bytes(c.clone()))
                .collect(),
        )
    }
}

/// Per-socket buffering state, keyed by remote address so concurrent
/// senders never interleave.
#[derive(Default)]
pub struct SocketBuffers {
    senders: StdMutex<HashMap<SocketAddr, PacketBuffer>>,
}

impl SocketBuffers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn take(&self, sender: &SocketAddr) -> Option<PacketBuffer> {
        self.senders.lock().unwrap().remove(sender)
    }
}

/// Feed one raw chunk into the buffering pipeline.
pub async fn ingest(
    proto: &Arc<DeviceProtocol>,
    opts: &FramingOptions,
    protocol_fn: Option<&str>,
    buffering_fn: Option<&str>,
    buffers: &Arc<SocketBuffers>,
    data: &[u8],
    sender: SocketAddr,
    ctx: &ExecContext,
) {
    trace!(
        "[{}] received raw data from {}: {}",
        proto.device_id,
        sender,
        hex_dump(data)
    );
    if opts.buffer_time == 0 && buffering_fn.is_none() && opts.end_bytes.is_none() {
        // immediate mode: every chunk is its own packet
        let mut packet = PacketBuffer::default();
        packet.push(data, opts.combine_buffered_data);
        emit(proto, opts, protocol_fn, packet, sender, ctx).await;
        return;
    }
    ingest_buffered(proto, opts, protocol_fn, buffering_fn, buffers, data, sender, ctx, true)
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn ingest_buffered(
    proto: &Arc<DeviceProtocol>,
    opts: &FramingOptions,
    protocol_fn: Option<&str>,
    buffering_fn: Option<&str>,
    buffers: &Arc<SocketBuffers>,
    data: &[u8],
    sender: SocketAddr,
    ctx: &ExecContext,
    is_first: bool,
) {
    enum Action {
        Wait,
        ArmTimer,
        Emit(PacketBuffer, Option<Vec<u8>>),
        Discard,
    }

    let keep_combined =
        (buffering_fn.is_none() && opts.end_bytes.is_some()) || opts.combine_buffered_data;

    let action = {
        let mut senders = buffers.senders.lock().unwrap();
        let packet = senders.entry(sender).or_default();
        packet.chunks.push(data.to_vec());
        if keep_combined {
            packet.combined.extend_from_slice(data);
        }

        if is_first && buffering_fn.is_some() {
            let fn_name = buffering_fn.unwrap();
            match proto.runtime().call_fn(fn_name, vec![packet.chunk_values()]) {
                Ok(ScriptValue::Bool(true)) => {
                    let packet = senders.remove(&sender).unwrap();
                    Action::Emit(packet, None)
                }
                Ok(ScriptValue::Bool(false)) => {
                    trace!(
                        "[{}] buffering function continue, data: {}",
                        proto.device_id,
                        hex_dump(data)
                    );
                    Action::Wait
                }
                Ok(ScriptValue::List(items)) => {
                    let mut tail = Vec::with_capacity(items.len());
                    let mut valid = true;
                    for item in &items {
                        match item {
                            ScriptValue::Int(v) => tail.push(*v as u8),
                            _ => {
                                valid = false;
                                break;
                            }
                        }
                    }
                    if valid {
                        let packet = senders.remove(&sender).unwrap();
                        Action::Emit(packet, Some(tail))
                    } else {
                        error!(
                            "[{}] buffering-function failed, wrong return type",
                            proto.device_id
                        );
                        Action::Discard
                    }
                }
                Ok(ScriptValue::None) => {
                    trace!("[{}] buffering-function return none, clear buffer", proto.device_id);
                    Action::Discard
                }
                Ok(other) => {
                    error!(
                        "[{}] buffering-function failed, wrong return type: {}",
                        proto.device_id,
                        other.type_name()
                    );
                    Action::Discard
                }
                Err(e) => {
                    error!("[{}] buffering-function failed: {}", proto.device_id, e);
                    Action::Discard
                }
            }
        } else if is_first && opts.end_bytes.is_some() {
            let end = opts.end_bytes.as_deref().unwrap();
            match find_last(&packet.combined, end) {
                None => {
                    trace!(
                        "[{}] buffering end-bytes continue, data: {}",
                        proto.device_id,
                        hex_dump(data)
                    );
                    Action::Wait
                }
                Some(idx) => {
                    let cut = idx + end.len();
                    let tail = packet.combined[cut..].to_vec();
                    let mut packet = senders.remove(&sender).unwrap();
                    if !tail.is_empty() {
                        packet.combined.truncate(cut);
                        if !opts.combine_buffered_data {
                            packet.trim_tail(tail.len());
                        }
                    }
                    Action::Emit(packet, if tail.is_empty() { None } else { Some(tail) })
                }
            }
        } else if opts.buffer_time > 0 && !packet.timer_armed {
            packet.timer_armed = true;
            Action::ArmTimer
        } else {
            Action::Wait
        }
    };

    match action {
        Action::Wait => {}
        Action::Discard => {}
        Action::ArmTimer => {
            let proto = proto.clone();
            let opts = opts.clone();
            let protocol_fn = protocol_fn.map(str::to_string);
            let has_boundary_rule = buffering_fn.is_some() || opts.end_bytes.is_some();
            let buffers = buffers.clone();
            let ctx = ctx.clone();
            let delay = std::time::Duration::from_millis(opts.buffer_time);
            let spawn_proto = proto.clone();
            proto.disposables().spawn(async move {
                let proto = spawn_proto;
                tokio::time::sleep(delay).await;
                if let Some(packet) = buffers.take(&sender) {
                    if has_boundary_rule {
                        error!(
                            "[{}] buffering timeout ({} [ms]): {}",
                            proto.device_id,
                            opts.buffer_time,
                            hex_dump(&packet.combined)
                        );
                    } else {
                        emit(&proto, &opts, protocol_fn.as_deref(), packet, sender, &ctx).await;
                    }
                }
            });
        }
        Action::Emit(packet, reinject) => {
            emit(proto, opts, protocol_fn, packet, sender, ctx).await;
            if let Some(tail) = reinject {
                if !tail.is_empty() {
                    Box::pin(ingest_buffered(
                        proto,
                        opts,
                        protocol_fn,
                        buffering_fn,
                        buffers,
                        &tail,
                        sender,
                        ctx,
                        false,
                    ))
                    .await;
                }
            }
        }
    }
}

/// Deliver one complete packet: split on start/end bytes and hand each
/// sub-packet to the protocol function or the non-periodic commands.
async fn emit(
    proto: &Arc<DeviceProtocol>,
    opts: &FramingOptions,
    protocol_fn: Option<&str>,
    packet: PacketBuffer,
    sender: SocketAddr,
    ctx: &ExecContext,
) {
    if packet.is_empty() || proto.is_set_disconnected() {
        trace!("[{}] buffering ignored, sender={}", proto.device_id, sender);
        return;
    }
    let received_time = now_millis();
    if opts.combine_buffered_data {
        trace!(
            "[{}] buffered raw data(combined): {}",
            proto.device_id,
            hex_dump(&packet.combined)
        );
        let frames = split_sub_packets(
            opts.start_bytes.as_deref(),
            opts.end_bytes.as_deref(),
            &packet.combined,
            opts.retain_start_end_bytes,
        );
        for frame in frames {
            let values = vec![
                ScriptValue::Bytes(frame),
                ScriptValue::Str(sender.to_string()),
            ];
            if let Err(e) = packet_processing(proto, protocol_fn, values, received_time, ctx).await
            {
                error!("[{}] packet processing failed: {}", proto.device_id, e);
            }
        }
    } else {
        let values = vec![packet.chunk_values(), ScriptValue::Str(sender.to_string())];
        if let Err(e) = packet_processing(proto, protocol_fn, values, received_time, ctx).await {
            error!("[{}] packet processing failed: {}", proto.device_id, e);
        }
    }
}

/// Route a reassembled packet: the protocol function may name the read
/// command the packet answers, list the command ids to run, or leave it
/// anonymous.
pub async fn packet_processing(
    proto: &Arc<DeviceProtocol>,
    protocol_fn: Option<&str>,
    values: Vec<ScriptValue>,
    received_time: i64,
    ctx: &ExecContext,
) -> crate::core::error::Result<()> {
    let runtime = proto.runtime();
    match protocol_fn {
        None => {
            proto.push_received(None, values.clone(), received_time);
            runtime
                .execute_non_periodic(proto, &values, received_time, ctx)
                .await
        }
        Some(fn_name) => {
            let result = runtime.call_fn_with_args(fn_name, None, &values, Some(received_time))?;
            match result {
                ScriptValue::None => {
                    proto.push_received(None, values, received_time);
                    Ok(())
                }
                ScriptValue::Str(cmd_id) => {
                    proto.push_received(Some(cmd_id), values, received_time);
                    Ok(())
                }
                ScriptValue::List(items) => {
                    let ids: Vec<String> =
                        items.iter().map(|v| v.to_plain_string()).collect();
                    runtime
                        .execute_non_periodic_ids(proto, &ids, Some(&values), Some(received_time), ctx)
                        .await
                }
                other => {
                    error!(
                        "[{}] protocol function invalid output type, output type={}",
                        proto.device_id,
                        other.type_name()
                    );
                    Ok(())
                }
            }
        }
    }
}

/// Split a packet into zero or more sub-packets on `start`/`end` patterns.
pub fn split_sub_packets(
    start: Option<&[u8]>,
    end: Option<&[u8]>,
    bytes: &[u8],
    retain: bool,
) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    match (start, end) {
        (Some(start), None) => {
            let mut idx = find_pattern(bytes, start);
            if !idx.is_empty() {
                idx.push(bytes.len());
                for w in idx.windows(2) {
                    let from = if retain { w[0] } else { w[0] + start.len() };
                    out.push(bytes[from..w[1]].to_vec());
                }
            }
        }
        (None, Some(end)) => {
            let idx = find_pattern(bytes, end);
            if !idx.is_empty() {
                let mut from = 0;
                for &i in &idx {
                    let to = if retain { i + end.len() } else { i };
                    out.push(bytes[from..to].to_vec());
                    from = i + end.len();
                }
            }
        }
        (Some(start), Some(end)) => {
            let starts = find_pattern(bytes, start);
            let ends = find_pattern(bytes, end);
            let mut s = 0;
            for &e in &ends {
                if s >= starts.len() {
                    break;
                }
                if starts[s] + start.len() <= e {
                    if retain {
                        out.push(bytes[starts[s]..e + end.len()].to_vec());
                    } else {
                        out.push(bytes[starts[s] + start.len()..e].to_vec());
                    }
                    s += 1;
                }
            }
        }
        (None, None) => out.push(bytes.to_vec()),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_no_delimiters() {
        assert_eq!(split_sub_packets(None, None, b"abc", false), vec![b"abc".to_vec()]);
    }

    #[test]
    fn test_split_end_bytes() {
        // two complete frames, the tail "D" is not emitted
        let frames = split_sub_packets(None, Some(b"\r\n"), b"A\r\nBC\r\nD", false);
        assert_eq!(frames, vec![b"A".to_vec(), b"BC".to_vec()]);

        let frames = split_sub_packets(None, Some(b"\r\n"), b"A\r\nBC\r\n", true);
        assert_eq!(frames, vec![b"A\r\n".to_vec(), b"BC\r\n".to_vec()]);
    }

    #[test]
    fn test_split_start_bytes() {
        let frames = split_sub_packets(Some(b"\x02"), None, b"\x02AB\x02CD", false);
        assert_eq!(frames, vec![b"AB".to_vec(), b"CD".to_vec()]);
        // leading garbage before the first start marker is dropped
        let frames = split_sub_packets(Some(b"\x02"), None, b"xx\x02AB", false);
        assert_eq!(frames, vec![b"AB".to_vec()]);
    }

    #[test]
    fn test_split_start_end_pairs() {
        let frames = split_sub_packets(Some(b"\x02"), Some(b"\x03"), b"\x02AB\x03\x02C\x03", false);
        assert_eq!(frames, vec![b"AB".to_vec(), b"C".to_vec()]);
        let frames = split_sub_packets(Some(b"\x02"), Some(b"\x03"), b"\x02AB\x03", true);
        assert_eq!(frames, vec![b"\x02AB\x03".to_vec()]);
        // end marker before any start marker yields nothing
        let frames = split_sub_packets(Some(b"\x02"), Some(b"\x03"), b"AB\x03", false);
        assert!(frames.is_empty());
    }

    use crate::core::events::DriverEvents;
    use crate::driver::protocol::{CommandOutcome, DeviceProtocol};
    use crate::driver::service::DriverService;
    use crate::driver::sink::LogOutput;
    use std::time::Duration;

    fn dummy_protocol() -> Arc<DeviceProtocol> {
        let service = DriverService::new(
            "test-driver",
            "/driver",
            false,
            false,
            "",
            Arc::new(LogOutput),
            DriverEvents::new(),
        );
        let device = crate::core::device::Device {
            id: "dev1".into(),
            connection_url: "dummy://local".into(),
            ..Default::default()
        };
        DeviceProtocol::build(service, device).unwrap()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    async fn next_frame(proto: &Arc<DeviceProtocol>) -> Option<Vec<u8>> {
        match proto.poll_received("any", Duration::from_millis(50)).await {
            Ok(CommandOutcome::Received { values, .. }) => match values.first() {
                Some(ScriptValue::Bytes(frame)) => Some(frame.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_end_bytes_frames_across_chunks() {
        // "A\r\nBC\r\nD" fed as "A\r\nB" + "C\r\nD" emits ["A", "BC"],
        // the residual "D" keeps waiting
        let proto = dummy_protocol();
        let opts = FramingOptions {
            end_bytes: Some(b"\r\n".to_vec()),
            combine_buffered_data: true,
            ..Default::default()
        };
        let buffers = SocketBuffers::new();

        ingest(&proto, &opts, None, None, &buffers, b"A\r\nB", addr(), &None).await;
        assert_eq!(next_frame(&proto).await.as_deref(), Some(b"A".as_ref()));

        ingest(&proto, &opts, None, None, &buffers, b"C\r\nD", addr(), &None).await;
        assert_eq!(next_frame(&proto).await.as_deref(), Some(b"BC".as_ref()));

        // nothing more until the tail completes
        assert!(next_frame(&proto).await.is_none());
        ingest(&proto, &opts, None, None, &buffers, b"E\r\n", addr(), &None).await;
        assert_eq!(next_frame(&proto).await.as_deref(), Some(b"DE".as_ref()));
    }

    #[tokio::test]
    async fn test_immediate_mode_emits_each_chunk() {
        let proto = dummy_protocol();
        let opts = FramingOptions {
            combine_buffered_data: true,
            ..Default::default()
        };
        let buffers = SocketBuffers::new();
        ingest(&proto, &opts, None, None, &buffers, b"PING", addr(), &None).await;
        assert_eq!(next_frame(&proto).await.as_deref(), Some(b"PING".as_ref()));
    }

    #[tokio::test]
    async fn test_time_buffer_flushes_after_window() {
        let proto = dummy_protocol();
        let opts = FramingOptions {
            buffer_time: 30,
            combine_buffered_data: true,
            ..Default::default()
        };
        let buffers = SocketBuffers::new();
        ingest(&proto, &opts, None, None, &buffers, b"AB", addr(), &None).await;
        ingest(&proto, &opts, None, None, &buffers, b"CD", addr(), &None).await;
        // nothing before the window fires
        assert!(proto
            .poll_received("any", Duration::from_millis(5))
            .await
            .is_err());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(next_frame(&proto).await.as_deref(), Some(b"ABCD".as_ref()));
    }

    #[test]
    fn test_trim_tail_across_chunks() {
        let mut packet = PacketBuffer::default();
        packet.push(b"ABC", false);
        packet.push(b"DE", false);
        packet.trim_tail(3);
        assert_eq!(packet.chunks, vec![b"AB".to_vec()]);
        packet.trim_tail(10);
        assert!(packet.chunks.is_empty());
    }
}
