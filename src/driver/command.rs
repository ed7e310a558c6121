//! Command compilation and execution.
//!
//! Each device's commands are compiled once at connect time; their script
//! functions are renamed with the command id so one evaluator can hold every
//! command of a device. Execution runs under a per-device command lock, in
//! ascending `order`, with the cursor directed by the optional `control`
//! function.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, trace};

use crate::core::data::{now_millis, Response};
use crate::core::device::{is_valid_id, Command, Device};
use crate::core::error::{GatewayError, Result};
use crate::core::tasks::TaskSet;
use crate::driver::protocol::{CommandOutcome, DeviceProtocol};
use crate::script::{rename_script_fn, Evaluator, RhaiEvaluator, ScriptHost, ScriptValue};

/// Per-invocation driver context (e.g. the socket a tcp-server reply must
/// go to, or the http-server response collector). Drivers downcast it.
pub type ExecContext = Option<Arc<dyn Any + Send + Sync>>;

/// Compiled functions of one command.
#[derive(Clone)]
struct CommandFns {
    command: Command,
    cmd_fn: Option<String>,
    request_info_fn: Option<String>,
    delay_fn: Option<String>,
    control_fn: Option<String>,
}

/// Compilation and execution state of one device's commands.
pub struct CommandRuntime {
    evaluator: StdRwLock<RhaiEvaluator>,
    functions: StdMutex<HashMap<String, CommandFns>>,
    /// effective period (ms) -> commands, sorted by order.
    period_groups: StdMutex<HashMap<i64, Vec<Command>>>,
    device_commands: StdMutex<Vec<Command>>,
    protocol_fn: StdMutex<Option<String>>,
    buffering_fn: StdMutex<Option<String>>,
    lock: Mutex<()>,
    tickers: TaskSet,
}

impl CommandRuntime {
    pub fn new(default_script: &str, host: Arc<dyn ScriptHost>) -> Result<Self> {
        let mut evaluator = RhaiEvaluator::with_host(host);
        evaluator
            .compile(default_script)
            .map_err(|e| GatewayError::script(format!("default script compile failed::{e}")))?;
        Ok(Self {
            evaluator: StdRwLock::new(evaluator),
            functions: StdMutex::new(HashMap::new()),
            period_groups: StdMutex::new(HashMap::new()),
            device_commands: StdMutex::new(Vec::new()),
            protocol_fn: StdMutex::new(None),
            buffering_fn: StdMutex::new(None),
            lock: Mutex::new(()),
            tickers: TaskSet::new(),
        })
    }

    /// Cancel periodic tickers.
    pub fn dispose(&self) {
        self.tickers.clear();
    }

    // ------------------------------------------------------------------
    // Compilation
    // ------------------------------------------------------------------

    /// Compile every command of the device and build the period-group
    /// table. Validation failures surface synchronously, before connect.
    pub fn compile_device(&self, device: &Device) -> Result<()> {
        let mut commands: Vec<Command> = device.commands.iter().cloned().collect();
        commands.sort_by_key(|c| (c.order, c.id.clone()));

        let mut functions = HashMap::new();
        for command in &commands {
            trace!("[{}] cmdId={}, initialize command script", device.id, command.id);
            functions.insert(command.id.clone(), self.compile_command(command)?);
        }
        *self.functions.lock().unwrap() = functions;
        *self.device_commands.lock().unwrap() = commands.clone();

        let mut groups: HashMap<i64, Vec<Command>> = HashMap::new();
        for command in commands {
            let periodic_kind = !command.command_type.is_starting() && !command.command_type.is_stopping();
            if let (true, Some(period)) = (periodic_kind, command.effective_period()) {
                groups.entry(period).or_default().push(command);
            }
        }
        for group in groups.values_mut() {
            group.sort_by_key(|c| (c.order, c.id.clone()));
        }
        *self.period_groups.lock().unwrap() = groups;
        Ok(())
    }

    /// Compile the per-device protocol script, registering `protocolFunc` /
    /// `bufferingFunc` under device-suffixed names.
    pub fn compile_protocol_script(&self, device: &Device) -> Result<()> {
        let script = device.protocol_script.trim();
        if script.is_empty() {
            return Ok(());
        }
        let protocol_name = format!("protocolFunc_{}", device.id);
        let buffering_name = format!("bufferingFunc_{}", device.id);
        let renamed = rename_script_fn(
            &rename_script_fn(script, "protocolFunc", &protocol_name),
            "bufferingFunc",
            &buffering_name,
        );
        let mut evaluator = self.evaluator.write().unwrap();
        evaluator
            .compile(&renamed)
            .map_err(|e| GatewayError::script(format!("compile protocol script failed::{e}")))?;
        if evaluator.has_fn(&protocol_name) {
            *self.protocol_fn.lock().unwrap() = Some(protocol_name);
        }
        if evaluator.has_fn(&buffering_name) {
            *self.buffering_fn.lock().unwrap() = Some(buffering_name);
        }
        Ok(())
    }

    /// Run a protocol script verbatim (drivers without framing scripts).
    pub fn execute_protocol_script(&self, device: &Device) -> Result<()> {
        let script = device.protocol_script.trim();
        if script.is_empty() {
            return Ok(());
        }
        self.evaluator
            .write()
            .unwrap()
            .compile(script)
            .map_err(|e| GatewayError::script(format!("execute protocol script failed::{e}")))
    }

    pub fn protocol_fn(&self) -> Option<String> {
        self.protocol_fn.lock().unwrap().clone()
    }

    pub fn buffering_fn(&self) -> Option<String> {
        self.buffering_fn.lock().unwrap().clone()
    }

    fn compile_command(&self, command: &Command) -> Result<CommandFns> {
        if !is_valid_id(&command.id) {
            return Err(GatewayError::Validation(format!(
                "cmdId={}, invalid command-id",
                command.id
            )));
        }

        let mut fns = CommandFns {
            command: command.clone(),
            cmd_fn: None,
            request_info_fn: None,
            delay_fn: None,
            control_fn: None,
        };

        if let Some(script) = command.cmd_script.as_deref().filter(|s| !s.trim().is_empty()) {
            let suffix = &command.id;
            let mut renamed = script.to_string();
            for base in ["cmdFunc", "requestInfo", "delay", "control"] {
                renamed = rename_script_fn(&renamed, base, &format!("{base}_{suffix}"));
            }
            let mut evaluator = self.evaluator.write().unwrap();
            evaluator.compile(&renamed).map_err(|e| {
                GatewayError::Validation(format!("cmdId={}, compile failed::{e}", command.id))
            })?;
            let lookup = |name: &str| {
                let full = format!("{name}_{suffix}");
                evaluator.has_fn(&full).then_some(full)
            };
            fns.cmd_fn = lookup("cmdFunc");
            fns.request_info_fn = lookup("requestInfo");
            fns.delay_fn = lookup("delay");
            fns.control_fn = lookup("control");

            if let Some(control) = &fns.control_fn {
                let arity = evaluator.fn_arity(control).unwrap_or(0);
                if arity != 2 && arity != 3 {
                    return Err(GatewayError::Validation(format!(
                        "cmdId={}, control arguments count must be 2 or 3 >> control(commandList, idx, exception), arguments count: {arity}",
                        command.id
                    )));
                }
            }
        }

        let ty = command.command_type;
        let static_info_empty = command
            .request_info
            .as_deref()
            .map(|s| s.is_empty())
            .unwrap_or(true);
        if fns.request_info_fn.is_none()
            && static_info_empty
            && (ty.is_write() || (ty.is_read() && command.period_group >= 0))
        {
            return Err(GatewayError::Validation(format!(
                "cmdId={}, request-info is not defined",
                command.id
            )));
        }
        if (ty.is_read() || ty.is_request()) && fns.cmd_fn.is_none() {
            return Err(GatewayError::Validation(format!(
                "cmdId={}, {:?} has no \"cmdFunc\"",
                command.id, ty
            )));
        }
        Ok(fns)
    }

    fn resolve(&self, command: &Command) -> Result<CommandFns> {
        if let Some(fns) = self.functions.lock().unwrap().get(&command.id) {
            return Ok(fns.clone());
        }
        self.compile_command(command)
    }

    fn resolve_ids(&self, command_ids: &[String]) -> Result<Vec<CommandFns>> {
        let functions = self.functions.lock().unwrap();
        command_ids
            .iter()
            .map(|id| {
                functions.get(id).cloned().ok_or_else(|| {
                    GatewayError::Validation(format!(
                        "execute commands failed, (cmdId: {id}) is not registered command"
                    ))
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Script invocation
    // ------------------------------------------------------------------

    /// Call a compiled function with explicit arguments.
    pub fn call_fn(&self, name: &str, args: Vec<ScriptValue>) -> Result<ScriptValue> {
        self.evaluator.read().unwrap().call(name, args)
    }

    /// Call a compiled function, shaping the arguments to its arity the way
    /// command functions expect: `[initial?] input... [received_time?]`, the
    /// timestamp only when the function takes every available argument.
    pub fn call_fn_with_args(
        &self,
        name: &str,
        initial: Option<&ScriptValue>,
        input: &[ScriptValue],
        received_time: Option<i64>,
    ) -> Result<ScriptValue> {
        let evaluator = self.evaluator.read().unwrap();
        let arity = evaluator
            .fn_arity(name)
            .ok_or_else(|| GatewayError::script(format!("function {name} is not defined")))?;
        let possible =
            input.len() + usize::from(initial.is_some()) + usize::from(received_time.is_some());
        if arity > possible {
            return Err(GatewayError::script(format!(
                "invalid function, function arguments count: {arity}, possible input arguments count: {possible}"
            )));
        }
        let mut args = Vec::with_capacity(arity);
        if let Some(init) = initial {
            args.push(init.clone());
        }
        args.extend(input.iter().cloned());
        if let Some(time) = received_time {
            if arity == possible {
                args.truncate(arity.saturating_sub(1));
                args.push(ScriptValue::Int(time));
            }
        }
        args.truncate(arity);
        evaluator.call(name, args)
    }

    /// Apply a command function to a received packet and shape its output
    /// into responses.
    pub fn process_command_function(
        &self,
        proto: &DeviceProtocol,
        cmd_fn: &str,
        input: &[ScriptValue],
        received_time: i64,
        initial: Option<&ScriptValue>,
    ) -> Result<Option<Vec<Response>>> {
        let output = self.call_fn_with_args(cmd_fn, initial, input, Some(received_time))?;
        self.shape_output(proto, output, received_time)
    }

    fn shape_output(
        &self,
        proto: &DeviceProtocol,
        output: ScriptValue,
        received_time: i64,
    ) -> Result<Option<Vec<Response>>> {
        let items = match output {
            ScriptValue::None => return Ok(None),
            ScriptValue::List(items) => items,
            other => {
                return Err(GatewayError::script(format!(
                    "command function output type is {}",
                    other.type_name()
                )))
            }
        };
        let mut responses = Vec::with_capacity(items.len());
        for item in items {
            let ScriptValue::List(tuple) = item else {
                return Err(GatewayError::script(format!(
                    "output parsing failed (tag-value is not a tuple), type={}",
                    item.type_name()
                )));
            };
            if tuple.len() != 2 && tuple.len() != 3 {
                return Err(GatewayError::script(format!(
                    "output parsing failed (wrong tuple size), size={}",
                    tuple.len()
                )));
            }
            let time = match tuple.get(2) {
                None => received_time,
                Some(ScriptValue::Int(t)) => *t,
                Some(other) => {
                    return Err(GatewayError::script(format!(
                        "output parsing failed (wrong received-time format), type={}",
                        other.type_name()
                    )))
                }
            };
            let tag = tuple[0].to_plain_string();
            let value = tuple[1].to_plain_string();
            debug!("[{}] tag: {}, value: {}, time: {}", proto.device_id, tag, value, time);
            responses.push(Response::new(proto.device_id.clone(), tag, value, time));
        }
        if responses.is_empty() {
            Ok(None)
        } else {
            Ok(Some(responses))
        }
    }

    // ------------------------------------------------------------------
    // Execution entry points
    // ------------------------------------------------------------------

    /// Run the starting commands once, then install one ticker per period
    /// group. A failing starting command drives the device into
    /// CONNECTION_LOST instead of connecting half-configured.
    pub async fn starting_commands(&self, proto: &Arc<DeviceProtocol>) {
        proto.clear_connection_lost_flag();
        let starting: Vec<Command> = {
            let commands = self.device_commands.lock().unwrap();
            commands
                .iter()
                .filter(|c| c.command_type.is_starting())
                .cloned()
                .collect()
        };
        if !starting.is_empty() {
            debug!("[{}] execute starting command", proto.device_id);
            let result = {
                let _guard = self.lock.lock().await;
                self.execute_command_set(proto, starting, true, None, None, None, &None)
                    .await
            };
            if let Err(e) = result {
                error!(
                    "[{}] error on executing starting request commands: {}",
                    proto.device_id, e
                );
                proto.set_connection_lost();
            }
        }
        if proto.connection_lost_occurred() {
            return;
        }

        let groups: Vec<(i64, Vec<Command>)> = {
            let groups = self.period_groups.lock().unwrap();
            groups.iter().map(|(p, c)| (*p, c.clone())).collect()
        };
        for (period, commands) in groups {
            let proto = proto.clone();
            self.tickers.spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(period as u64));
                // overlapping ticks coalesce, latest wins
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let runtime = proto.runtime();
                    let result = {
                        let _guard = runtime.lock.lock().await;
                        runtime
                            .execute_command_set(&proto, commands.clone(), true, None, None, None, &None)
                            .await
                    };
                    if let Err(e) = result {
                        error!(
                            "[{}] error on executing periodic commands: {}",
                            proto.device_id, e
                        );
                    }
                }
            });
        }
    }

    /// Run the stopping commands, best effort.
    pub async fn stopping_commands(&self, proto: &Arc<DeviceProtocol>) {
        let stopping: Vec<Command> = {
            let commands = self.device_commands.lock().unwrap();
            commands
                .iter()
                .filter(|c| c.command_type.is_stopping())
                .cloned()
                .collect()
        };
        if stopping.is_empty() {
            return;
        }
        debug!("[{}] execute stopping command", proto.device_id);
        let result = {
            let _guard = self.lock.lock().await;
            self.execute_command_set(proto, stopping, true, None, None, None, &None)
                .await
        };
        if let Err(e) = result {
            error!(
                "[{}] error on executing stopping request commands: {}",
                proto.device_id, e
            );
        }
    }

    /// Run every non-periodic command against a received packet.
    pub async fn execute_non_periodic(
        &self,
        proto: &Arc<DeviceProtocol>,
        received: &[ScriptValue],
        received_time: i64,
        ctx: &ExecContext,
    ) -> Result<()> {
        let non_periodic: Vec<Command> = {
            let commands = self.device_commands.lock().unwrap();
            commands.iter().filter(|c| c.period_group < 0).cloned().collect()
        };
        let _guard = self.lock.lock().await;
        self.execute_command_set(
            proto,
            non_periodic,
            true,
            Some(received),
            Some(received_time),
            None,
            ctx,
        )
        .await?;
        Ok(())
    }

    /// Run the named commands against a received packet (protocol-function
    /// dispatch).
    pub async fn execute_non_periodic_ids(
        &self,
        proto: &Arc<DeviceProtocol>,
        command_ids: &[String],
        received: Option<&[ScriptValue]>,
        received_time: Option<i64>,
        ctx: &ExecContext,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let fns = self.resolve_ids(command_ids)?;
        self.execute_list(proto, fns, true, received, received_time, None, ctx)
            .await?;
        Ok(())
    }

    /// Lock-protected execution of explicit command ids (REST surface).
    pub async fn locked_execute_ids(
        &self,
        proto: &Arc<DeviceProtocol>,
        command_ids: &[String],
        initial_value: Option<&str>,
        emit_responses: bool,
    ) -> Result<Vec<Response>> {
        let _guard = self.lock.lock().await;
        let fns = self.resolve_ids(command_ids)?;
        let initial = initial_value.and_then(ScriptValue::from_initial_value);
        self.execute_list(proto, fns, emit_responses, None, None, initial, &None)
            .await
    }

    /// Lock-protected execution of ad-hoc command definitions.
    pub async fn locked_execute_commands(
        &self,
        proto: &Arc<DeviceProtocol>,
        commands: Vec<Command>,
        initial_value: Option<&str>,
        emit_responses: bool,
    ) -> Result<Vec<Response>> {
        let _guard = self.lock.lock().await;
        let initial = initial_value.and_then(ScriptValue::from_initial_value);
        self.execute_command_set(proto, commands, emit_responses, None, None, initial, &None)
            .await
    }

    async fn execute_command_set(
        &self,
        proto: &Arc<DeviceProtocol>,
        mut commands: Vec<Command>,
        emit: bool,
        received: Option<&[ScriptValue]>,
        received_time: Option<i64>,
        initial: Option<ScriptValue>,
        ctx: &ExecContext,
    ) -> Result<Vec<Response>> {
        commands.sort_by_key(|c| (c.order, c.id.clone()));
        let fns = commands
            .iter()
            .map(|c| self.resolve(c))
            .collect::<Result<Vec<_>>>()?;
        self.execute_list(proto, fns, emit, received, received_time, initial, ctx)
            .await
    }

    /// The command loop: execute each entry, apply its delay, and let
    /// `control` direct the cursor.
    async fn execute_list(
        &self,
        proto: &Arc<DeviceProtocol>,
        fns: Vec<CommandFns>,
        emit: bool,
        received: Option<&[ScriptValue]>,
        received_time: Option<i64>,
        initial: Option<ScriptValue>,
        ctx: &ExecContext,
    ) -> Result<Vec<Response>> {
        let command_list = ScriptValue::List(
            fns.iter()
                .map(|f| ScriptValue::Str(f.command.id.clone()))
                .collect(),
        );
        let mut out = Vec::new();
        let mut i: usize = 0;
        while i < fns.len() {
            let f = &fns[i];
            debug!(
                "[{}] cmdId={}, execute command (type: {:?})",
                proto.device_id, f.command.id, f.command.command_type
            );
            let mut failure: Option<GatewayError> = None;

            match self
                .command_response(proto, f, received, received_time, initial.as_ref(), ctx)
                .await
            {
                Ok(Some(responses)) => {
                    out.extend(responses.iter().cloned());
                    if emit {
                        proto.on_response(responses);
                    }
                }
                Ok(None) => {
                    trace!(
                        "[{}] cmdId={}, null response received",
                        proto.device_id, f.command.id
                    );
                }
                Err(e) => failure = Some(e),
            }

            if failure.is_none() {
                if let Err(e) = self.apply_delay(f).await {
                    failure = Some(e);
                }
            }

            match &f.control_fn {
                Some(control) => {
                    let arity = self
                        .evaluator
                        .read()
                        .unwrap()
                        .fn_arity(control)
                        .unwrap_or(2);
                    let mut args = vec![command_list.clone(), ScriptValue::Int(i as i64)];
                    if arity == 3 {
                        args.push(match &failure {
                            Some(e) => ScriptValue::Throwable(e.to_string()),
                            None => ScriptValue::None,
                        });
                    }
                    let verdict = self.call_fn(control, args).map_err(|e| {
                        self.escalate(
                            proto,
                            &f.command.id,
                            GatewayError::script(format!("control-function failed::{e}")),
                        )
                    })?;
                    match verdict {
                        ScriptValue::Int(idx) => {
                            i = if idx < 0 {
                                (fns.len() as i64 + idx).max(0) as usize
                            } else {
                                (idx as usize).min(fns.len())
                            };
                        }
                        ScriptValue::None => i += 1,
                        ScriptValue::Throwable(msg) => {
                            return Err(self.escalate(
                                proto,
                                &f.command.id,
                                GatewayError::Protocol(msg),
                            ));
                        }
                        other => {
                            return Err(self.escalate(
                                proto,
                                &f.command.id,
                                GatewayError::script(format!(
                                    "control function output type is {}",
                                    other.type_name()
                                )),
                            ));
                        }
                    }
                }
                None => {
                    if let Some(e) = failure {
                        return Err(self.escalate(proto, &f.command.id, e));
                    }
                    i += 1;
                }
            }
            trace!(
                "[{}] cmdId={}, execute command finished",
                proto.device_id, f.command.id
            );
        }
        Ok(out)
    }

    async fn apply_delay(&self, f: &CommandFns) -> Result<()> {
        match &f.delay_fn {
            Some(delay) => {
                let value = self
                    .call_fn(delay, vec![])
                    .map_err(|e| GatewayError::script(format!("delay-function failed::{e}")))?;
                match value {
                    ScriptValue::Int(ms) if ms >= 0 => {
                        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                        Ok(())
                    }
                    ScriptValue::None => {
                        tokio::time::sleep(Duration::from_millis(f.command.after_delay)).await;
                        Ok(())
                    }
                    other => Err(GatewayError::script(format!(
                        "delay function output type is {}",
                        other.type_name()
                    ))),
                }
            }
            None => {
                if f.command.after_delay > 0 {
                    tokio::time::sleep(Duration::from_millis(f.command.after_delay)).await;
                }
                Ok(())
            }
        }
    }

    /// Script failures stay contained; anything else may drive the device
    /// into CONNECTION_LOST depending on its options.
    fn escalate(
        &self,
        proto: &Arc<DeviceProtocol>,
        cmd_id: &str,
        e: GatewayError,
    ) -> GatewayError {
        let is_script = e.is_script();
        if !is_script && proto.connection_lost_on_exception() {
            proto.set_connection_lost();
        }
        let msg = format!("execute commands({cmd_id}) failed::{e}");
        if is_script {
            GatewayError::Script(msg)
        } else {
            GatewayError::Protocol(msg)
        }
    }

    /// Produce one command's responses: apply a matched inbound packet,
    /// run pure requests inline, or go through the driver transport.
    async fn command_response(
        &self,
        proto: &Arc<DeviceProtocol>,
        f: &CommandFns,
        received: Option<&[ScriptValue]>,
        received_time: Option<i64>,
        initial: Option<&ScriptValue>,
        ctx: &ExecContext,
    ) -> Result<Option<Vec<Response>>> {
        let command = &f.command;

        if let (Some(values), Some(time)) = (received, received_time) {
            if command.command_type == crate::core::device::CommandType::ReadRequest {
                let cmd_fn = f.cmd_fn.as_deref().ok_or_else(|| {
                    GatewayError::script(format!("cmdId={}, cmdFunc missing", command.id))
                })?;
                return self.process_command_function(proto, cmd_fn, values, time, initial);
            }
        }

        if command.command_type.is_request() {
            let cmd_fn = f.cmd_fn.as_deref().ok_or_else(|| {
                GatewayError::script(format!("cmdId={}, cmdFunc missing", command.id))
            })?;
            return self.process_command_function(proto, cmd_fn, &[], now_millis(), initial);
        }

        // resolve request info: the script override falls back to the
        // static value; an absent result with no static value skips the
        // command entirely
        let mut request_info = command.request_info.clone().filter(|s| !s.is_empty());
        if let Some(fn_name) = &f.request_info_fn {
            let result = self
                .call_fn_with_args(fn_name, initial, received.unwrap_or(&[]), received_time)
                .map_err(|e| GatewayError::script(format!("request-info failed::{e}")))?;
            match result {
                ScriptValue::Str(info) => {
                    trace!(
                        "[{}] cmdId={}, set request-info as \"{}\"",
                        proto.device_id, command.id, info
                    );
                    request_info = Some(info);
                }
                ScriptValue::None => {
                    if request_info.is_none() {
                        trace!(
                            "[{}] cmdId={}, request function result is null",
                            proto.device_id, command.id
                        );
                        return Ok(None);
                    }
                }
                other => {
                    return Err(GatewayError::script(format!(
                        "request-info output type is {}",
                        other.type_name()
                    )))
                }
            }
        }

        let outcome = proto.transport_command(command, request_info, ctx).await?;
        match outcome {
            CommandOutcome::NoResponse => Ok(None),
            CommandOutcome::Received { values, received_time } => {
                let cmd_fn = f.cmd_fn.as_deref().ok_or_else(|| {
                    GatewayError::script(format!("cmdId={}, cmdFunc missing", command.id))
                })?;
                self.process_command_function(proto, cmd_fn, &values, received_time, initial)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::StatusCode;
    use crate::core::device::CommandType;
    use crate::core::events::DriverEvents;
    use crate::driver::service::DriverService;
    use crate::driver::sink::LogOutput;

    fn request_command(id: &str, order: i32, script: &str) -> Command {
        Command {
            id: id.into(),
            order,
            command_type: CommandType::Request,
            cmd_script: Some(script.into()),
            ..Default::default()
        }
    }

    fn dummy_protocol(commands: Vec<Command>) -> Arc<DeviceProtocol> {
        let service = DriverService::new(
            "test-driver",
            "/driver",
            false,
            false,
            "",
            Arc::new(LogOutput),
            DriverEvents::new(),
        );
        let device = Device {
            id: "dev1".into(),
            connection_url: "dummy://local".into(),
            commands: commands.into_iter().collect(),
            ..Default::default()
        };
        DeviceProtocol::build(service, device).unwrap()
    }

    #[tokio::test]
    async fn test_commands_run_in_order() {
        let commands = vec![
            request_command("c2", 2, r#"fn cmdFunc() { [["t2", "2"]] }"#),
            request_command("c1", 1, r#"fn cmdFunc() { [["t1", "1"]] }"#),
            request_command("c3", 3, r#"fn cmdFunc() { [["t3", "3"]] }"#),
        ];
        let proto = dummy_protocol(commands.clone());
        let responses = proto
            .runtime()
            .locked_execute_commands(&proto, commands, None, false)
            .await
            .unwrap();
        let tags: Vec<&str> = responses.iter().map(|r| r.tag_id.as_str()).collect();
        assert_eq!(tags, vec!["t1", "t2", "t3"]);
        assert!(responses.iter().all(|r| r.device_id == "dev1"));
    }

    #[tokio::test]
    async fn test_control_negative_jumps_from_end() {
        // c1's control jumps to the last command, c3 then falls off the end
        let commands = vec![
            request_command(
                "c1",
                1,
                r#"
fn cmdFunc() { [["t1", "1"]] }
fn control(list, idx) { -1 }
"#,
            ),
            request_command("c2", 2, r#"fn cmdFunc() { [["t2", "2"]] }"#),
            request_command("c3", 3, r#"fn cmdFunc() { [["t3", "3"]] }"#),
        ];
        let proto = dummy_protocol(commands.clone());
        let responses = proto
            .runtime()
            .locked_execute_commands(&proto, commands, None, false)
            .await
            .unwrap();
        let tags: Vec<&str> = responses.iter().map(|r| r.tag_id.as_str()).collect();
        assert_eq!(tags, vec!["t1", "t3"]);
    }

    #[tokio::test]
    async fn test_control_absolute_index_is_clamped() {
        // jumping at or past the list size ends the traversal
        let commands = vec![
            request_command(
                "c1",
                1,
                r#"
fn cmdFunc() { [["t1", "1"]] }
fn control(list, idx) { 99 }
"#,
            ),
            request_command("c2", 2, r#"fn cmdFunc() { [["t2", "2"]] }"#),
        ];
        let proto = dummy_protocol(commands.clone());
        let responses = proto
            .runtime()
            .locked_execute_commands(&proto, commands, None, false)
            .await
            .unwrap();
        let tags: Vec<&str> = responses.iter().map(|r| r.tag_id.as_str()).collect();
        assert_eq!(tags, vec!["t1"]);
    }

    #[tokio::test]
    async fn test_control_swallows_command_failure() {
        // c1's cmdFunc throws; its 3-arg control inspects the error and
        // continues instead of propagating
        let commands = vec![
            request_command(
                "c1",
                1,
                r#"
fn cmdFunc() { throw "sensor offline" }
fn control(list, idx, ex) { () }
"#,
            ),
            request_command("c2", 2, r#"fn cmdFunc() { [["t2", "2"]] }"#),
        ];
        let proto = dummy_protocol(commands.clone());
        let responses = proto
            .runtime()
            .locked_execute_commands(&proto, commands, None, false)
            .await
            .unwrap();
        let tags: Vec<&str> = responses.iter().map(|r| r.tag_id.as_str()).collect();
        assert_eq!(tags, vec!["t2"]);
        // a swallowed script error never drives the connection state
        assert!(!proto.connection_lost_occurred());
    }

    #[tokio::test]
    async fn test_unswallowed_failure_names_the_command() {
        let commands = vec![request_command(
            "bad",
            1,
            r#"fn cmdFunc() { throw "boom" }"#,
        )];
        let proto = dummy_protocol(commands.clone());
        let err = proto
            .runtime()
            .locked_execute_commands(&proto, commands, None, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("execute commands(bad)"));
    }

    #[tokio::test]
    async fn test_initial_value_reaches_command_function() {
        let commands = vec![request_command(
            "seeded",
            1,
            r#"fn cmdFunc(initial, time) { [["seed", initial]] }"#,
        )];
        let proto = dummy_protocol(commands.clone());
        let responses = proto
            .runtime()
            .locked_execute_commands(&proto, commands, Some("42"), false)
            .await
            .unwrap();
        assert_eq!(responses[0].value, "42");
    }

    #[tokio::test]
    async fn test_execute_unknown_command_id() {
        let proto = dummy_protocol(vec![]);
        let err = proto
            .runtime()
            .locked_execute_ids(&proto, &["missing".into()], None, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not registered command"));
    }

    #[test]
    fn test_compile_rejects_write_without_request_info() {
        let commands = vec![Command {
            id: "w1".into(),
            command_type: CommandType::WriteRequest,
            ..Default::default()
        }];
        let device = Device {
            id: "dev1".into(),
            connection_url: "dummy://local".into(),
            commands: commands.into_iter().collect(),
            ..Default::default()
        };
        let service = DriverService::new(
            "test-driver",
            "/driver",
            false,
            false,
            "",
            Arc::new(LogOutput),
            DriverEvents::new(),
        );
        let err = DeviceProtocol::build(service, device).unwrap_err();
        assert!(err.to_string().contains("request-info is not defined"));
    }

    #[test]
    fn test_compile_rejects_read_without_cmd_func() {
        let commands = vec![Command {
            id: "r1".into(),
            command_type: CommandType::ReadRequest,
            request_info: Some("RD1".into()),
            ..Default::default()
        }];
        let device = Device {
            id: "dev1".into(),
            connection_url: "dummy://local".into(),
            commands: commands.into_iter().collect(),
            ..Default::default()
        };
        let service = DriverService::new(
            "test-driver",
            "/driver",
            false,
            false,
            "",
            Arc::new(LogOutput),
            DriverEvents::new(),
        );
        let err = DeviceProtocol::build(service, device).unwrap_err();
        assert!(err.to_string().contains("no \"cmdFunc\""));
    }

    #[test]
    fn test_compile_rejects_bad_control_arity() {
        let commands = vec![request_command(
            "c1",
            1,
            r#"
fn cmdFunc() { [] }
fn control(a, b, c, d) { () }
"#,
        )];
        let device = Device {
            id: "dev1".into(),
            connection_url: "dummy://local".into(),
            commands: commands.into_iter().collect(),
            ..Default::default()
        };
        let service = DriverService::new(
            "test-driver",
            "/driver",
            false,
            false,
            "",
            Arc::new(LogOutput),
            DriverEvents::new(),
        );
        let err = DeviceProtocol::build(service, device).unwrap_err();
        assert!(err.to_string().contains("control arguments count"));
    }

    #[test]
    fn test_compile_rejects_invalid_command_id() {
        let commands = vec![Command {
            id: "bad id!".into(),
            command_type: CommandType::Request,
            cmd_script: Some("fn cmdFunc() { [] }".into()),
            ..Default::default()
        }];
        let device = Device {
            id: "dev1".into(),
            connection_url: "dummy://local".into(),
            commands: commands.into_iter().collect(),
            ..Default::default()
        };
        let service = DriverService::new(
            "test-driver",
            "/driver",
            false,
            false,
            "",
            Arc::new(LogOutput),
            DriverEvents::new(),
        );
        let err = DeviceProtocol::build(service, device).unwrap_err();
        assert!(err.to_string().contains("invalid command-id"));
    }

    #[tokio::test]
    async fn test_status_starts_empty() {
        let proto = dummy_protocol(vec![]);
        assert_eq!(proto.status(), None);
        assert_ne!(proto.status(), Some(StatusCode::Connected));
    }
}
