//! The client instance and its public API.
//!
//! [`Xively`] owns everything that would otherwise be process-wide: the
//! event dispatcher, timed tasks, backoff status, the context registry, the
//! `mio` poll, the clock, the random source and the filesystem. All of it
//! is driven from one thread by [`Xively::events_process_blocking`] or
//! [`Xively::events_process_tick`].

use std::io;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use mio::{Events, Poll};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use xively_core::QoS;

use crate::backoff::{Backoff, BackoffClass, BackoffStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connection::{ConnectionData, ConnectionState, LastWill};
use crate::context::{Context, ContextHandle};
use crate::dispatcher::{self, Dispatch, EventDispatcher, Fd};
use crate::events::{ConnectionCallback, PublishCallback, SubscriptionCallback};
use crate::fs::{Filesystem, MemoryFs};
use crate::layer::{build_chain, schedule_layer_call, teardown_chain, LayerData, LayerOp, LogicTask, TransportFactory};
use crate::registry::HandleRegistry;
use crate::resource_manager::ResourceManagerContext;
use crate::session::{OutboundPublish, PendingSubscribe};
use crate::sft::{self, FirmwareHooks, SftContext, SftHooks, UrlHandler};
use crate::state::{Result, State};
use crate::timed_task::{self, Repeat, TaskCallback, TimedTaskContainer, TimedTaskHandle, TimedTasks};
use crate::topic::{self, validate_publish_topic, validate_topic_filter};

const POLL_EVENTS_CAPACITY: usize = 64;

/// Longest text accepted in one field of a formatted time series.
pub const MAX_CSV_FIELD_CHARS: usize = 1024;

/// Snapshot of what the client currently holds on to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceStats {
    pub contexts: usize,
    pub pending_events: usize,
    pub registered_fds: usize,
    pub timed_tasks: usize,
    pub open_files: usize,
    pub resource_contexts: usize,
}

pub struct Xively {
    account_id: String,
    device_id: String,
    password: Option<String>,
    pub(crate) config: Config,
    pub(crate) dispatcher: EventDispatcher<Xively>,
    timed_tasks: TimedTaskContainer<Xively>,
    backoff: BackoffStatus,
    pub(crate) contexts: HandleRegistry<Context>,
    pub(crate) resources: HandleRegistry<ResourceManagerContext>,
    pub(crate) poll: Poll,
    events: Events,
    rng: Box<dyn RngCore>,
    clock: Box<dyn Clock>,
    pub(crate) fs: Box<dyn Filesystem>,
    pub(crate) sft_hooks: SftHooks,
    next_fd: Fd,
    serial: u64,
}

impl Dispatch for Xively {
    fn dispatcher(&mut self) -> &mut EventDispatcher<Self> {
        &mut self.dispatcher
    }
}

impl TimedTasks for Xively {
    fn timed_tasks(&mut self) -> &mut TimedTaskContainer<Self> {
        &mut self.timed_tasks
    }
}

impl Backoff for Xively {
    fn backoff_status(&mut self) -> &mut BackoffStatus {
        &mut self.backoff
    }
}

impl Xively {
    /// Create a client for `device_id` of `account_id` with the default
    /// configuration.
    pub fn initialize(account_id: &str, device_id: &str) -> Result<Self> {
        if account_id.is_empty() || device_id.is_empty() {
            return Err(State::InvalidParameter);
        }
        let poll = Poll::new().map_err(|err| {
            error!("could not create the poll instance: {}", err);
            State::FailedInitialization
        })?;
        let config = Config::default();
        info!("client initialized for device {}", device_id);
        Ok(Self {
            account_id: account_id.to_string(),
            device_id: device_id.to_string(),
            password: None,
            dispatcher: EventDispatcher::new(config.limits.max_events),
            timed_tasks: TimedTaskContainer::new(config.limits.max_timed_tasks),
            backoff: BackoffStatus::new(&config.backoff),
            contexts: HandleRegistry::with_capacity(config.limits.max_contexts),
            resources: HandleRegistry::with_capacity(config.limits.max_contexts),
            config,
            poll,
            events: Events::with_capacity(POLL_EVENTS_CAPACITY),
            rng: Box::new(StdRng::from_entropy()),
            clock: Box::new(SystemClock::new()),
            fs: Box::new(MemoryFs::new()),
            sft_hooks: SftHooks::default(),
            next_fd: 0,
            serial: 0,
        })
    }

    /// Device secret sent as the MQTT password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Replace the configuration. Capacities are rebuilt, so this belongs
    /// before the first context is created.
    pub fn with_config(mut self, config: Config) -> Self {
        let limits = &config.limits;
        self.dispatcher = EventDispatcher::new(limits.max_events);
        self.timed_tasks = TimedTaskContainer::new(limits.max_timed_tasks);
        self.contexts = HandleRegistry::with_capacity(limits.max_contexts);
        self.resources = HandleRegistry::with_capacity(limits.max_contexts);
        self.backoff = BackoffStatus::new(&config.backoff);
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rng(mut self, rng: Box<dyn RngCore>) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_filesystem(mut self, fs: Box<dyn Filesystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_url_handler(mut self, handler: Box<dyn UrlHandler>) -> Self {
        self.sft_hooks.url_handler = Some(handler);
        self
    }

    pub fn with_firmware_hooks(mut self, hooks: Box<dyn FirmwareHooks>) -> Self {
        self.sft_hooks.firmware = hooks;
        self
    }

    /// Close every context and drop all pending work.
    pub fn shutdown(mut self) {
        for handle in self.contexts.handles() {
            let _ = self.delete_context(ContextHandle(handle));
        }
        timed_task::clear_timed_tasks(&mut self);
        crate::backoff::cancel_backoff_event(&mut self);
        self.dispatcher.clear();
        info!("client shut down");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn get_device_unique_id(&self) -> &str {
        &self.device_id
    }

    /// `xi/blue/v1/<account>/d/<device>/<name>`.
    pub fn telemetry_topic(&self, name: &str) -> Result<String> {
        topic::telemetry_topic(&self.account_id, &self.device_id, name)
    }

    pub fn filesystem(&mut self) -> &mut dyn Filesystem {
        self.fs.as_mut()
    }

    pub fn backoff_status(&self) -> &BackoffStatus {
        &self.backoff
    }

    pub fn set_network_timeout(&mut self, timeout_ms: u32) {
        self.config.connection.network_timeout_ms = timeout_ms;
    }

    pub fn get_network_timeout(&self) -> u32 {
        self.config.connection.network_timeout_ms
    }

    /// Files reported to the file transfer service. Setting them turns the
    /// file transfer on for connections opened afterwards.
    pub fn set_updateable_files(&mut self, files: &[&str]) -> Result<()> {
        if files.iter().any(|name| name.is_empty()) {
            return Err(State::InvalidParameter);
        }
        self.config.sft.updateable_files = files.iter().map(|name| name.to_string()).collect();
        self.config.sft.enabled = true;
        Ok(())
    }

    pub fn resource_stats(&self) -> ResourceStats {
        ResourceStats {
            contexts: self.contexts.len(),
            pending_events: self.dispatcher.pending_events(),
            registered_fds: self.dispatcher.registered_fds(),
            timed_tasks: self.timed_tasks.len(),
            open_files: self.fs.open_count(),
            resource_contexts: self.resources.len(),
        }
    }

    pub(crate) fn allocate_fd(&mut self) -> Fd {
        self.next_fd = self.next_fd.wrapping_add(1);
        self.next_fd
    }

    pub(crate) fn next_serial(&mut self) -> u64 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }

    // contexts

    pub fn create_context(&mut self) -> Result<ContextHandle> {
        self.insert_context(None)
    }

    /// Create a context whose connections use `transport` as the bottom
    /// layer instead of a TCP socket.
    pub fn create_context_with_transport(&mut self, transport: TransportFactory) -> Result<ContextHandle> {
        self.insert_context(Some(transport))
    }

    fn insert_context(&mut self, transport: Option<TransportFactory>) -> Result<ContextHandle> {
        let handle = self
            .contexts
            .insert_with(|handle| Context::new(ContextHandle(handle), transport))?;
        debug!("context {} created", handle);
        Ok(ContextHandle(handle))
    }

    /// Drop a context without reporting anything to its callbacks.
    pub fn delete_context(&mut self, handle: ContextHandle) -> Result<()> {
        if !self.contexts.contains(handle.0) {
            return Err(State::NullContext);
        }
        sft::on_connection_failed(self, handle);
        teardown_chain(self, handle);
        timed_task::remove_context_tasks(self, handle);
        self.contexts.remove(handle.0);
        debug!("context {} deleted", handle.0);
        Ok(())
    }

    pub fn context(&self, handle: ContextHandle) -> Option<&Context> {
        self.contexts.get(handle.0)
    }

    pub fn sft_context(&self, handle: ContextHandle) -> Option<&SftContext> {
        self.contexts.get(handle.0)?.sft.as_ref()
    }

    pub fn is_context_connected(&self, handle: ContextHandle) -> bool {
        self.contexts
            .get(handle.0)
            .is_some_and(|context| context.has_chain() && context.connection.as_ref().is_some_and(ConnectionData::is_opened))
    }

    /// Message ids of publishes waiting for their acknowledgment, followed
    /// by those still queued.
    pub fn pending_message_ids(&self, handle: ContextHandle) -> Result<Vec<u16>> {
        let context = self.contexts.get(handle.0).ok_or(State::NullContext)?;
        let session = &context.session;
        let mut ids = session.unacked_ids();
        ids.extend(session.outbox.iter().filter_map(|outbound| outbound.packet_id));
        Ok(ids)
    }

    // connections

    /// Connect to the configured broker.
    pub fn connect(&mut self, handle: ContextHandle, callback: ConnectionCallback) -> Result<()> {
        let data = self.default_connection_data(None);
        self.connect_with(handle, data, callback)
    }

    pub fn connect_to(&mut self, handle: ContextHandle, host: &str, port: u16, callback: ConnectionCallback) -> Result<()> {
        let data = self.default_connection_data(Some((host, port)));
        self.connect_with(handle, data, callback)
    }

    pub fn connect_with_lastwill(
        &mut self,
        handle: ContextHandle,
        will: LastWill,
        callback: ConnectionCallback,
    ) -> Result<()> {
        let data = self.default_connection_data(None).will(will);
        self.connect_with(handle, data, callback)
    }

    pub fn connect_with_lastwill_to(
        &mut self,
        handle: ContextHandle,
        host: &str,
        port: u16,
        will: LastWill,
        callback: ConnectionCallback,
    ) -> Result<()> {
        let data = self.default_connection_data(Some((host, port))).will(will);
        self.connect_with(handle, data, callback)
    }

    fn default_connection_data(&self, target: Option<(&str, u16)>) -> ConnectionData {
        let mut data = ConnectionData::from_config(&self.config.connection);
        if let Some((host, port)) = target {
            data.host = host.to_string();
            data.port = port;
        }
        data.password = self.password.clone();
        data
    }

    /// Open a connection with explicit parameters. The attempt starts after
    /// the current backoff penalty.
    pub fn connect_with(&mut self, handle: ContextHandle, mut data: ConnectionData, callback: ConnectionCallback) -> Result<()> {
        let context = self.contexts.get_mut(handle.0).ok_or(State::NullContext)?;
        data.validate()?;
        let busy = context.has_chain()
            || context.connection.as_ref().is_some_and(|current| {
                matches!(
                    current.connection_state,
                    ConnectionState::Opening | ConnectionState::Opened | ConnectionState::Closing
                )
            });
        if busy {
            return Err(State::AlreadyInitialized);
        }
        info!("connecting context {} to {}:{}", handle.0, data.host, data.port);
        data.connection_state = ConnectionState::Opening;
        context.connection = Some(data);
        context.on_connection = Some(callback);
        self.open_connection(handle)
    }

    fn open_connection(&mut self, handle: ContextHandle) -> Result<()> {
        let serial = self.next_serial();
        let context = self.contexts.get_mut(handle.0).ok_or(State::NullContext)?;
        context.serial = serial;
        context.layers = build_chain(&self.config, context.transport.as_mut());
        let key = context.key();
        let top = context.top_layer().ok_or(State::InternalError)?;
        let delay = self.backoff.penalty(self.rng.as_mut());
        if delay > 0 {
            debug!("connection attempt in {} s", delay);
        }
        match schedule_layer_call(self, key, top, LayerOp::Init, LayerData::Empty, State::Ok, delay) {
            Ok(_) => Ok(()),
            Err(err) => {
                teardown_chain(self, handle);
                if let Some(data) = self.contexts.get_mut(handle.0).and_then(|c| c.connection.as_mut()) {
                    data.connection_state = ConnectionState::OpenFailed;
                }
                Err(err)
            }
        }
    }

    /// Reopen a connection that went down, after the backoff penalty.
    pub(crate) fn reconnect_after_loss(&mut self, handle: ContextHandle) {
        let Some(data) = self.contexts.get_mut(handle.0).and_then(|c| c.connection.as_mut()) else {
            return;
        };
        if data.connection_state == ConnectionState::Opening {
            return;
        }
        data.connection_state = ConnectionState::Opening;
        debug!("reconnecting context {}", handle.0);
        if let Err(err) = self.open_connection(handle) {
            error!("could not reconnect context {}: {}", handle.0, err);
        }
    }

    /// Report the connection state of `handle` to its callback.
    pub(crate) fn notify_connection(&mut self, handle: ContextHandle, state: State) {
        let Some(context) = self.contexts.get_mut(handle.0) else {
            return;
        };
        let Some(data) = context.connection.clone() else {
            return;
        };
        let Some(mut callback) = context.on_connection.take() else {
            return;
        };
        callback(self, handle, &data, state);
        if let Some(context) = self.contexts.get_mut(handle.0) {
            if context.on_connection.is_none() {
                context.on_connection = Some(callback);
            }
        }
    }

    /// Disconnect gracefully. The connection callback reports the close.
    pub fn shutdown_connection(&mut self, handle: ContextHandle) -> Result<()> {
        let context = self.contexts.get(handle.0).ok_or(State::NullContext)?;
        let top = context.top_layer().ok_or(State::NotInitialized)?;
        let key = context.key();
        schedule_layer_call(self, key, top, LayerOp::Close, LayerData::Empty, State::Ok, 0)?;
        Ok(())
    }

    fn schedule_logic_task(&mut self, handle: ContextHandle, task: LogicTask) -> Result<()> {
        let context = self.contexts.get(handle.0).ok_or(State::NullContext)?;
        let Some(top) = context.top_layer() else {
            return Ok(());
        };
        let key = context.key();
        schedule_layer_call(self, key, top, LayerOp::Push, LayerData::Task(task), State::Ok, 0)?;
        Ok(())
    }

    fn check_backoff(&self) -> Result<()> {
        match self.backoff.class() {
            BackoffClass::None => Ok(()),
            class => {
                debug!("request refused while backoff is {:?}", class);
                Err(State::BackoffTerminal)
            }
        }
    }

    // publish & subscribe

    /// Publish `payload` on `topic`.
    ///
    /// QoS 1/2 publishes get their message id here and are queued while
    /// the connection is down; it is returned so the application can follow
    /// the exchange. A QoS 0 publish without a connection fails through its
    /// callback with [`State::SocketWriteError`].
    pub fn publish(
        &mut self,
        handle: ContextHandle,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        callback: Option<PublishCallback>,
    ) -> Result<Option<u16>> {
        let payload = payload.into();
        let limits = &self.config.limits;
        let (max_payload, max_in_flight) = (limits.max_payload_size, limits.max_pubs_in_flight);
        if !self.contexts.contains(handle.0) {
            return Err(State::NullContext);
        }
        validate_publish_topic(topic)?;
        if payload.len() > max_payload {
            return Err(State::MqttPayloadSizeTooLarge);
        }
        self.check_backoff()?;

        let connected = self.is_context_connected(handle);
        let context = self.contexts.get_mut(handle.0).ok_or(State::NullContext)?;
        if context.session.pubs_in_flight() >= max_in_flight {
            return Err(State::NoMoreResourceAvailable);
        }
        if qos == QoS::AtMostOnce && !connected {
            debug!("QoS 0 publish on {} without a connection", topic);
            if let Some(callback) = callback {
                self.dispatcher.execute(Box::new(move |xi: &mut Xively| {
                    callback(xi, handle, State::SocketWriteError);
                    State::Ok
                }))?;
            }
            return Ok(None);
        }

        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(context.session.ids.allocate()?),
        };
        trace!("publish on {} queued as {:?}", topic, packet_id);
        context.session.outbox.push_back(OutboundPublish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            packet_id,
            callback,
        });
        if connected {
            if let Err(err) = self.schedule_logic_task(handle, LogicTask::Publish) {
                if let Some(context) = self.contexts.get_mut(handle.0) {
                    context.session.outbox.pop_back();
                    if let Some(id) = packet_id {
                        context.session.ids.release(id);
                    }
                }
                return Err(err);
            }
        }
        Ok(packet_id)
    }

    /// Publish one time series value as its decimal text.
    pub fn publish_timeseries(
        &mut self,
        handle: ContextHandle,
        topic: &str,
        value: f32,
        qos: QoS,
        callback: Option<PublishCallback>,
    ) -> Result<Option<u16>> {
        self.publish(handle, topic, value.to_string(), qos, false, callback)
    }

    /// Publish one CSV time series record `time,category,string,numeric`.
    /// At least one of category, string or numeric value is required.
    #[allow(clippy::too_many_arguments)]
    pub fn publish_formatted_timeseries(
        &mut self,
        handle: ContextHandle,
        topic: &str,
        time: Option<u32>,
        category: Option<&str>,
        string_value: Option<&str>,
        numeric_value: Option<f32>,
        qos: QoS,
        callback: Option<PublishCallback>,
    ) -> Result<Option<u16>> {
        let record = format_timeseries_record(time, category, string_value, numeric_value)?;
        self.publish(handle, topic, record, qos, false, callback)
    }

    /// Subscribe to `filter`. Subscriptions go out one at a time, in the
    /// order they were requested; `callback` hears the SUBACK and then
    /// every matching message.
    pub fn subscribe(
        &mut self,
        handle: ContextHandle,
        filter: &str,
        qos: QoS,
        callback: SubscriptionCallback,
    ) -> Result<()> {
        if !self.contexts.contains(handle.0) {
            return Err(State::NullContext);
        }
        validate_topic_filter(filter)?;
        self.check_backoff()?;
        let connected = self.is_context_connected(handle);
        let context = self.contexts.get_mut(handle.0).ok_or(State::NullContext)?;
        context.session.subscriptions.push_back(PendingSubscribe {
            topic: filter.to_string(),
            qos,
            packet_id: None,
            callback: Some(callback),
        });
        if connected {
            if let Err(err) = self.schedule_logic_task(handle, LogicTask::Subscribe) {
                if let Some(context) = self.contexts.get_mut(handle.0) {
                    context.session.subscriptions.pop_back();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    // timed tasks

    pub fn schedule_timed_task(
        &mut self,
        handle: ContextHandle,
        callback: TaskCallback<Xively>,
        seconds: i64,
        repeat: Repeat,
    ) -> Result<TimedTaskHandle> {
        if !self.contexts.contains(handle.0) {
            return Err(State::NullContext);
        }
        timed_task::add_timed_task(self, handle, callback, seconds, repeat)
    }

    pub fn cancel_timed_task(&mut self, task: TimedTaskHandle) -> Result<()> {
        timed_task::remove_timed_task(self, task)
    }

    // file transfer

    /// Report the end of a download handed to the [`UrlHandler`].
    pub fn sft_file_downloaded(&mut self, handle: ContextHandle, name: &str, success: bool) -> Result<()> {
        if !self.contexts.contains(handle.0) {
            return Err(State::NullContext);
        }
        let name = name.to_string();
        self.dispatcher.execute(Box::new(move |xi: &mut Xively| {
            sft::on_file_downloaded(xi, handle, &name, success);
            State::Ok
        }))?;
        Ok(())
    }

    // event loop

    /// Run the event loop until [`events_stop`](Self::events_stop) or a
    /// fatal state.
    pub fn events_process_blocking(&mut self) -> State {
        loop {
            if self.dispatcher.is_stopped() {
                self.dispatcher.resume();
                return State::Ok;
            }
            let network_timeout = i64::from(self.config.connection.network_timeout_ms);
            let wait_ms = match self.dispatcher.next_event_in() {
                Some(steps) => steps.saturating_mul(1000).min(network_timeout),
                None => network_timeout,
            };
            let state = self.process_events(Some(Duration::from_millis(wait_ms.max(0) as u64)));
            if state.is_fatal() {
                self.dispatcher.resume();
                return state;
            }
        }
    }

    /// One pass over due events and ready sockets without waiting.
    pub fn events_process_tick(&mut self) -> State {
        self.process_events(Some(Duration::ZERO))
    }

    /// Make [`events_process_blocking`](Self::events_process_blocking)
    /// return.
    pub fn events_stop(&mut self) {
        self.dispatcher.stop();
    }

    fn process_events(&mut self, timeout: Option<Duration>) -> State {
        let now = self.clock.now_seconds();
        let state = dispatcher::step(self, now);
        if state.is_fatal() {
            return state;
        }

        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() != io::ErrorKind::Interrupted {
                error!("polling sockets failed: {}", err);
                return State::SocketError;
            }
        }
        let ready: Vec<Fd> = self.events.iter().map(|event| event.token().0).collect();
        for fd in ready {
            let state = dispatcher::update_event_on_socket(self, fd);
            match state {
                State::FdHandlerNotFound => trace!("readiness on unknown fd {}", fd),
                state if state.is_fatal() => return state,
                _ => {}
            }
        }

        let now = self.clock.now_seconds();
        dispatcher::step(self, now)
    }
}

fn check_csv_field(field: &str) -> Result<()> {
    if field.chars().any(|c| matches!(c, ',' | '\r' | '\n')) || field.len() >= MAX_CSV_FIELD_CHARS {
        warn!("time series field is not valid CSV");
        return Err(State::SerializationError);
    }
    Ok(())
}

/// `time,category,string,numeric` plus a newline; absent fields are empty.
pub fn format_timeseries_record(
    time: Option<u32>,
    category: Option<&str>,
    string_value: Option<&str>,
    numeric_value: Option<f32>,
) -> Result<String> {
    let category = category.unwrap_or_default();
    let string_value = string_value.unwrap_or_default();
    check_csv_field(category)?;
    check_csv_field(string_value)?;
    if category.is_empty() && string_value.is_empty() && numeric_value.is_none() {
        return Err(State::InvalidParameter);
    }
    Ok(format!(
        "{},{},{},{}\n",
        time.map(|t| t.to_string()).unwrap_or_default(),
        category,
        string_value,
        numeric_value.map(|v| v.to_string()).unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::clock::ManualClock;

    fn client() -> (Xively, ManualClock) {
        let clock = ManualClock::new(0);
        let xi = Xively::initialize("account", "device")
            .unwrap()
            .with_clock(Box::new(clock.clone()))
            .with_rng(Box::new(StdRng::seed_from_u64(7)));
        (xi, clock)
    }

    #[test]
    fn test_initialize_requires_ids() {
        assert_eq!(Xively::initialize("", "device").err(), Some(State::InvalidParameter));
        assert_eq!(Xively::initialize("account", "").err(), Some(State::InvalidParameter));
    }

    #[test]
    fn test_invalid_handle_is_null_context() {
        let (mut xi, _) = client();
        let bogus = ContextHandle(-1);
        assert_eq!(
            xi.publish(bogus, "t", "x", QoS::AtMostOnce, false, None),
            Err(State::NullContext)
        );
        assert_eq!(
            xi.subscribe(bogus, "t", QoS::AtMostOnce, Box::new(|_, _, _, _| {})),
            Err(State::NullContext)
        );
        assert_eq!(
            xi.connect(bogus, Box::new(|_, _, _, _| {})),
            Err(State::NullContext)
        );
        assert_eq!(xi.delete_context(bogus), Err(State::NullContext));
        assert_eq!(xi.resource_stats().pending_events, 0);
    }

    #[test]
    fn test_context_capacity() {
        let mut config = Config::default();
        config.limits.max_contexts = 1;
        let (xi, _) = client();
        let mut xi = xi.with_config(config);
        let handle = xi.create_context().unwrap();
        assert_eq!(xi.create_context(), Err(State::NoMoreResourceAvailable));
        xi.delete_context(handle).unwrap();
        assert!(xi.create_context().is_ok());
    }

    #[test]
    fn test_half_will_is_rejected_before_anything_happens() {
        let (mut xi, _) = client();
        let handle = xi.create_context().unwrap();
        let will = LastWill {
            message: Some(Bytes::from_static(b"x")),
            ..LastWill::default()
        };
        assert_eq!(
            xi.connect_with_lastwill(handle, will, Box::new(|_, _, _, _| {})),
            Err(State::NullWillTopic)
        );
        assert!(xi.context(handle).unwrap().connection().is_none());
        assert_eq!(xi.resource_stats().pending_events, 0);
    }

    #[test]
    fn test_qos0_without_connection_fails_through_callback() {
        let (mut xi, _) = client();
        let handle = xi.create_context().unwrap();
        let result = Rc::new(RefCell::new(None));
        let seen = result.clone();
        xi.publish(
            handle,
            "test_topic",
            "payload",
            QoS::AtMostOnce,
            false,
            Some(Box::new(move |_, _, state| *seen.borrow_mut() = Some(state))),
        )
        .unwrap();
        assert!(result.borrow().is_none());
        xi.events_process_tick();
        assert_eq!(*result.borrow(), Some(State::SocketWriteError));
    }

    #[test]
    fn test_qos1_is_queued_with_an_id() {
        let (mut xi, _) = client();
        let handle = xi.create_context().unwrap();
        let first = xi.publish(handle, "a", "1", QoS::AtLeastOnce, false, None).unwrap();
        let second = xi.publish(handle, "a", "2", QoS::ExactlyOnce, false, None).unwrap();
        assert_eq!(first, Some(1));
        assert_eq!(second, Some(2));
        assert_eq!(xi.pending_message_ids(handle).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_publish_limits() {
        let mut config = Config::default();
        config.limits.max_pubs_in_flight = 1;
        config.limits.max_payload_size = 4;
        let (xi, _) = client();
        let mut xi = xi.with_config(config);
        let handle = xi.create_context().unwrap();
        assert_eq!(
            xi.publish(handle, "a", "12345", QoS::AtLeastOnce, false, None),
            Err(State::MqttPayloadSizeTooLarge)
        );
        assert_eq!(
            xi.publish(handle, "a/#", "1", QoS::AtLeastOnce, false, None),
            Err(State::InvalidParameter)
        );
        xi.publish(handle, "a", "1", QoS::AtLeastOnce, false, None).unwrap();
        assert_eq!(
            xi.publish(handle, "a", "2", QoS::AtLeastOnce, false, None),
            Err(State::NoMoreResourceAvailable)
        );
    }

    #[test]
    fn test_backoff_blocks_requests() {
        let (mut xi, _) = client();
        let handle = xi.create_context().unwrap();
        crate::backoff::update_backoff_penalty(&mut xi, State::MqttNotAuthorized);
        assert_eq!(
            xi.publish(handle, "a", "1", QoS::AtLeastOnce, false, None),
            Err(State::BackoffTerminal)
        );
        assert_eq!(
            xi.subscribe(handle, "a", QoS::AtMostOnce, Box::new(|_, _, _, _| {})),
            Err(State::BackoffTerminal)
        );
    }

    #[test]
    fn test_timed_task_fires_with_clock() {
        let (mut xi, clock) = client();
        let handle = xi.create_context().unwrap();
        let fired = Rc::new(RefCell::new(0));
        let counter = fired.clone();
        let task = xi
            .schedule_timed_task(
                handle,
                Box::new(move |_, _, _| *counter.borrow_mut() += 1),
                2,
                Repeat::Forever,
            )
            .unwrap();
        xi.events_process_tick();
        assert_eq!(*fired.borrow(), 0);
        clock.advance(2);
        xi.events_process_tick();
        clock.advance(2);
        xi.events_process_tick();
        assert_eq!(*fired.borrow(), 2);
        xi.cancel_timed_task(task).unwrap();
        assert_eq!(xi.resource_stats().timed_tasks, 0);
    }

    #[test]
    fn test_blocking_loop_returns_after_stop() {
        let (mut xi, _) = client();
        let handle = xi.create_context().unwrap();
        xi.set_network_timeout(1);
        xi.schedule_timed_task(handle, Box::new(|xi, _, _| xi.events_stop()), 0, Repeat::Once)
            .unwrap();
        assert_eq!(xi.events_process_blocking(), State::Ok);
        assert!(!xi.dispatcher.is_stopped());
    }

    #[test]
    fn test_formatted_timeseries() {
        assert_eq!(
            format_timeseries_record(Some(10), Some("temp"), None, Some(1.5)).unwrap(),
            "10,temp,,1.5\n"
        );
        assert_eq!(
            format_timeseries_record(None, None, Some("on"), None).unwrap(),
            ",,on,\n"
        );
        assert_eq!(
            format_timeseries_record(Some(1), None, None, None),
            Err(State::InvalidParameter)
        );
        assert_eq!(
            format_timeseries_record(None, Some("a,b"), None, None),
            Err(State::SerializationError)
        );
    }

    #[test]
    fn test_updateable_files_enable_transfer() {
        let (mut xi, _) = client();
        assert_eq!(xi.set_updateable_files(&["ok", ""]), Err(State::InvalidParameter));
        xi.set_updateable_files(&["firmware.bin", "config.json"]).unwrap();
        assert!(xi.config().sft.enabled);
        assert_eq!(xi.config().sft.updateable_files.len(), 2);
    }

    #[test]
    fn test_shutdown_connection_needs_a_connection() {
        let (mut xi, _) = client();
        let handle = xi.create_context().unwrap();
        assert_eq!(xi.shutdown_connection(handle), Err(State::NotInitialized));
    }
}
