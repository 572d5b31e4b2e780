//! The poll loop: reads register groups at their cadences and publishes what it decoded.

use crate::catalog::Catalog;
use crate::cluster::ClusterPlanner;
use crate::connection::{self, FieldBus};
use crate::decode::decode_cluster;
use crate::derived::{self, ResolvedValue};
use crate::discovery::{self, Identity};
use crate::mqtt::{self, Command, Message, MessageBus, Topics};
use crate::registers::{RegisterGroup, WriteError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the {0} registers")]
    Read(RegisterGroup, #[source] connection::Error),
    #[error("the {0} registers did not provide `{1}`")]
    Identity(RegisterGroup, &'static str),
    #[error("no register is published as `{0}`")]
    UnknownParam(String),
    #[error("`{param}` is not part of the {group} registers")]
    WrongGroup { param: String, group: RegisterGroup },
    #[error("cannot set `{1}`")]
    Encode(#[source] WriteError, String),
    #[error("writing register {1} failed")]
    Write(#[source] connection::Error, u16),
    #[error("could not build the discovery messages")]
    Discovery(#[source] serde_json::Error),
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "scheduler::Args")]
pub struct Args {
    /// Interval between poll cycles.
    ///
    /// Every cycle reads the base group and one of the secondary groups in turn.
    #[arg(long, env = "MTEC_MQTT_REFRESH_NOW", default_value = "10s")]
    refresh_now: humantime::Duration,

    #[arg(long, env = "MTEC_MQTT_REFRESH_CONFIG", default_value = "30s")]
    refresh_config: humantime::Duration,

    #[arg(long, env = "MTEC_MQTT_REFRESH_DAY", default_value = "5m")]
    refresh_day: humantime::Duration,

    #[arg(long, env = "MTEC_MQTT_REFRESH_TOTAL", default_value = "5m")]
    refresh_total: humantime::Duration,

    #[arg(long, env = "MTEC_MQTT_REFRESH_STATIC", default_value = "1h")]
    refresh_static: humantime::Duration,

    /// Reconnect to the inverter once more than this many reads have failed.
    #[arg(long, env = "MTEC_MQTT_ERROR_THRESHOLD", default_value = "10")]
    error_threshold: usize,

    /// Pause between giving up on a connection and establishing a new one.
    #[arg(long, env = "MTEC_MQTT_RECONNECT_DELAY", default_value = "10s")]
    reconnect_delay: humantime::Duration,
}

/// Reads whole register groups: plans the clusters, reads and decodes them and resolves the
/// pseudo-registers.
pub struct GroupReader {
    planner: ClusterPlanner,
}

impl GroupReader {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            planner: ClusterPlanner::new(catalog),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        self.planner.catalog()
    }

    /// Fails as a whole when any of the group's clusters cannot be read.
    pub async fn read<F: FieldBus>(
        &mut self,
        field_bus: &mut F,
        group: RegisterGroup,
    ) -> Result<Vec<ResolvedValue>, Error> {
        let keys = self.planner.catalog().group_keys(group);
        let clusters = self.planner.plan(&keys);
        let mut decoded = BTreeMap::new();
        for cluster in clusters.iter() {
            let words = field_bus
                .read_span(cluster.start, cluster.length)
                .await
                .map_err(|e| Error::Read(group, e))?;
            decoded.extend(decode_cluster(&words, cluster));
        }
        let now = jiff::Zoned::now();
        Ok(derived::resolve(self.planner.catalog(), group, &decoded, &now))
    }
}

fn text(values: &[ResolvedValue], param: &str) -> Option<String> {
    values
        .iter()
        .find(|v| v.param == param)
        .map(|v| v.value.to_string())
        .filter(|v| !v.is_empty())
}

/// Extract the serial number, firmware and model from the static group.
pub fn identity(values: &[ResolvedValue]) -> Result<Identity, Error> {
    Ok(Identity {
        serial_number: text(values, "serial_no")
            .ok_or(Error::Identity(RegisterGroup::Static, "serial_no"))?,
        firmware_version: text(values, "firmware_version")
            .ok_or(Error::Identity(RegisterGroup::Static, "firmware_version"))?,
        model: text(values, "equipment_info").unwrap_or_else(|| "unknown".to_string()),
    })
}

/// When each cadence is next due, and which secondary group is next in line.
#[derive(Debug)]
pub struct Schedule {
    intervals: BTreeMap<RegisterGroup, Duration>,
    due: BTreeMap<RegisterGroup, Instant>,
    secondary: usize,
    stale: BTreeSet<RegisterGroup>,
}

impl Schedule {
    /// Every cadence starts out due.
    pub fn new(args: &Args, now: Instant) -> Self {
        let intervals = BTreeMap::from([
            (RegisterGroup::Config, *args.refresh_config),
            (RegisterGroup::Day, *args.refresh_day),
            (RegisterGroup::Total, *args.refresh_total),
            (RegisterGroup::Static, *args.refresh_static),
        ]);
        let due = intervals.keys().map(|&group| (group, now)).collect();
        Self {
            intervals,
            due,
            secondary: 0,
            stale: BTreeSet::new(),
        }
    }

    pub fn is_due(&self, group: RegisterGroup, now: Instant) -> bool {
        self.due.get(&group).is_none_or(|&due| due <= now)
    }

    pub fn secondary_index(&self) -> usize {
        self.secondary
    }

    /// The secondary group to read in this cycle. Advances the rotation.
    pub fn next_secondary(&mut self) -> RegisterGroup {
        let group = RegisterGroup::SECONDARY[self.secondary];
        self.secondary = (self.secondary + 1) % RegisterGroup::SECONDARY.len();
        group
    }

    /// Have `group` read in the next cycle regardless of its cadence.
    pub fn mark_stale(&mut self, group: RegisterGroup) {
        self.stale.insert(group);
    }

    /// The groups to read in the cycle starting at `now`, in order.
    pub fn cycle(&mut self, now: Instant) -> Vec<RegisterGroup> {
        let mut groups = vec![RegisterGroup::Base];
        if self.is_due(RegisterGroup::Config, now) {
            groups.push(RegisterGroup::Config);
        }
        groups.push(self.next_secondary());
        for group in [RegisterGroup::Day, RegisterGroup::Total, RegisterGroup::Static] {
            if self.is_due(group, now) {
                groups.push(group);
            }
        }
        for group in std::mem::take(&mut self.stale) {
            if !groups.contains(&group) {
                groups.push(group);
            }
        }
        groups
    }

    /// Record a successful read of `group` that finished at `now`.
    pub fn completed(&mut self, group: RegisterGroup, now: Instant) {
        if let Some(interval) = self.intervals.get(&group) {
            self.due.insert(group, now + *interval);
        }
    }
}

/// State that exists once the inverter has identified itself.
struct Session {
    identity: Identity,
    topics: Topics,
    schedule: Schedule,
    announce_at: Option<Instant>,
    inbound_open: bool,
}

enum Wake {
    Cancelled,
    Cycle,
    Announce,
    Message(Option<Message>),
}

pub struct Poller<F, M> {
    args: Args,
    hass: discovery::Args,
    topic_root: String,
    float_precision: usize,
    reader: GroupReader,
    field_bus: F,
    message_bus: M,
    inbound: mpsc::UnboundedReceiver<Message>,
}

impl<F: FieldBus, M: MessageBus> Poller<F, M> {
    pub fn new(
        args: Args,
        mqtt: &mqtt::Args,
        hass: discovery::Args,
        catalog: Arc<Catalog>,
        field_bus: F,
        message_bus: M,
        inbound: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            args,
            hass,
            topic_root: mqtt.topic_root.clone(),
            float_precision: mqtt.float_precision,
            reader: GroupReader::new(catalog),
            field_bus,
            message_bus,
            inbound,
        }
    }

    /// Poll until `cancel` is triggered, then disconnect from both buses.
    pub async fn run(mut self, cancel: CancellationToken) {
        if let Some(mut session) = self.start(&cancel).await {
            self.poll(&mut session, &cancel).await;
        }
        info!(message = "shutting down");
        self.field_bus.disconnect().await;
        if let Err(e) = self.message_bus.disconnect().await {
            warn!(message = "could not disconnect from the MQTT broker", err = %e);
        }
    }

    /// Wait for the inverter to identify itself. `None` if cancelled first.
    async fn start(&mut self, cancel: &CancellationToken) -> Option<Session> {
        let identity = loop {
            let result = self
                .reader
                .read(&mut self.field_bus, RegisterGroup::Static)
                .await
                .and_then(|values| identity(&values));
            match result {
                Ok(identity) => break identity,
                Err(e) => warn!(
                    message = "cannot retrieve the inverter identity, retrying",
                    delay = %self.args.reconnect_delay,
                    err = %e
                ),
            }
            let errors = self.field_bus.error_count();
            if errors > self.args.error_threshold {
                if !self.recover(errors, cancel).await {
                    return None;
                }
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(*self.args.reconnect_delay) => {}
            }
        };
        info!(
            message = "inverter identified",
            serial = identity.serial_number,
            firmware = identity.firmware_version,
            model = identity.model
        );
        let topics = Topics::new(&self.topic_root, &identity.serial_number);
        let session = Session {
            identity,
            topics,
            schedule: Schedule::new(&self.args, Instant::now()),
            announce_at: None,
            inbound_open: true,
        };
        self.subscribe(&session.topics).await;
        if self.hass.hass {
            self.announce(&session).await;
        }
        Some(session)
    }

    async fn subscribe(&self, topics: &Topics) {
        let mut filters = vec![topics.set_filter()];
        filters.extend(self.hass.status_topic());
        for filter in filters {
            if let Err(e) = self.message_bus.subscribe(&filter).await {
                warn!(message = "subscription failed", err = %e);
            }
        }
    }

    async fn poll(&mut self, session: &mut Session, cancel: &CancellationToken) {
        loop {
            let errors = self.field_bus.error_count();
            if errors > self.args.error_threshold && !self.recover(errors, cancel).await {
                return;
            }
            self.cycle(session).await;
            let deadline = Instant::now() + *self.args.refresh_now;
            debug!(message = "sleeping", duration = %self.args.refresh_now);
            loop {
                let announce_at = session.announce_at.unwrap_or(deadline);
                let wake = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Wake::Cancelled,
                    _ = tokio::time::sleep_until(announce_at), if session.announce_at.is_some() => {
                        Wake::Announce
                    }
                    message = self.inbound.recv(), if session.inbound_open => Wake::Message(message),
                    _ = tokio::time::sleep_until(deadline) => Wake::Cycle,
                };
                match wake {
                    Wake::Cancelled => return,
                    Wake::Cycle => break,
                    Wake::Announce => {
                        session.announce_at = None;
                        self.announce(session).await;
                    }
                    Wake::Message(Some(message)) => self.handle(session, message).await,
                    Wake::Message(None) => {
                        warn!(message = "inbound MQTT messages are no longer delivered");
                        session.inbound_open = false;
                    }
                }
            }
        }
    }

    /// Disconnect, wait and reconnect. `false` if cancelled while waiting.
    async fn recover(&mut self, errors: usize, cancel: &CancellationToken) -> bool {
        warn!(
            message = "too many failed reads, reconnecting",
            errors,
            delay = %self.args.reconnect_delay
        );
        self.field_bus.disconnect().await;
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(*self.args.reconnect_delay) => {}
        }
        if let Err(e) = self.field_bus.connect().await {
            warn!(message = "reconnecting failed", err = %e);
        }
        true
    }

    async fn cycle(&mut self, session: &mut Session) {
        for group in session.schedule.cycle(Instant::now()) {
            info!(message = "reading registers", %group);
            match self.reader.read(&mut self.field_bus, group).await {
                Ok(values) => {
                    session.schedule.completed(group, Instant::now());
                    self.publish(&session.topics, group, &values).await;
                }
                Err(e) => warn!(message = "skipping group", %group, err = %e),
            }
        }
    }

    async fn publish(&self, topics: &Topics, group: RegisterGroup, values: &[ResolvedValue]) {
        for value in values {
            let payload = value.value.to_payload(self.float_precision);
            let topic = topics.state(group, &value.param);
            if let Err(e) = self.message_bus.publish(topic, payload, false).await {
                warn!(message = "publishing failed", err = %e);
            }
        }
    }

    async fn announce(&self, session: &Session) {
        let result = discovery::announcements(
            self.reader.catalog(),
            &session.topics,
            &self.hass.hass_base_topic,
            &session.identity,
        )
        .map_err(Error::Discovery);
        let announcements = match result {
            Ok(announcements) => announcements,
            Err(e) => {
                warn!(message = "discovery failed", err = %e);
                return;
            }
        };
        info!(message = "announcing to Home Assistant", count = announcements.len());
        for (topic, payload) in announcements {
            if let Err(e) = self.message_bus.publish(topic, payload, true).await {
                warn!(message = "publishing a discovery message failed", err = %e);
            }
        }
    }

    async fn handle(&mut self, session: &mut Session, message: Message) {
        let command = Command::try_from_message(
            message,
            &session.topics,
            self.hass.status_topic().as_deref(),
        );
        match command {
            Ok(Command::Set {
                group,
                param,
                value,
            }) => match self.write(group, &param, &value).await {
                Ok(()) => session.schedule.mark_stale(group),
                Err(e) => warn!(message = "remote write rejected", param, value, err = %e),
            },
            Ok(Command::HassStatus(status)) if status == "online" && self.hass.hass => {
                info!(
                    message = "Home Assistant is online, announcing after the grace period",
                    grace = %self.hass.hass_birth_grace
                );
                session.announce_at = Some(Instant::now() + *self.hass.hass_birth_grace);
            }
            Ok(Command::HassStatus(status)) => info!(message = "Home Assistant status", status),
            Err(message) => warn!(message = "ignoring an unusable message", topic = message.topic),
        }
    }

    async fn write(&mut self, group: RegisterGroup, param: &str, value: &str) -> Result<(), Error> {
        let catalog = self.reader.catalog();
        let entry = catalog
            .by_param(param)
            .ok_or_else(|| Error::UnknownParam(param.to_string()))?;
        if entry.descriptor.group != Some(group) {
            return Err(Error::WrongGroup {
                param: param.to_string(),
                group,
            });
        }
        let raw = entry
            .descriptor
            .encode_write(value)
            .map_err(|e| Error::Encode(e, param.to_string()))?;
        let address = entry
            .address()
            .ok_or_else(|| Error::Encode(WriteError::ReadOnly, param.to_string()))?;
        self.field_bus
            .write_register(address, raw)
            .await
            .map_err(|e| Error::Write(e, address))?;
        info!(message = "register written", register.address = address, param, value, raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Component, Discovery};
    use crate::registers::{FieldType, RegisterDescriptor, RegisterKey, Render, Value};
    use clap::Parser as _;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn payloads(values: &[ResolvedValue], float_precision: usize) -> BTreeMap<&str, String> {
        values
            .iter()
            .map(|v| (v.param.as_str(), v.value.to_payload(float_precision)))
            .collect()
    }

    #[derive(Default)]
    struct Device {
        registers: BTreeMap<u16, u16>,
        failing: bool,
        errors: usize,
        /// Reads keep failing until the next `connect`.
        heals_on_connect: bool,
        reads: Vec<(u16, u16)>,
        writes: Vec<(u16, u16)>,
        connects: usize,
        disconnects: usize,
    }

    #[derive(Clone, Default)]
    struct FakeField(Rc<RefCell<Device>>);

    impl FieldBus for FakeField {
        async fn connect(&mut self) -> Result<(), connection::Error> {
            let mut device = self.0.borrow_mut();
            device.connects += 1;
            device.errors = 0;
            if device.heals_on_connect {
                device.failing = false;
            }
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.0.borrow_mut().disconnects += 1;
        }

        async fn read_span(&mut self, start: u16, count: u16) -> Result<Vec<u16>, connection::Error> {
            let mut device = self.0.borrow_mut();
            device.reads.push((start, count));
            if device.failing {
                device.errors += 1;
                return Err(connection::Error::Timeout(1));
            }
            Ok((start..start + count)
                .map(|a| device.registers.get(&a).copied().unwrap_or_default())
                .collect())
        }

        async fn write_register(&mut self, address: u16, value: u16) -> Result<(), connection::Error> {
            let mut device = self.0.borrow_mut();
            device.writes.push((address, value));
            device.registers.insert(address, value);
            Ok(())
        }

        fn error_count(&self) -> usize {
            self.0.borrow().errors
        }
    }

    #[derive(Default)]
    struct Broker {
        published: Vec<(String, String, bool)>,
        subscriptions: BTreeSet<String>,
        disconnected: bool,
    }

    #[derive(Clone, Default)]
    struct FakeBus(Rc<RefCell<Broker>>);

    impl FakeBus {
        fn payloads(&self, topic: &str) -> Vec<String> {
            let broker = self.0.borrow();
            broker
                .published
                .iter()
                .filter(|(t, _, _)| t == topic)
                .map(|(_, p, _)| p.clone())
                .collect()
        }
    }

    impl MessageBus for FakeBus {
        async fn publish(&self, topic: String, payload: String, retain: bool) -> Result<(), mqtt::Error> {
            self.0.borrow_mut().published.push((topic, payload, retain));
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> Result<(), mqtt::Error> {
            self.0.borrow_mut().subscriptions.insert(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), mqtt::Error> {
            self.0.borrow_mut().subscriptions.remove(topic);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), mqtt::Error> {
            self.0.borrow_mut().disconnected = true;
            Ok(())
        }
    }

    const SECONDARY_BASE: u16 = 20000;

    fn register(
        group: RegisterGroup,
        field_type: FieldType,
        length: u16,
        param: &str,
    ) -> RegisterDescriptor {
        let mut descriptor = RegisterDescriptor::new(param, Some(field_type), length);
        descriptor.group = Some(group);
        descriptor.param = Some(param.to_string());
        descriptor
    }

    fn catalog() -> Arc<Catalog> {
        let mut entries = vec![
            (10000, register(RegisterGroup::Static, FieldType::Str, 2, "serial_no")),
            (10011, {
                let mut d = register(RegisterGroup::Static, FieldType::Byte, 2, "firmware_version");
                d.render = Render::Firmware;
                d
            }),
            (11000, {
                let mut d = register(RegisterGroup::Base, FieldType::I16, 1, "grid_power");
                d.unit = "W".into();
                d.discovery = Some(Discovery::new(Component::Sensor));
                d
            }),
            (25100, {
                let mut d = register(RegisterGroup::Config, FieldType::U16, 1, "mode");
                d.writable = true;
                d.value_items = BTreeMap::from([(257, "General mode".into()), (259, "UPS mode".into())]);
                d
            }),
            (31000, {
                let mut d = register(RegisterGroup::Day, FieldType::U16, 1, "pv_day");
                d.scale = 10;
                d
            }),
            (31100, register(RegisterGroup::Total, FieldType::U16, 1, "pv_total")),
        ];
        for (i, group) in RegisterGroup::SECONDARY.iter().enumerate() {
            let param = format!("{group}_value");
            entries.push((SECONDARY_BASE + i as u16, register(*group, FieldType::U16, 1, &param)));
        }
        let catalog = Catalog::new(
            entries
                .into_iter()
                .map(|(address, descriptor)| (RegisterKey::Address(address), descriptor)),
        )
        .expect("valid catalog");
        Arc::new(catalog)
    }

    fn device() -> FakeField {
        let field = FakeField::default();
        field.0.borrow_mut().registers = BTreeMap::from([
            (10000, u16::from_be_bytes(*b"SN")),
            (10001, u16::from_be_bytes([b'1', 0])),
            (10011, 0x1B34),
            (10012, 0x0407),
            (11000, (-120i16) as u16),
            (25100, 257),
            (31000, 1234),
            (31100, 99),
        ]);
        field
    }

    fn args(extra: &[&str]) -> Args {
        Args::try_parse_from(["test"].iter().chain(extra)).expect("valid arguments")
    }

    fn hass(extra: &[&str]) -> discovery::Args {
        discovery::Args::try_parse_from(["test"].iter().chain(extra)).expect("valid arguments")
    }

    struct Harness {
        field: FakeField,
        bus: FakeBus,
        inbound: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    }

    fn poller(args: Args, hass: discovery::Args) -> (Poller<FakeField, FakeBus>, Harness) {
        let mqtt = mqtt::Args::try_parse_from(["test", "--mqtt-host", "localhost"])
            .expect("valid arguments");
        let field = device();
        let bus = FakeBus::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let poller = Poller::new(args, &mqtt, hass, catalog(), field.clone(), bus.clone(), rx);
        let harness = Harness {
            field,
            bus,
            inbound: tx,
            cancel: CancellationToken::new(),
        };
        (poller, harness)
    }

    fn reads_of(field: &FakeField, address: u16) -> usize {
        field.0.borrow().reads.iter().filter(|(a, _)| *a == address).count()
    }

    #[test]
    fn round_robin_wraps() {
        let mut schedule = Schedule::new(&args(&[]), Instant::now());
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push((schedule.secondary_index(), schedule.next_secondary()));
        }
        assert_eq!(
            seen,
            [
                (0, RegisterGroup::Grid),
                (1, RegisterGroup::Inverter),
                (2, RegisterGroup::Backup),
                (3, RegisterGroup::Battery),
                (4, RegisterGroup::Pv),
                (0, RegisterGroup::Grid),
            ]
        );
    }

    #[test]
    fn cadences_wait_for_completion() {
        let start = Instant::now();
        let mut schedule = Schedule::new(&args(&[]), start);
        assert_eq!(
            schedule.cycle(start),
            [
                RegisterGroup::Base,
                RegisterGroup::Config,
                RegisterGroup::Grid,
                RegisterGroup::Day,
                RegisterGroup::Total,
                RegisterGroup::Static,
            ]
        );
        schedule.completed(RegisterGroup::Config, start);
        schedule.completed(RegisterGroup::Static, start);
        // Day and total failed, so they are attempted again.
        let later = start + Duration::from_secs(10);
        assert_eq!(
            schedule.cycle(later),
            [
                RegisterGroup::Base,
                RegisterGroup::Inverter,
                RegisterGroup::Day,
                RegisterGroup::Total,
            ]
        );
        assert!(schedule.is_due(RegisterGroup::Config, start + Duration::from_secs(30)));
        assert!(!schedule.is_due(RegisterGroup::Static, start + Duration::from_secs(30)));
    }

    #[test]
    fn stale_groups_join_the_next_cycle_once() {
        let start = Instant::now();
        let mut schedule = Schedule::new(&args(&[]), start);
        for group in [RegisterGroup::Config, RegisterGroup::Day, RegisterGroup::Total, RegisterGroup::Static] {
            schedule.completed(group, start);
        }
        schedule.mark_stale(RegisterGroup::Config);
        schedule.mark_stale(RegisterGroup::Grid);
        schedule.mark_stale(RegisterGroup::Battery);
        assert_eq!(
            schedule.cycle(start),
            [
                RegisterGroup::Base,
                RegisterGroup::Grid,
                RegisterGroup::Battery,
                RegisterGroup::Config,
            ]
        );
        assert_eq!(schedule.cycle(start), [RegisterGroup::Base, RegisterGroup::Inverter]);
    }

    #[test]
    fn identity_requires_serial_and_firmware() {
        let value = |param: &str, text: &str| ResolvedValue {
            param: param.into(),
            name: param.into(),
            value: Value::Text(text.into()),
            unit: String::new(),
        };
        let found = identity(&[value("serial_no", "SN1"), value("firmware_version", "V1.2-V3.4")])
            .expect("complete identity");
        assert_eq!(found.serial_number, "SN1");
        assert_eq!(found.model, "unknown");
        assert!(matches!(
            identity(&[value("serial_no", "")]),
            Err(Error::Identity(RegisterGroup::Static, "serial_no"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reader_resolves_a_group() {
        let mut field = device();
        let mut reader = GroupReader::new(catalog());
        let values = reader.read(&mut field, RegisterGroup::Day).await.expect("reads");
        assert_eq!(payloads(&values, 2), BTreeMap::from([("pv_day", "123.40".to_string())]));
        field.0.borrow_mut().failing = true;
        assert!(matches!(
            reader.read(&mut field, RegisterGroup::Day).await,
            Err(Error::Read(RegisterGroup::Day, _))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_cadences_and_shuts_down() {
        let (poller, harness) = poller(args(&[]), hass(&[]));
        let cancel = harness.cancel.clone();
        let script = async {
            tokio::time::sleep(Duration::from_secs(25)).await;
            cancel.cancel();
        };
        tokio::join!(poller.run(harness.cancel.clone()), script);

        let bus = &harness.bus;
        assert_eq!(bus.payloads("MTEC/SN1/now-base/grid_power/state"), ["-120"; 3]);
        assert_eq!(bus.payloads("MTEC/SN1/config/mode/state"), ["General mode"]);
        assert_eq!(bus.payloads("MTEC/SN1/day/pv_day/state"), ["123.400"]);
        assert_eq!(bus.payloads("MTEC/SN1/static/serial_no/state"), ["SN1"]);
        assert_eq!(
            bus.payloads("MTEC/SN1/static/firmware_version/state"),
            ["V27.52-V04.07"]
        );
        assert_eq!(bus.payloads("MTEC/SN1/now-grid/now-grid_value/state").len(), 1);
        assert_eq!(bus.payloads("MTEC/SN1/now-inverter/now-inverter_value/state").len(), 1);
        assert_eq!(bus.payloads("MTEC/SN1/now-backup/now-backup_value/state").len(), 1);
        assert!(bus.payloads("MTEC/SN1/now-battery/now-battery_value/state").is_empty());

        let broker = bus.0.borrow();
        assert!(broker.subscriptions.contains("MTEC/SN1/+/+/set"));
        assert!(broker.disconnected);
        assert!(broker.published.iter().all(|(_, _, retain)| !retain));
        assert_eq!(harness.field.0.borrow().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_identity() {
        let (poller, harness) = poller(args(&[]), hass(&[]));
        harness.field.0.borrow_mut().failing = true;
        let field = harness.field.clone();
        let cancel = harness.cancel.clone();
        let script = async {
            tokio::time::sleep(Duration::from_secs(15)).await;
            field.0.borrow_mut().failing = false;
            tokio::time::sleep(Duration::from_secs(10)).await;
            cancel.cancel();
        };
        tokio::join!(poller.run(harness.cancel.clone()), script);
        // Attempts at 0s and 10s fail, the one at 20s succeeds and is followed by the first cycle.
        assert_eq!(reads_of(&harness.field, 10000), 4);
        assert_eq!(harness.bus.payloads("MTEC/SN1/now-base/grid_power/state"), ["-120"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_identification() {
        let (poller, harness) = poller(args(&[]), hass(&[]));
        harness.field.0.borrow_mut().failing = true;
        harness.cancel.cancel();
        poller.run(harness.cancel.clone()).await;
        assert!(harness.bus.0.borrow().published.is_empty());
        assert!(harness.bus.0.borrow().disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_too_many_errors() {
        let (poller, harness) = poller(args(&["--error-threshold", "1"]), hass(&[]));
        let field = harness.field.clone();
        let cancel = harness.cancel.clone();
        let script = async {
            // Let the identity read through, then break the device.
            tokio::task::yield_now().await;
            field.0.borrow_mut().failing = true;
            tokio::time::sleep(Duration::from_secs(15)).await;
            field.0.borrow_mut().failing = false;
            tokio::time::sleep(Duration::from_secs(20)).await;
            cancel.cancel();
        };
        tokio::join!(poller.run(harness.cancel.clone()), script);
        let device = harness.field.0.borrow();
        assert_eq!(device.connects, 1);
        // One for the backoff, one at shutdown.
        assert_eq!(device.disconnects, 2);
        assert!(!harness.bus.payloads("MTEC/SN1/now-base/grid_power/state").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_while_waiting_for_the_identity() {
        let (poller, harness) = poller(args(&["--error-threshold", "2"]), hass(&[]));
        {
            let mut device = harness.field.0.borrow_mut();
            device.failing = true;
            device.heals_on_connect = true;
        }
        let cancel = harness.cancel.clone();
        let script = async {
            tokio::time::sleep(Duration::from_secs(35)).await;
            cancel.cancel();
        };
        tokio::join!(poller.run(harness.cancel.clone()), script);
        // Failures at 0s, 10s and 20s exceed the threshold; the reconnect at 30s heals the device.
        let device = harness.field.0.borrow();
        assert_eq!(device.connects, 1);
        assert_eq!(device.disconnects, 2);
        assert_eq!(harness.bus.payloads("MTEC/SN1/now-base/grid_power/state"), ["-120"]);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_polling_while_the_broker_is_unreachable() {
        let mqtt = mqtt::Args::try_parse_from(["test", "--mqtt-host", "127.0.0.1", "--mqtt-port", "1"])
            .expect("valid arguments");
        // The event loop is never polled, so the request queue fills up and stays full.
        let (client, _eventloop) = mqtt::MqttClient::new(&mqtt);
        let field = device();
        let (_inbound, messages) = mpsc::unbounded_channel();
        let poller = Poller::new(
            args(&["--refresh-now", "100ms"]),
            &mqtt,
            hass(&[]),
            catalog(),
            field.clone(),
            client,
            messages,
        );
        let cancel = CancellationToken::new();
        let script = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            cancel.cancel();
        };
        let finished = tokio::time::timeout(Duration::from_secs(60), async {
            tokio::join!(poller.run(cancel.clone()), script);
        })
        .await;
        assert!(finished.is_ok(), "the poller did not shut down");
        assert!(reads_of(&field, 11000) > 200);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_writes_reread_the_group() {
        let (poller, harness) = poller(args(&[]), hass(&[]));
        let cancel = harness.cancel.clone();
        let inbound = harness.inbound.clone();
        let script = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let send = |topic: &str, payload: &str| {
                inbound
                    .send(Message {
                        topic: topic.into(),
                        payload: payload.into(),
                    })
                    .expect("poller is listening");
            };
            send("MTEC/SN1/config/mode/set", "UPS mode");
            send("MTEC/SN1/day/pv_day/set", "1");
            send("MTEC/SN1/config/nonexistent/set", "1");
            tokio::time::sleep(Duration::from_secs(14)).await;
            cancel.cancel();
        };
        tokio::join!(poller.run(harness.cancel.clone()), script);
        assert_eq!(harness.field.0.borrow().writes, [(25100, 259)]);
        assert_eq!(
            harness.bus.payloads("MTEC/SN1/config/mode/state"),
            ["General mode", "UPS mode"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn announces_and_reannounces_after_the_grace_time() {
        let (poller, harness) = poller(args(&[]), hass(&["--hass", "--hass-birth-grace", "15s"]));
        let cancel = harness.cancel.clone();
        let inbound = harness.inbound.clone();
        let bus = harness.bus.clone();
        let topic = "homeassistant/sensor/MTEC_grid_power/config";
        let script = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(bus.payloads(topic).len(), 1);
            inbound
                .send(Message {
                    topic: "homeassistant/status".into(),
                    payload: "online".into(),
                })
                .expect("poller is listening");
            tokio::time::sleep(Duration::from_secs(14)).await;
            assert_eq!(bus.payloads(topic).len(), 1);
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(bus.payloads(topic).len(), 2);
            cancel.cancel();
        };
        tokio::join!(poller.run(harness.cancel.clone()), script);
        let broker = harness.bus.0.borrow();
        assert!(broker.subscriptions.contains("homeassistant/status"));
        assert!(broker
            .published
            .iter()
            .filter(|(t, _, _)| t == topic)
            .all(|(_, _, retain)| *retain));
    }
}
