//! Discovery coordination: DNS-SD registration of this broker and
//! arbitration against other brokers on the same scope.
//!
//! The platform (mDNS daemon wrapper, or the lightweight stand-in) runs its
//! own threads; its callbacks are posted onto an event queue that the
//! scheduler drains, so no external code ever runs under broker locks.
//!
//! Startup holds registration back until the scope has been quiet for the
//! query hold-off. If another broker is seen first, this one stays in
//! standby; if one appears after we are serving, we unregister, drop our
//! clients and wait for the scope to clear.

use std::net::IpAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lumen::logging::{info, warn, Logger};
use lumen::time::Timer;
use lumen::{BrokerResult, Cid, Uid};

/// Time the scope must stay quiet before we register.
pub const QUERY_HOLD_OFF: Duration = Duration::from_secs(3);

pub type RegistrationHandle = usize;
pub type MonitorHandle = usize;

/// Everything the discovery platform needs to advertise this broker.
#[derive(Debug, Clone)]
pub struct BrokerDiscInfo {
    pub cid: Cid,
    pub uid: Uid,
    pub service_instance_name: String,
    pub scope: String,
    pub port: u16,
    pub listen_addrs: Vec<IpAddr>,
    pub model: String,
    pub manufacturer: String,
    pub txt_items: Vec<(String, Vec<u8>)>,
}

/// Another broker seen on the monitored scope.
#[derive(Debug, Clone)]
pub struct OtherBrokerInfo {
    pub service_name: String,
    pub scope: String,
    pub addrs: Vec<IpAddr>,
}

#[derive(Debug)]
pub enum DiscoveryEvent {
    Registered { assigned_service_name: String },
    RegisterFailed { error: String },
    OtherBrokerFound(OtherBrokerInfo),
    OtherBrokerLost { service_name: String },
}

pub type EventSender = Sender<DiscoveryEvent>;

/// The external discovery platform. Callbacks are delivered by sending
/// events on the channel handed to each call.
pub trait DiscoveryPlatform: Send + Sync {
    fn register_broker(
        &self,
        info: &BrokerDiscInfo,
        events: &EventSender,
    ) -> BrokerResult<RegistrationHandle>;

    fn unregister_broker(&self, handle: RegistrationHandle);

    fn monitor_scope(
        &self,
        scope: &str,
        domain: &str,
        events: &EventSender,
    ) -> BrokerResult<MonitorHandle>;

    fn stop_monitoring(&self, handle: MonitorHandle);
}

/// What the core must do in response to a coordinator transition.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CoordinatorAction {
    /// Registration confirmed; open the listeners and start serving.
    StartServing,
    /// Another broker owns the scope; close listeners and drop all clients.
    EnterStandby,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    Idle,
    /// Watching the scope through the query hold-off.
    Monitoring,
    /// register_broker issued, waiting for confirmation.
    Registering,
    Serving,
    Standby,
}

pub struct DiscoveryCoordinator {
    platform: Arc<dyn DiscoveryPlatform>,
    info: BrokerDiscInfo,
    domain: String,
    phase: Phase,
    hold_off: Option<Timer>,
    other_brokers: usize,
    registration: Option<RegistrationHandle>,
    monitor: Option<MonitorHandle>,
    assigned_service_name: Option<String>,
    events_tx: EventSender,
    events_rx: Receiver<DiscoveryEvent>,
    log: Logger,
}

impl DiscoveryCoordinator {
    pub fn new(
        platform: Arc<dyn DiscoveryPlatform>,
        info: BrokerDiscInfo,
        domain: String,
        log: &Logger,
    ) -> DiscoveryCoordinator {
        let (events_tx, events_rx) = channel();
        DiscoveryCoordinator {
            platform,
            info,
            domain,
            phase: Phase::Idle,
            hold_off: None,
            other_brokers: 0,
            registration: None,
            monitor: None,
            assigned_service_name: None,
            events_tx,
            events_rx,
            log: log.clone(),
        }
    }

    /// The channel end external platforms deliver events on.
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    pub fn assigned_service_name(&self) -> Option<&str> {
        self.assigned_service_name.as_deref()
    }

    pub fn is_serving(&self) -> bool {
        self.phase == Phase::Serving
    }

    /// The port may only be known after the listeners bound.
    pub fn set_port(&mut self, port: u16) {
        self.info.port = port;
    }

    /// Begins monitoring the scope and starts the hold-off timer.
    pub fn start(&mut self, now: Instant) -> BrokerResult<()> {
        let monitor = self.platform.monitor_scope(&self.info.scope, &self.domain, &self.events_tx)?;
        self.monitor = Some(monitor);
        self.hold_off = Some(Timer::new(QUERY_HOLD_OFF, now));
        self.phase = Phase::Monitoring;
        info!(self.log, "monitoring scope before registering";
              "scope" => &self.info.scope, "hold_off_secs" => QUERY_HOLD_OFF.as_secs());
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.registration.take() {
            self.platform.unregister_broker(handle);
        }
        if let Some(handle) = self.monitor.take() {
            self.platform.stop_monitoring(handle);
        }
        self.phase = Phase::Idle;
    }

    /// Drives the state machine; called from the service loop. Returns the
    /// actions the core must carry out.
    pub fn tick(&mut self, now: Instant) -> Vec<CoordinatorAction> {
        let mut actions = Vec::new();

        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event, &mut actions);
        }

        if self.phase == Phase::Monitoring {
            if self.other_brokers > 0 {
                warn!(self.log, "another broker owns this scope; standing by";
                      "scope" => &self.info.scope);
                self.phase = Phase::Standby;
            } else if self.hold_off.map_or(false, |t| t.is_expired(now)) {
                self.register();
            }
        }

        actions
    }

    fn handle_event(&mut self, event: DiscoveryEvent, actions: &mut Vec<CoordinatorAction>) {
        match event {
            DiscoveryEvent::Registered { assigned_service_name } => {
                info!(self.log, "broker registered";
                      "scope" => &self.info.scope,
                      "requested_name" => &self.info.service_instance_name,
                      "assigned_name" => &assigned_service_name);
                self.assigned_service_name = Some(assigned_service_name);
                if self.phase == Phase::Registering {
                    self.phase = Phase::Serving;
                    actions.push(CoordinatorAction::StartServing);
                }
            }
            DiscoveryEvent::RegisterFailed { error } => {
                warn!(self.log, "broker registration failed"; "error" => &error);
                self.registration = None;
                if self.phase == Phase::Registering {
                    self.phase = Phase::Standby;
                }
            }
            DiscoveryEvent::OtherBrokerFound(other) => {
                self.other_brokers += 1;
                warn!(self.log, "another broker found on our scope";
                      "service_name" => &other.service_name,
                      "scope" => &other.scope,
                      "count" => self.other_brokers);
                match self.phase {
                    Phase::Serving | Phase::Registering => {
                        if let Some(handle) = self.registration.take() {
                            self.platform.unregister_broker(handle);
                        }
                        self.phase = Phase::Standby;
                        actions.push(CoordinatorAction::EnterStandby);
                    }
                    _ => {}
                }
            }
            DiscoveryEvent::OtherBrokerLost { service_name } => {
                warn!(self.log, "conflicting broker left"; "service_name" => &service_name);
                if self.other_brokers > 0 {
                    self.other_brokers -= 1;
                }
                if self.other_brokers == 0 && self.phase == Phase::Standby {
                    info!(self.log, "all conflicting brokers gone; resuming");
                    self.register();
                }
            }
        }
    }

    fn register(&mut self) {
        match self.platform.register_broker(&self.info, &self.events_tx) {
            Ok(handle) => {
                self.registration = Some(handle);
                self.phase = Phase::Registering;
            }
            Err(err) => {
                warn!(self.log, "register_broker call failed"; "error" => %err);
                self.phase = Phase::Standby;
            }
        }
    }
}

/// Discovery for deployments without an mDNS daemon: registration succeeds
/// immediately under the requested name and no other brokers are ever
/// reported. Scope conflict arbitration is then a no-op.
pub struct LightweightDiscovery;

impl DiscoveryPlatform for LightweightDiscovery {
    fn register_broker(
        &self,
        info: &BrokerDiscInfo,
        events: &EventSender,
    ) -> BrokerResult<RegistrationHandle> {
        let _ = events.send(DiscoveryEvent::Registered {
            assigned_service_name: info.service_instance_name.clone(),
        });
        Ok(1)
    }

    fn unregister_broker(&self, _handle: RegistrationHandle) {}

    fn monitor_scope(
        &self,
        _scope: &str,
        _domain: &str,
        _events: &EventSender,
    ) -> BrokerResult<MonitorHandle> {
        Ok(1)
    }

    fn stop_monitoring(&self, _handle: MonitorHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen::logging;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockPlatform {
        register_calls: Mutex<Vec<String>>,
        unregister_calls: Mutex<usize>,
        monitor_calls: Mutex<Vec<String>>,
    }

    impl DiscoveryPlatform for MockPlatform {
        fn register_broker(
            &self,
            info: &BrokerDiscInfo,
            _events: &EventSender,
        ) -> BrokerResult<RegistrationHandle> {
            self.register_calls.lock().unwrap().push(info.scope.clone());
            Ok(7)
        }

        fn unregister_broker(&self, _handle: RegistrationHandle) {
            *self.unregister_calls.lock().unwrap() += 1;
        }

        fn monitor_scope(
            &self,
            scope: &str,
            _domain: &str,
            _events: &EventSender,
        ) -> BrokerResult<MonitorHandle> {
            self.monitor_calls.lock().unwrap().push(scope.to_string());
            Ok(3)
        }

        fn stop_monitoring(&self, _handle: MonitorHandle) {}
    }

    fn disc_info() -> BrokerDiscInfo {
        BrokerDiscInfo {
            cid: "00000000-0000-0000-0000-000000000001".parse().unwrap(),
            uid: Uid::new(0x6574, 1),
            service_instance_name: "Test Broker".to_string(),
            scope: "default".to_string(),
            port: 5569,
            listen_addrs: vec![],
            model: "Broker".to_string(),
            manufacturer: "Filament Works".to_string(),
            txt_items: vec![],
        }
    }

    fn coordinator(platform: Arc<MockPlatform>) -> DiscoveryCoordinator {
        let log = logging::discard();
        DiscoveryCoordinator::new(platform, disc_info(), String::new(), &log)
    }

    fn other(name: &str) -> OtherBrokerInfo {
        OtherBrokerInfo {
            service_name: name.to_string(),
            scope: "default".to_string(),
            addrs: vec![],
        }
    }

    #[test]
    fn test_registers_once_after_quiet_hold_off() {
        let platform = Arc::new(MockPlatform::default());
        let mut coord = coordinator(platform.clone());
        let start = Instant::now();

        coord.start(start).unwrap();
        assert_eq!(platform.monitor_calls.lock().unwrap().as_slice(), ["default"]);

        assert!(coord.tick(start + Duration::from_secs(2)).is_empty());
        assert!(platform.register_calls.lock().unwrap().is_empty());

        assert!(coord.tick(start + Duration::from_secs(3)).is_empty());
        assert_eq!(platform.register_calls.lock().unwrap().len(), 1);
        // No re-registration on later ticks.
        coord.tick(start + Duration::from_secs(10));
        assert_eq!(platform.register_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_serving_begins_on_registered_event() {
        let platform = Arc::new(MockPlatform::default());
        let mut coord = coordinator(platform);
        let start = Instant::now();

        coord.start(start).unwrap();
        coord.tick(start + QUERY_HOLD_OFF);

        coord
            .event_sender()
            .send(DiscoveryEvent::Registered {
                assigned_service_name: "Test Broker (2)".to_string(),
            })
            .unwrap();
        let actions = coord.tick(start + QUERY_HOLD_OFF + Duration::from_millis(1));

        assert_eq!(actions, vec![CoordinatorAction::StartServing]);
        assert!(coord.is_serving());
        assert_eq!(coord.assigned_service_name(), Some("Test Broker (2)"));
    }

    #[test]
    fn test_conflict_before_hold_off_prevents_registration() {
        let platform = Arc::new(MockPlatform::default());
        let mut coord = coordinator(platform.clone());
        let start = Instant::now();

        coord.start(start).unwrap();
        coord
            .event_sender()
            .send(DiscoveryEvent::OtherBrokerFound(other("rival")))
            .unwrap();

        let actions = coord.tick(start + Duration::from_secs(5));
        assert!(actions.is_empty());
        assert!(platform.register_calls.lock().unwrap().is_empty());
        assert!(!coord.is_serving());
    }

    #[test]
    fn test_conflict_while_serving_then_resume() {
        let platform = Arc::new(MockPlatform::default());
        let mut coord = coordinator(platform.clone());
        let start = Instant::now();

        coord.start(start).unwrap();
        coord.tick(start + QUERY_HOLD_OFF);
        coord
            .event_sender()
            .send(DiscoveryEvent::Registered { assigned_service_name: "Test Broker".into() })
            .unwrap();
        assert_eq!(
            coord.tick(start + QUERY_HOLD_OFF),
            vec![CoordinatorAction::StartServing]
        );

        // A rival appears: unregister and stand by.
        coord
            .event_sender()
            .send(DiscoveryEvent::OtherBrokerFound(other("rival")))
            .unwrap();
        assert_eq!(
            coord.tick(start + Duration::from_secs(10)),
            vec![CoordinatorAction::EnterStandby]
        );
        assert_eq!(*platform.unregister_calls.lock().unwrap(), 1);

        // The rival leaves: re-register, and serving resumes on confirm.
        coord
            .event_sender()
            .send(DiscoveryEvent::OtherBrokerLost { service_name: "rival".into() })
            .unwrap();
        coord.tick(start + Duration::from_secs(11));
        assert_eq!(platform.register_calls.lock().unwrap().len(), 2);

        coord
            .event_sender()
            .send(DiscoveryEvent::Registered { assigned_service_name: "Test Broker".into() })
            .unwrap();
        assert_eq!(
            coord.tick(start + Duration::from_secs(12)),
            vec![CoordinatorAction::StartServing]
        );
    }

    #[test]
    fn test_lightweight_discovery_registers_immediately() {
        let platform = Arc::new(LightweightDiscovery);
        let mut coord = {
            let log = logging::discard();
            DiscoveryCoordinator::new(platform, disc_info(), String::new(), &log)
        };
        let start = Instant::now();

        coord.start(start).unwrap();
        let actions = coord.tick(start + QUERY_HOLD_OFF);

        // Registration and its confirmation land on the same tick: the
        // lightweight platform answers synchronously through the queue.
        assert_eq!(actions, vec![]);
        let actions = coord.tick(start + QUERY_HOLD_OFF + Duration::from_millis(1));
        assert_eq!(actions, vec![CoordinatorAction::StartServing]);
        assert_eq!(coord.assigned_service_name(), Some("Test Broker"));
    }
}
