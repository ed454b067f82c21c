//! Agent Controller
//!
//! Baut die Signaling-Identität auf und überwacht sie:
//! 1. Erreichbarkeit des Endpunkts prüfen
//! 2. Echter Agent (URI, Transport, Agent, Start mit Timeout)
//! 3. Registrierung (nicht fatal)
//!
//! Jeder Fehler landet im degradierten Modus, nie in einem unbenutzbaren
//! Zustand.

use super::handle::{AgentHandle, AgentMode, RegistrationState};
use crate::config::{AgentIdentity, Timings};
use crate::signaling::{
    AgentNotification, AgentOptions, ConnectivityProbe, Credentials, Registerer,
    RegistererOptions, RegistererState, SignalingError, SignalingStack,
};
use crate::status::{PhoneEvent, StatusReporter};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Besitzt genau einen AgentHandle und dessen Registrierung
pub struct AgentController {
    stack: Arc<dyn SignalingStack>,
    probe: Arc<dyn ConnectivityProbe>,
    status: StatusReporter,
    timings: Timings,
    identity: RwLock<Option<AgentIdentity>>,
    handle: RwLock<Option<Arc<AgentHandle>>>,
    registerer: Mutex<Option<Arc<dyn Registerer>>>,
    registration: Arc<RwLock<RegistrationState>>,
    /// Listener-Tasks für Agent- und Registrierungs-Events
    listeners: Mutex<Vec<JoinHandle<()>>>,
    /// Serialisiert initialize/reinitialize/shutdown
    lifecycle: tokio::sync::Mutex<()>,
}

impl AgentController {
    pub fn new(
        stack: Arc<dyn SignalingStack>,
        probe: Arc<dyn ConnectivityProbe>,
        status: StatusReporter,
        timings: Timings,
    ) -> Self {
        Self {
            stack,
            probe,
            status,
            timings,
            identity: RwLock::new(None),
            handle: RwLock::new(None),
            registerer: Mutex::new(None),
            registration: Arc::new(RwLock::new(RegistrationState::Unregistered)),
            listeners: Mutex::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn mode(&self) -> AgentMode {
        self.handle
            .read()
            .as_ref()
            .map(|h| h.mode())
            .unwrap_or(AgentMode::Uninitialized)
    }

    /// `true` sobald die Initialisierung (echt oder degradiert) abgeschlossen ist
    pub fn is_ready(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Der aktive Handle zum Ausleihen
    pub fn handle(&self) -> Option<Arc<AgentHandle>> {
        self.handle.read().clone()
    }

    pub fn identity(&self) -> Option<AgentIdentity> {
        self.identity.read().clone()
    }

    pub fn registration_state(&self) -> RegistrationState {
        *self.registration.read()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Initialisiert den Agent für die Identität. Endet immer in einem
    /// benutzbaren Modus.
    pub async fn initialize(&self, identity: AgentIdentity) -> AgentMode {
        let _lifecycle = self.lifecycle.lock().await;
        // Ein vorhandener Handle wird ersetzt, nie weiterbenutzt
        if self.teardown().await {
            tracing::info!("Replacing active agent handle");
        }
        self.initialize_locked(identity).await
    }

    /// Ersetzt den aktiven Handle, optional mit anderem Endpunkt
    pub async fn reinitialize(&self, endpoint: Option<&str>) -> AgentMode {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(identity) = self.identity() else {
            self.status.report("agent not ready");
            return AgentMode::Uninitialized;
        };
        let identity = match endpoint {
            Some(endpoint) => identity.with_endpoint(endpoint),
            None => identity,
        };

        self.teardown().await;
        self.initialize_locked(identity).await
    }

    /// Meldet ab und stoppt den Agent
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.teardown().await {
            self.status.report("Agent stopped");
        }
    }

    async fn initialize_locked(&self, identity: AgentIdentity) -> AgentMode {
        *self.identity.write() = Some(identity.clone());
        let endpoint = identity.endpoint().to_string();

        self.status.report(format!("Connecting to {}...", endpoint));
        if self.probe.probe(&endpoint, self.timings.probe_timeout).await {
            match self.initialize_real(&identity).await {
                Ok(handle) => {
                    *self.handle.write() = Some(Arc::new(handle));
                    self.status.report("Agent connected");
                    // Registrierungsfehler sind nicht fatal
                    let _ = self.register().await;
                    return AgentMode::Real;
                }
                Err(e) => {
                    tracing::error!("Agent start failed: {}", e);
                    self.status.report(format!("Agent start failed: {}", e));
                }
            }
        } else {
            tracing::warn!("Signaling endpoint {} unreachable", endpoint);
            self.status.report("Signaling server unreachable");
        }

        self.initialize_degraded();
        AgentMode::Degraded
    }

    /// Echter Pfad: URI, Transport, Agent, Start mit Timeout
    async fn initialize_real(&self, identity: &AgentIdentity) -> Result<AgentHandle, SignalingError> {
        let uri = self
            .stack
            .make_uri(identity.uri())
            .ok_or_else(|| SignalingError::InvalidUri(identity.uri().to_string()))?;
        let transport = self.stack.create_transport(identity.endpoint())?;
        let agent = self.stack.create_agent(
            uri,
            AgentOptions {
                transport: transport.clone(),
                credentials: Credentials {
                    username: identity.username().to_string(),
                    password: identity.password().to_string(),
                },
                display_name: identity.display_name().to_string(),
            },
        )?;

        let listener = self.spawn_agent_listener(agent.subscribe());

        match tokio::time::timeout(self.timings.start_timeout, agent.start()).await {
            Ok(Ok(())) => {
                self.listeners.lock().push(listener);
                tracing::info!("Agent {} started", agent.uri());
                Ok(AgentHandle::Real { agent, transport })
            }
            Ok(Err(e)) => {
                listener.abort();
                Err(e)
            }
            Err(_) => {
                listener.abort();
                agent.stop().await;
                Err(SignalingError::Timeout(format!(
                    "agent start exceeded {:?}",
                    self.timings.start_timeout
                )))
            }
        }
    }

    /// No-op Handle ohne Transport
    fn initialize_degraded(&self) {
        tracing::warn!("Running without signaling transport (degraded mode)");
        *self.handle.write() = Some(Arc::new(AgentHandle::Degraded));
        self.status.report("Running in offline mode - calls will be simulated");
    }

    /// Stoppt Handle und Listener. `true` wenn ein Handle aktiv war.
    async fn teardown(&self) -> bool {
        let registerer = self.registerer.lock().take();
        if let Some(registerer) = registerer {
            let unregister =
                tokio::time::timeout(self.timings.start_timeout, registerer.unregister()).await;
            match unregister {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Unregister failed: {}", e),
                Err(_) => tracing::warn!("Unregister timed out"),
            }
        }

        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }
        self.set_registration(RegistrationState::Unregistered);

        let handle = self.handle.write().take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    /// Registriert den Agent. Nur mit echtem Handle sinnvoll; Fehler werden
    /// gemeldet, der Agent bleibt benutzbar.
    pub async fn register(&self) -> Result<(), SignalingError> {
        let agent = match self.handle().as_deref().and_then(|h| h.user_agent().cloned()) {
            Some(agent) => agent,
            None => {
                tracing::debug!("Register skipped: no live transport");
                return Err(SignalingError::NotConnected);
            }
        };

        let existing = self.registerer.lock().clone();
        let registerer = match existing {
            Some(registerer) => registerer,
            None => {
                let registerer = match agent.create_registerer(RegistererOptions::default()) {
                    Ok(registerer) => registerer,
                    Err(e) => {
                        self.status.report(format!("Registration failed: {}", e));
                        return Err(e);
                    }
                };
                let listener = self.spawn_registration_listener(registerer.subscribe());
                self.listeners.lock().push(listener);
                *self.registerer.lock() = Some(registerer.clone());
                registerer
            }
        };

        match registerer.register().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("Registration failed: {}", e);
                self.status.report(format!("Registration failed: {}", e));
                Err(e)
            }
        }
    }

    fn set_registration(&self, state: RegistrationState) {
        let changed = {
            let mut current = self.registration.write();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            self.status.emit(PhoneEvent::RegistrationChanged(state));
        }
    }

    // ========================================================================
    // LISTENERS
    // ========================================================================

    fn spawn_agent_listener(
        &self,
        mut notifications: broadcast::Receiver<AgentNotification>,
    ) -> JoinHandle<()> {
        let status = self.status.clone();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(AgentNotification::Started) => tracing::debug!("Agent transport started"),
                    Ok(AgentNotification::Stopped) => {
                        tracing::warn!("Agent transport stopped");
                        status.report("Disconnected from signaling server");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Agent listener lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Übersetzt Registerer-Events in RegistrationState, in Lieferreihenfolge
    fn spawn_registration_listener(
        &self,
        mut events: broadcast::Receiver<RegistererState>,
    ) -> JoinHandle<()> {
        let status = self.status.clone();
        let registration = Arc::clone(&self.registration);
        tokio::spawn(async move {
            loop {
                let state = match events.recv().await {
                    Ok(RegistererState::Registering) => RegistrationState::Registering,
                    Ok(RegistererState::Registered) => RegistrationState::Registered,
                    Ok(RegistererState::Unregistered) => RegistrationState::Unregistered,
                    Ok(RegistererState::Terminated) => RegistrationState::Terminated,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Registration listener lagged by {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                *registration.write() = state;
                status.emit(PhoneEvent::RegistrationChanged(state));
                status.report(match state {
                    RegistrationState::Registering => "Registering...",
                    RegistrationState::Registered => "Registered",
                    RegistrationState::Unregistered => "Unregistered",
                    RegistrationState::Terminated => "Registration terminated",
                });
            }
        })
    }
}

impl std::fmt::Debug for AgentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentController")
            .field("mode", &self.mode())
            .field("registration", &self.registration_state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use std::time::Duration;

    fn identity() -> AgentIdentity {
        AgentIdentity::new("alice", "secret", "example.com", "Alice", "wss://sip.example.com/ws")
    }

    struct Fixture {
        controller: AgentController,
        agent: Arc<FakeAgent>,
        stack: Arc<FakeStack>,
        probe: Arc<FakeProbe>,
        status: Arc<RecordingStatus>,
    }

    fn fixture(reachable: bool, agent: FakeAgent) -> Fixture {
        let agent = Arc::new(agent);
        let stack = Arc::new(FakeStack::new(agent.clone()));
        fixture_with_stack(reachable, agent, stack)
    }

    fn fixture_with_stack(reachable: bool, agent: Arc<FakeAgent>, stack: Arc<FakeStack>) -> Fixture {
        let probe = Arc::new(FakeProbe::new(reachable));
        let status = Arc::new(RecordingStatus::default());
        let controller = AgentController::new(
            stack.clone(),
            probe.clone(),
            StatusReporter::new(status.clone()),
            Timings::default(),
        );
        Fixture {
            controller,
            agent,
            stack,
            probe,
            status,
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_degrades() {
        let f = fixture(false, FakeAgent::new(StartBehavior::Succeed));
        assert!(!f.controller.is_ready());

        let mode = f.controller.initialize(identity()).await;

        assert_eq!(mode, AgentMode::Degraded);
        assert!(f.controller.handle().unwrap().transport().is_none());
        assert_eq!(f.probe.last_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(f.stack.created(), 0);
        assert!(f.status.contains("Signaling server unreachable"));
    }

    #[tokio::test]
    async fn test_real_start_registers() {
        let f = fixture(true, FakeAgent::new(StartBehavior::Succeed));

        let mode = f.controller.initialize(identity()).await;

        assert_eq!(mode, AgentMode::Real);
        assert!(f.controller.handle().unwrap().transport().is_some());
        assert_eq!(f.agent.registerer.calls(), 1);

        // Listener verarbeitet die Events asynchron
        tokio::task::yield_now().await;
        assert_eq!(f.controller.registration_state(), RegistrationState::Registered);
        assert!(f.status.contains("Registering..."));
        assert!(f.status.contains("Registered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_falls_back_once() {
        let f = fixture(true, FakeAgent::new(StartBehavior::Hang));
        let started = tokio::time::Instant::now();

        let mode = f.controller.initialize(identity()).await;

        assert_eq!(mode, AgentMode::Degraded);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(f.agent.starts(), 1);
        assert_eq!(f.agent.stops(), 1);
        let degraded = f
            .status
            .lines()
            .iter()
            .filter(|l| l.starts_with("Running in offline mode"))
            .count();
        assert_eq!(degraded, 1);
    }

    #[tokio::test]
    async fn test_rejected_start_degrades() {
        let f = fixture(true, FakeAgent::new(StartBehavior::Fail));
        assert_eq!(f.controller.initialize(identity()).await, AgentMode::Degraded);
        assert_eq!(f.agent.starts(), 1);
        assert!(f.controller.handle().unwrap().is_degraded());
    }

    #[tokio::test]
    async fn test_construction_error_degrades() {
        let agent = Arc::new(FakeAgent::new(StartBehavior::Succeed));
        let stack = Arc::new(FakeStack::failing_create(agent.clone()));
        let f = fixture_with_stack(true, agent, stack);

        assert_eq!(f.controller.initialize(identity()).await, AgentMode::Degraded);
        assert_eq!(f.agent.starts(), 0);
    }

    #[tokio::test]
    async fn test_invalid_uri_degrades() {
        let f = fixture(true, FakeAgent::new(StartBehavior::Succeed));
        let broken = AgentIdentity::new("al ice", "", "example.com", "", "wss://sip.example.com/ws");
        assert_eq!(f.controller.initialize(broken).await, AgentMode::Degraded);
        assert_eq!(f.stack.created(), 0);
    }

    #[tokio::test]
    async fn test_registration_failure_is_not_fatal() {
        let agent = FakeAgent::new(StartBehavior::Succeed).with_registerer(FakeRegisterer::new(false));
        let f = fixture(true, agent);

        assert_eq!(f.controller.initialize(identity()).await, AgentMode::Real);
        assert!(f.controller.is_ready());
        assert!(f
            .status
            .lines()
            .iter()
            .any(|l| l.starts_with("Registration failed")));

        // Manueller Retry nutzt denselben Registerer
        assert!(f.controller.register().await.is_err());
        assert_eq!(f.agent.registerer.calls(), 2);
    }

    #[tokio::test]
    async fn test_register_without_transport() {
        let f = fixture(false, FakeAgent::new(StartBehavior::Succeed));
        f.controller.initialize(identity()).await;
        assert_eq!(f.controller.register().await, Err(SignalingError::NotConnected));
    }

    #[tokio::test]
    async fn test_reinitialize_replaces_handle() {
        let f = fixture(true, FakeAgent::new(StartBehavior::Succeed));
        f.controller.initialize(identity()).await;
        let first = f.controller.handle().unwrap();

        let mode = f
            .controller
            .reinitialize(Some("wss://backup.example.com/ws"))
            .await;

        assert_eq!(mode, AgentMode::Real);
        let second = f.controller.handle().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(f.agent.stops(), 1);
        assert_eq!(
            f.controller.identity().unwrap().endpoint(),
            "wss://backup.example.com/ws"
        );
    }

    #[tokio::test]
    async fn test_second_initialize_replaces_handle() {
        let f = fixture(true, FakeAgent::new(StartBehavior::Succeed));
        f.controller.initialize(identity()).await;
        let first = f.controller.handle().unwrap();

        assert_eq!(f.controller.initialize(identity()).await, AgentMode::Real);

        let second = f.controller.handle().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(f.agent.starts(), 2);
        assert_eq!(f.agent.stops(), 1);
        // Agent- und Registrierungs-Listener des neuen Handles
        assert_eq!(f.controller.listeners.lock().len(), 2);
        assert_eq!(f.agent.registerer.calls(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_agent() {
        let f = fixture(true, FakeAgent::new(StartBehavior::Succeed));
        f.controller.initialize(identity()).await;

        f.controller.shutdown().await;

        assert_eq!(f.controller.mode(), AgentMode::Uninitialized);
        assert_eq!(f.agent.stops(), 1);
        assert_eq!(
            f.controller.registration_state(),
            RegistrationState::Unregistered
        );
    }
}
