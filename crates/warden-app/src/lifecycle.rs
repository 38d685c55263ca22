//! Service lifecycle controller.
//!
//! Starts and stops the proxy subsystem on the runtime's blocking pool. The
//! state cell is the single-flight guard: `start` only proceeds from
//! `Stopped` and `stop` only from `Running`. Any other call is a no-op that
//! reports the state it saw.
//!
//! Failures inside a transition are logged and the transition still ends in
//! a terminal state. The first failure is returned through the task handle.
//! A transition that panics leaves the service `Stopped`.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use warden_core::{RootDetector, ServiceState, StateCell};
use warden_proxy::{
    CapturePlugin, ClientResolver, HostResolver, NetworkHostResolver, ProcNetClientResolver,
    ProxyError, ProxyFactory, ProxyService, TransparentProxyController, TransparentProxyError,
};
use warden_storage::{Database, Settings, StorageError};

/// Namespace the capture store is attached under.
pub const CAPTURE_NAMESPACE: &str = "Database";

/// Errors raised during a lifecycle transition.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Transparent proxy rules could not be applied.
    #[error("Transparent proxy rules failed: {0}")]
    Rules(#[from] TransparentProxyError),

    /// Settings or capture store unavailable.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Proxy could not be built, started or stopped.
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// The transition task panicked or was cancelled.
    #[error("Lifecycle task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Outcome of a `start` or `stop` request.
#[derive(Debug)]
pub enum Transition {
    /// The transition was accepted and runs in the background.
    Submitted(JoinHandle<Result<()>>),
    /// Another transition owns the state; nothing was done.
    Skipped(ServiceState),
}

impl Transition {
    /// Returns true if work was submitted.
    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted(_))
    }

    /// Waits for submitted work. A skipped request resolves immediately.
    pub async fn wait(self) -> Result<()> {
        match self {
            Self::Submitted(handle) => handle.await?,
            Self::Skipped(_) => Ok(()),
        }
    }
}

/// Collaborators the controller drives.
#[derive(Clone)]
pub struct ServiceContext {
    /// Directory holding the settings and capture store.
    pub data_dir: PathBuf,
    /// Builds the proxy on every start.
    pub factory: Arc<dyn ProxyFactory>,
    /// Decides whether redirect rules are attempted.
    pub detector: RootDetector,
    /// Installs and removes the redirect rules.
    pub transparent: TransparentProxyController,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("data_dir", &self.data_dir)
            .field("factory", &"ProxyFactory")
            .field("detector", &self.detector)
            .field("transparent", &self.transparent)
            .finish()
    }
}

impl ServiceContext {
    /// Creates a context probing the standard root locations.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        factory: Arc<dyn ProxyFactory>,
        transparent: TransparentProxyController,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            factory,
            detector: RootDetector::new(),
            transparent,
        }
    }

    /// Replaces the root detector.
    pub fn with_detector(mut self, detector: RootDetector) -> Self {
        self.detector = detector;
        self
    }
}

/// What a running service holds on to.
struct ProxyRuntime {
    hosts: Arc<dyn HostResolver>,
    clients: Arc<dyn ClientResolver>,
    proxy: Box<dyn ProxyService>,
    /// Whether rules were attempted at start, so stop removes them.
    rules: bool,
}

struct Shared {
    context: ServiceContext,
    state: StateCell,
    active: Mutex<Option<ProxyRuntime>>,
}

/// Starts and stops the proxy service.
pub struct ServiceController {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl std::fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceController")
            .field("context", &self.shared.context)
            .field("state", &self.shared.state.get())
            .finish()
    }
}

impl ServiceController {
    /// Creates a stopped controller submitting work to `runtime`.
    pub fn new(context: ServiceContext, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                context,
                state: StateCell::new(),
                active: Mutex::new(None),
            }),
            runtime,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.shared.state.get()
    }

    /// Returns true while the service is `Running`.
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// The collaborators this controller drives.
    pub fn context(&self) -> &ServiceContext {
        &self.shared.context
    }

    /// Starts the service if it is stopped.
    pub fn start(&self) -> Transition {
        if let Err(current) = self
            .shared
            .state
            .transition(ServiceState::Stopped, ServiceState::Starting)
        {
            tracing::debug!("Start ignored, service is {}", current);
            return Transition::Skipped(current);
        }

        let shared = self.shared.clone();
        Transition::Submitted(self.runtime.spawn_blocking(move || shared.start_work()))
    }

    /// Stops the service if it is running.
    pub fn stop(&self) -> Transition {
        if let Err(current) = self
            .shared
            .state
            .transition(ServiceState::Running, ServiceState::Stopping)
        {
            tracing::debug!("Stop ignored, service is {}", current);
            return Transition::Skipped(current);
        }

        let shared = self.shared.clone();
        Transition::Submitted(self.runtime.spawn_blocking(move || shared.stop_work()))
    }

    /// Starts when `on`, stops otherwise.
    pub fn toggle(&self, on: bool) -> Transition {
        if on {
            self.start()
        } else {
            self.stop()
        }
    }
}

/// Returns the state to `Stopped` if a transition unwinds.
struct StopOnUnwind<'a>(&'a StateCell);

impl Drop for StopOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.set(ServiceState::Stopped);
        }
    }
}

impl Shared {
    fn open_store(&self, defaults: &Settings) -> Result<(Database, Settings)> {
        let store = Database::open_in(&self.context.data_dir)?;
        let settings = store.init_settings(defaults)?;
        Ok((store, settings))
    }

    fn remove_rules(&self) -> Result<()> {
        let transparent = &self.context.transparent;
        transparent.disable(transparent.identity())?;
        Ok(())
    }

    fn start_work(&self) -> Result<()> {
        let _unwind = StopOnUnwind(&self.state);
        tracing::info!("Starting proxy service");
        let mut errors: Vec<LifecycleError> = Vec::new();

        let defaults = Settings::defaults(&self.context.data_dir);
        let (store, settings) = match self.open_store(&defaults) {
            Ok((store, settings)) => (Some(store), settings),
            Err(e) => {
                tracing::error!("Settings store unavailable, using defaults: {}", e);
                errors.push(e);
                (None, defaults)
            }
        };

        let rooted = self.context.detector.is_rooted();
        let rules = rooted && settings.transparent;
        if rules {
            let transparent = &self.context.transparent;
            if let Err(e) = transparent.enable(transparent.identity()) {
                tracing::error!("Failed to install transparent proxy rules: {}", e);
                errors.push(e.into());
            }
        } else {
            tracing::info!(
                "Transparent proxy rules skipped (rooted: {}, enabled: {})",
                rooted,
                settings.transparent
            );
        }

        let hosts: Arc<dyn HostResolver> = Arc::new(NetworkHostResolver::new());
        let clients: Arc<dyn ClientResolver> = Arc::new(ProcNetClientResolver::new());

        let mut proxy = match self.context.factory.construct(hosts.clone(), clients.clone()) {
            Ok(proxy) => proxy,
            Err(e) => {
                tracing::error!("Failed to construct proxy: {}", e);
                if rules {
                    if let Err(e) = self.remove_rules() {
                        tracing::error!("Failed to remove transparent proxy rules: {}", e);
                    }
                }
                hosts.clean_up();
                clients.clean_up();
                self.state.set(ServiceState::Stopped);
                return Err(e.into());
            }
        };

        if let Some(store) = store {
            if let Err(e) = proxy.set_session(CAPTURE_NAMESPACE, store.clone(), "") {
                tracing::error!("Failed to attach capture store: {}", e);
                errors.push(e.into());
            }

            if settings.capture_data {
                let plugin = CapturePlugin::new(store).with_content_dir(settings.content_dir());
                proxy.add_plugin(Arc::new(plugin));
            }
        }

        match proxy.run() {
            Ok(addr) => tracing::info!("Proxy listening on {}", addr),
            Err(e) => {
                tracing::error!("Proxy failed to listen: {}", e);
                errors.push(e.into());
            }
        }

        *self.active.lock() = Some(ProxyRuntime {
            hosts,
            clients,
            proxy,
            rules,
        });
        self.state.set(ServiceState::Running);
        tracing::info!("Proxy service running");

        errors.into_iter().next().map_or(Ok(()), Err)
    }

    fn stop_work(&self) -> Result<()> {
        let _unwind = StopOnUnwind(&self.state);
        tracing::info!("Stopping proxy service");
        let mut errors: Vec<LifecycleError> = Vec::new();

        if let Some(mut runtime) = self.active.lock().take() {
            if runtime.rules {
                if let Err(e) = self.remove_rules() {
                    tracing::error!("Failed to remove transparent proxy rules: {}", e);
                    errors.push(e);
                }
            }

            if let Err(e) = runtime.proxy.stop() {
                tracing::error!("Failed to stop proxy: {}", e);
                errors.push(e.into());
            }

            runtime.hosts.clean_up();
            runtime.clients.clean_up();
        }

        self.state.set(ServiceState::Stopped);
        tracing::info!("Proxy service stopped");

        errors.into_iter().next().map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use warden_core::{LogBuffer, RulePolicy};
    use warden_proxy::{PrivilegedShell, ProxyPlugin};

    #[derive(Default)]
    struct Calls {
        constructed: AtomicUsize,
        runs: AtomicUsize,
        stops: AtomicUsize,
        sessions: Mutex<Vec<String>>,
        plugins: Mutex<Vec<String>>,
    }

    #[derive(Default)]
    struct FakeFactory {
        calls: Arc<Calls>,
        fail_construct: bool,
        panic_construct: bool,
        fail_run: bool,
        panic_stop: bool,
    }

    struct FakeService {
        calls: Arc<Calls>,
        fail_run: bool,
        panic_stop: bool,
        running: bool,
    }

    fn bind_error() -> ProxyError {
        ProxyError::Spawn {
            addr: SocketAddr::from(([127, 0, 0, 1], 9008)),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        }
    }

    impl ProxyFactory for FakeFactory {
        fn construct(
            &self,
            _hosts: Arc<dyn HostResolver>,
            _clients: Arc<dyn ClientResolver>,
        ) -> warden_proxy::Result<Box<dyn ProxyService>> {
            if self.fail_construct {
                return Err(ProxyError::Proxy("no engine".to_string()));
            }
            if self.panic_construct {
                panic!("engine exploded");
            }
            self.calls.constructed.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeService {
                calls: self.calls.clone(),
                fail_run: self.fail_run,
                panic_stop: self.panic_stop,
                running: false,
            }))
        }
    }

    impl ProxyService for FakeService {
        fn set_session(
            &mut self,
            namespace: &str,
            store: Database,
            credentials: &str,
        ) -> std::result::Result<(), StorageError> {
            store.attach_session(namespace, credentials)?;
            self.calls.sessions.lock().push(namespace.to_string());
            Ok(())
        }

        fn add_plugin(&mut self, plugin: Arc<dyn ProxyPlugin>) {
            self.calls.plugins.lock().push(plugin.name().to_string());
        }

        fn run(&mut self) -> warden_proxy::Result<SocketAddr> {
            self.calls.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_run {
                return Err(bind_error());
            }
            self.running = true;
            Ok(SocketAddr::from(([127, 0, 0, 1], 9008)))
        }

        fn stop(&mut self) -> warden_proxy::Result<()> {
            self.calls.stops.fetch_add(1, Ordering::SeqCst);
            if self.panic_stop {
                panic!("stop exploded");
            }
            self.running = false;
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }

    fn echo_controller(shell: PrivilegedShell, log: &LogBuffer) -> TransparentProxyController {
        let policy = RulePolicy {
            binary: "echo".to_string(),
            ..RulePolicy::default()
        };
        TransparentProxyController::new(policy, shell, "10042").with_log_buffer(log.clone())
    }

    fn sh() -> PrivilegedShell {
        PrivilegedShell::new("sh", Vec::<String>::new())
    }

    fn controller(dir: &TempDir, factory: FakeFactory, detector: RootDetector) -> ServiceController {
        let log = LogBuffer::default();
        let context = ServiceContext::new(dir.path(), Arc::new(factory), echo_controller(sh(), &log))
            .with_detector(detector);
        ServiceController::new(context, Handle::current())
    }

    // ==================== Start/Stop Tests ====================

    #[tokio::test]
    async fn start_then_stop() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let service = controller(&dir, factory, RootDetector::empty());

        assert_eq!(service.state(), ServiceState::Stopped);
        service.start().wait().await.unwrap();

        assert!(service.is_running());
        assert_eq!(calls.constructed.load(Ordering::SeqCst), 1);
        assert_eq!(calls.runs.load(Ordering::SeqCst), 1);
        assert_eq!(*calls.sessions.lock(), vec![CAPTURE_NAMESPACE.to_string()]);
        assert_eq!(*calls.plugins.lock(), vec!["capture".to_string()]);

        service.stop().wait().await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_start_is_skipped() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let service = controller(&dir, factory, RootDetector::empty());

        let first = service.start();
        let second = service.start();

        assert!(first.is_submitted());
        assert!(matches!(
            second,
            Transition::Skipped(ServiceState::Starting) | Transition::Skipped(ServiceState::Running)
        ));

        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(calls.constructed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_skipped() {
        let dir = TempDir::new().unwrap();
        let service = controller(&dir, FakeFactory::default(), RootDetector::empty());

        let transition = service.stop();
        assert!(matches!(transition, Transition::Skipped(ServiceState::Stopped)));
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn toggle_maps_to_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let service = controller(&dir, FakeFactory::default(), RootDetector::empty());

        service.toggle(true).wait().await.unwrap();
        assert!(service.is_running());
        assert!(!service.toggle(true).is_submitted());

        service.toggle(false).wait().await.unwrap();
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn settings_are_initialised_on_start() {
        let dir = TempDir::new().unwrap();
        let service = controller(&dir, FakeFactory::default(), RootDetector::empty());
        service.start().wait().await.unwrap();

        let store = Database::open_in(dir.path()).unwrap();
        let settings = store
            .load_settings(&Settings::defaults("/elsewhere"))
            .unwrap();
        assert_eq!(settings.data_dir, dir.path());
        assert!(store.get_session(CAPTURE_NAMESPACE).unwrap().is_some());

        service.stop().wait().await.unwrap();
    }

    #[tokio::test]
    async fn capture_disabled_registers_no_plugin() {
        let dir = TempDir::new().unwrap();
        let store = Database::open_in(dir.path()).unwrap();
        store
            .set_config(Settings::CAPTURE_DATA, &serde_json::json!(false))
            .unwrap();

        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let service = controller(&dir, factory, RootDetector::empty());
        service.start().wait().await.unwrap();

        assert!(calls.plugins.lock().is_empty());
        assert_eq!(calls.sessions.lock().len(), 1);
    }

    // ==================== Transparent Rules Tests ====================

    #[tokio::test]
    async fn rooted_host_installs_and_removes_rules() {
        let dir = TempDir::new().unwrap();
        let log = LogBuffer::default();
        let context = ServiceContext::new(
            dir.path(),
            Arc::new(FakeFactory::default()),
            echo_controller(sh(), &log),
        )
        .with_detector(RootDetector::empty().with_build_tags("release-keys,test-keys"));
        let service = ServiceController::new(context, Handle::current());

        service.start().wait().await.unwrap();
        assert!(log.text().contains("echo -t nat -A OUTPUT -j sppluginOutput"));

        service.stop().wait().await.unwrap();
        // Newest first: the last removal rule heads the buffer
        assert!(log.text().starts_with("echo -t nat --delete-chain sppluginOutput"));
    }

    #[tokio::test]
    async fn transparent_setting_off_skips_rules() {
        let dir = TempDir::new().unwrap();
        Database::open_in(dir.path())
            .unwrap()
            .set_config(Settings::TRANSPARENT, &serde_json::json!(false))
            .unwrap();

        let log = LogBuffer::default();
        let context = ServiceContext::new(
            dir.path(),
            Arc::new(FakeFactory::default()),
            echo_controller(sh(), &log),
        )
        .with_detector(RootDetector::empty().with_build_tags("test-keys"));
        let service = ServiceController::new(context, Handle::current());

        service.start().wait().await.unwrap();
        service.stop().wait().await.unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn missing_elevation_still_runs_proxy() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let log = LogBuffer::default();
        let shell = PrivilegedShell::new("/nonexistent/warden-su", ["-c", "sh"]);
        let context =
            ServiceContext::new(dir.path(), Arc::new(factory), echo_controller(shell, &log))
                .with_detector(RootDetector::empty().with_build_tags("test-keys"));
        let service = ServiceController::new(context, Handle::current());

        let err = service.start().wait().await.unwrap_err();
        match err {
            LifecycleError::Rules(e) => assert_eq!(e.applied, 0),
            other => panic!("unexpected error: {other}"),
        }
        assert!(service.is_running());
        assert_eq!(calls.runs.load(Ordering::SeqCst), 1);

        // The failed removal is reported, the service still stops
        assert!(matches!(
            service.stop().wait().await,
            Err(LifecycleError::Rules(_))
        ));
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    // ==================== Failure Tests ====================

    #[tokio::test]
    async fn bind_failure_still_reaches_running() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory {
            fail_run: true,
            ..FakeFactory::default()
        };
        let service = controller(&dir, factory, RootDetector::empty());

        let err = service.start().wait().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Proxy(ProxyError::Spawn { .. })));
        assert!(service.is_running());

        service.stop().wait().await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn construct_failure_ends_stopped() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory {
            fail_construct: true,
            ..FakeFactory::default()
        };
        let service = controller(&dir, factory, RootDetector::empty());

        let err = service.start().wait().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Proxy(ProxyError::Proxy(_))));
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(service.start().is_submitted());
    }

    #[tokio::test]
    async fn panicking_start_ends_stopped() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory {
            panic_construct: true,
            ..FakeFactory::default()
        };
        let service = controller(&dir, factory, RootDetector::empty());

        let err = service.start().wait().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Task(ref e) if e.is_panic()));
        assert_eq!(service.state(), ServiceState::Stopped);

        let retry = service.start();
        assert!(retry.is_submitted());
        assert!(retry.wait().await.is_err());
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn panicking_stop_ends_stopped() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory {
            panic_stop: true,
            ..FakeFactory::default()
        };
        let calls = factory.calls.clone();
        let service = controller(&dir, factory, RootDetector::empty());

        service.start().wait().await.unwrap();
        let err = service.stop().wait().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Task(_)));
        assert_eq!(service.state(), ServiceState::Stopped);

        service.start().wait().await.unwrap();
        assert!(service.is_running());
        assert_eq!(calls.constructed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unavailable_store_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let log = LogBuffer::default();
        let context = ServiceContext::new(&blocker, Arc::new(factory), echo_controller(sh(), &log))
            .with_detector(RootDetector::empty());
        let service = ServiceController::new(context, Handle::current());

        let err = service.start().wait().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Storage(_)));
        assert!(service.is_running());
        assert!(calls.sessions.lock().is_empty());
        assert!(calls.plugins.lock().is_empty());
        assert_eq!(calls.runs.load(Ordering::SeqCst), 1);
    }
}
