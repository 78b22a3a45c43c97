//! The runtime which owns the live [Graph], and applies events to it

use crate::config::{self, Diagnostic};
use crate::dump::Snapshot;
use crate::graph::{Graph, ServerStates};
use crate::policy::Policy;
#[cfg(feature = "probes")]
use crate::probes;
use crate::reload;
use crate::server::{ServerKey, ServiceKey};
use crate::track::{self, FileId, InitFile};

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Checks terminated")]
    Terminated,

    #[error("Failed to read tracked file")]
    Io(#[from] std::io::Error),
}

enum Request {
    FileChanged {
        path: PathBuf,
        status: i64,
        tx: oneshot::Sender<usize>,
    },
    ProbeResult {
        service: ServiceKey,
        server: ServerKey,
        index: usize,
        up: bool,
        tx: oneshot::Sender<bool>,
    },
    Reload {
        config: String,
        tx: oneshot::Sender<Vec<Diagnostic>>,
    },
    Dump {
        tx: oneshot::Sender<Snapshot>,
    },
    Terminate,
}

struct ChecksInner {
    graph: Graph,
    policy: Policy,

    // Incremented by every reload, for instrumentation.
    generation: u64,

    // Should be kept in lockstep with "Self::graph".
    states_tx: watch::Sender<ServerStates>,

    rx: mpsc::Receiver<Request>,
}

impl ChecksInner {
    fn new(
        graph: Graph,
        policy: Policy,
        rx: mpsc::Receiver<Request>,
        states_tx: watch::Sender<ServerStates>,
    ) -> Self {
        Self {
            graph,
            policy,
            generation: 0,
            states_tx,
            rx,
        }
    }

    async fn run(mut self) {
        self.start().await;
        loop {
            match self.rx.recv().await {
                Some(Request::FileChanged { path, status, tx }) => {
                    let _ = tx.send(self.file_changed(&path, status));
                }
                Some(Request::ProbeResult {
                    service,
                    server,
                    index,
                    up,
                    tx,
                }) => {
                    let _ = tx.send(self.probe_result(&service, &server, index, up));
                }
                Some(Request::Reload { config, tx }) => {
                    let _ = tx.send(self.reload(&config).await);
                }
                Some(Request::Dump { tx }) => {
                    let _ = tx.send(Snapshot::capture(&self.graph));
                }
                Some(Request::Terminate) => {
                    event!(Level::INFO, "Terminating checks");
                    return;
                }
                // The caller has abandoned the checks, so nobody is left
                // to hear about the servers.
                None => return,
            }
        }
    }

    #[instrument(skip(self), name = "ChecksInner::start")]
    async fn start(&mut self) {
        let every: Vec<FileId> = self.graph.files().iter().map(|(id, _)| id).collect();
        load_statuses(&mut self.graph, &self.policy, &every).await;
        self.graph.cutover(false);
        self.publish();
    }

    fn publish(&self) {
        let states = self.graph.server_states();
        self.states_tx.send_if_modified(|current| {
            if *current == states {
                return false;
            }
            *current = states;
            true
        });
    }

    fn file_changed(&mut self, path: &Path, status: i64) -> usize {
        let files = self.graph.files().by_path(path);
        if files.is_empty() {
            event!(Level::DEBUG, path = %path.display(), "Update for unknown path dropped");
            return 0;
        }
        let updated = files
            .into_iter()
            .filter(|file| self.graph.update_status(*file, status, false))
            .count();
        self.publish();
        updated
    }

    fn probe_result(
        &mut self,
        service: &ServiceKey,
        server: &ServerKey,
        index: usize,
        up: bool,
    ) -> bool {
        let Some(rs) = self.graph.find_server(service, server) else {
            event!(Level::DEBUG, %service, %server, "Probe result for unknown server dropped");
            return false;
        };
        let checker = self.graph.server(rs).checkers().get(index).copied();
        let Some(checker) = checker.filter(|id| self.graph.checker(*id).launch().is_some()) else {
            event!(Level::DEBUG, %service, %server, index, "Probe result for unknown probe dropped");
            return false;
        };
        let changed = self.graph.set_checker_up(checker, up);
        self.publish();
        changed
    }

    // Builds the new graph in full, beside the live one, and swaps it in
    // once its state is settled.
    #[instrument(skip_all, name = "ChecksInner::reload")]
    async fn reload(&mut self, text: &str) -> Vec<Diagnostic> {
        self.generation += 1;
        let generation = self.generation;
        #[cfg(feature = "probes")]
        probes::reload__start!(|| generation);

        let (mut graph, diagnostics) = config::parse(text);
        graph.assemble();
        let summary = reload::reconcile(&self.graph, &mut graph);
        load_statuses(&mut graph, &self.policy, &summary.fresh_files).await;
        graph.cutover(true);
        self.graph = graph;

        event!(
            Level::INFO,
            generation,
            diagnostics = diagnostics.len(),
            "Reloaded configuration"
        );
        #[cfg(feature = "probes")]
        probes::reload__done!(|| (
            generation,
            summary.equivalent_checkers as u64,
            summary.changed_checkers as u64
        ));
        self.publish();
        diagnostics
    }
}

// Prepares the init files of `fresh` files, then reads their status.
//
// Files carried across a reload keep the status the old graph knew, so
// their init files are left alone. Statuses are recorded without being
// propagated: the cutover applies them.
async fn load_statuses(graph: &mut Graph, policy: &Policy, fresh: &[FileId]) {
    for id in fresh.iter().copied() {
        let file = &graph.files()[id];
        let path = file.path.clone();

        if let Some(init) = file.init.filter(|_| policy.create_init_files) {
            if let Err(err) = prepare_init_file(&path, init).await {
                event!(Level::WARN, error = ?err, "Failed to prepare init file");
            }
        }

        match read_status(&path).await {
            Ok(status) => graph.files_mut()[id].last_status = status,
            Err(err) => {
                event!(
                    Level::WARN,
                    path = %path.display(),
                    error = ?err,
                    "Failed to read tracked file"
                );
            }
        }
    }
}

async fn prepare_init_file(path: &Path, init: InitFile) -> anyhow::Result<()> {
    if !init.overwrite {
        let exists = tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("checking for {}", path.display()))?;
        if exists {
            return Ok(());
        }
    }
    tokio::fs::write(path, format!("{}\n", init.value))
        .await
        .with_context(|| format!("writing init file {}", path.display()))?;
    event!(Level::DEBUG, path = %path.display(), value = init.value, "Wrote init file");
    Ok(())
}

// A missing file reads as 0.
async fn read_status(path: &Path) -> Result<i64, std::io::Error> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(track::parse_status(&String::from_utf8_lossy(&contents))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

/// Owns the live check graph, on a background task.
///
/// Events are applied one at a time, in the order they are sent.
pub struct Checks {
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    tx: mpsc::Sender<Request>,
    states_rx: watch::Receiver<ServerStates>,
    diagnostics: Vec<Diagnostic>,
}

/// A wrapper type indicating that the USDT probes could not be registered.
///
/// In this case, no probes will be available in the process. However, similar
/// to `std::sync::PoisonError`, this contains the checks themselves.
/// Applications which don't care about a probe registration failure may still
/// get access to the checks.
pub struct RegistrationError(Checks);

impl std::fmt::Debug for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl RegistrationError {
    /// Consume the error and get access to the contained checks.
    pub fn into_inner(self) -> Checks {
        self.0
    }
}

impl Checks {
    /// Parses `config` and starts checking.
    ///
    /// Configuration errors are never fatal; they are available from
    /// [Checks::diagnostics]. Tracked files are read, and their init files
    /// prepared, on the background task before any request is handled.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// ```no_run
    /// use lbcheck::checks::Checks;
    /// use lbcheck::policy::Policy;
    ///
    /// # async {
    /// let config = std::fs::read_to_string("/etc/lbcheck.conf").unwrap();
    /// let checks = Checks::new(&config, Policy::default()).unwrap();
    /// for diagnostic in checks.diagnostics() {
    ///     eprintln!("{diagnostic}");
    /// }
    ///
    /// let mut monitor = checks.monitor();
    /// while monitor.changed().await.is_ok() {
    ///     let states = monitor.borrow_and_update().clone();
    ///     // Hand the states to the load-balancing table.
    /// }
    /// # };
    /// ```
    ///
    /// # DTrace probe registration
    ///
    /// This constructor returns a `Result`, because it attempts to register the
    /// USDT probes it exposes, a fallible process. The `Err` variant of the
    /// returned result allows callers to access the constructed `Checks`
    /// anyway.
    ///
    /// Note that if the `"probes"` feature is not enabled, this method is
    /// infallible.
    #[instrument(skip(config), name = "Checks::new")]
    pub fn new(config: &str, policy: Policy) -> Result<Self, RegistrationError> {
        let (mut graph, diagnostics) = config::parse(config);
        graph.assemble();

        let (tx, rx) = mpsc::channel(policy.queue_depth.max(1));
        // Nothing is published until the tracked files have been read.
        let (states_tx, states_rx) = watch::channel(ServerStates::new());
        let handle = tokio::task::spawn(async move {
            let worker = ChecksInner::new(graph, policy, rx, states_tx);
            worker.run().await;
        });

        let self_ = Self {
            handle: Mutex::new(Some(handle)),
            tx,
            states_rx,
            diagnostics,
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(self_),
            Err(_) => Err(RegistrationError(self_)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(self_)
    }

    /// Errors found in the configuration the checks started with.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Subscribes to the state of every real server.
    ///
    /// The states are empty until startup has read every tracked file.
    /// Receivers are only woken when some server changes.
    pub fn monitor(&self) -> watch::Receiver<ServerStates> {
        self.states_rx.clone()
    }

    /// Reports a new status for every tracked file reading from `path`.
    ///
    /// Returns the number of tracked files whose status changed.
    pub async fn file_changed(&self, path: impl Into<PathBuf>, status: i64) -> Result<usize, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::FileChanged {
                path: path.into(),
                status,
                tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Reads the file at `path`, and reports its status.
    ///
    /// A missing file reads as status 0.
    #[instrument(level = "debug", skip(self), err, name = "Checks::file_modified")]
    pub async fn file_modified(&self, path: &Path) -> Result<usize, Error> {
        let status = read_status(path).await?;
        self.file_changed(path, status).await
    }

    /// Reports the result of a probe run by an external scheduler.
    ///
    /// `index` is the position of the probe among the server's checkers.
    /// Returns true if the checker changed state.
    pub async fn probe_result(
        &self,
        service: ServiceKey,
        server: ServerKey,
        index: usize,
        up: bool,
    ) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::ProbeResult {
                service,
                server,
                index,
                up,
                tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Replaces the live configuration.
    ///
    /// Checks which are unchanged keep their state across the reload.
    /// Returns the errors found in the new configuration.
    pub async fn reload(&self, config: impl Into<String>) -> Result<Vec<Diagnostic>, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Reload {
                config: config.into(),
                tx,
            })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Captures the whole graph.
    pub async fn dump(&self) -> Result<Snapshot, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::Dump { tx })
            .await
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Stops the background task, once it has handled earlier requests.
    pub async fn terminate(&self) -> Result<(), Error> {
        self.tx
            .send(Request::Terminate)
            .await
            .map_err(|_| Error::Terminated)?;
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return Ok(());
        };
        crate::join::join_control_task(handle).await;
        Ok(())
    }
}

impl Drop for Checks {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::ServerState;
    use crate::test_utils::{service_key, setup_tracing_subscriber};

    use tempfile::TempDir;

    fn server_key() -> ServerKey {
        ServerKey::new("10.0.0.2:80".parse().unwrap())
    }

    fn config(dir: &Path) -> String {
        format!(
            r#"
track_file health {{
    file {health}
    weight 0
}}
track_file load {{
    file {load}
    init_file 2
}}
virtual_server 10.0.0.1 80 {{
    real_server 10.0.0.2 80 {{
        weight 100
        TCP_CHECK {{
            connect_timeout 3
        }}
        FILE_CHECK {{
            track_file health
        }}
        FILE_CHECK {{
            track_file load
            weight 10
        }}
    }}
}}
"#,
            health = dir.join("health").display(),
            load = dir.join("load").display(),
        )
    }

    fn state(checks: &Checks) -> ServerState {
        *checks
            .monitor()
            .borrow()
            .get(&(service_key(), server_key()))
            .unwrap()
    }

    async fn start(dir: &TempDir, policy: Policy) -> Checks {
        setup_tracing_subscriber();
        let checks = Checks::new(&config(dir.path()), policy).unwrap();
        assert!(checks.diagnostics().is_empty(), "{:?}", checks.diagnostics());
        // Requests are only handled once startup is complete.
        checks.dump().await.unwrap();
        checks
    }

    #[tokio::test]
    async fn startup_reads_files_and_creates_init_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("health"), "0\n").unwrap();

        let checks = start(&dir, Policy::default()).await;

        assert_eq!(
            std::fs::read_to_string(dir.path().join("load")).unwrap(),
            "2\n"
        );
        assert_eq!(state(&checks), ServerState { weight: 120, alive: true });
    }

    #[tokio::test]
    async fn first_published_states_follow_the_files() {
        setup_tracing_subscriber();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("health"), "1").unwrap();

        let checks = Checks::new(&config(dir.path()), Policy::default()).unwrap();
        let mut monitor = checks.monitor();
        assert!(monitor.borrow_and_update().is_empty());

        monitor.changed().await.unwrap();
        let states = monitor.borrow_and_update().clone();
        assert_eq!(
            states.get(&(service_key(), server_key())),
            Some(&ServerState { weight: 120, alive: false })
        );
    }

    #[tokio::test]
    async fn startup_applies_down_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("health"), "1").unwrap();

        let checks = start(
            &dir,
            Policy {
                create_init_files: false,
                ..Default::default()
            },
        )
        .await;

        assert!(!dir.path().join("load").exists());
        assert_eq!(state(&checks), ServerState { weight: 100, alive: false });

        // Startup marks gating checkers down without propagating.
        let snapshot = checks.dump().await.unwrap();
        let health = snapshot
            .files
            .iter()
            .find(|file| file.name.as_str() == "health")
            .unwrap();
        assert_eq!(health.status, 1);
    }

    #[tokio::test]
    async fn file_changes_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let checks = start(&dir, Policy::default()).await;
        let mut monitor = checks.monitor();
        monitor.borrow_and_update();
        let health = dir.path().join("health");

        assert_eq!(checks.file_changed(&health, 1).await.unwrap(), 1);
        assert!(monitor.has_changed().unwrap());
        assert!(!state(&checks).alive);
        monitor.borrow_and_update();

        // A repeated status is dropped, and nobody is woken.
        assert_eq!(checks.file_changed(&health, 1).await.unwrap(), 0);
        assert!(!monitor.has_changed().unwrap());

        assert_eq!(
            checks.file_changed(dir.path().join("unknown"), 1).await.unwrap(),
            0
        );

        assert_eq!(
            checks.file_changed(dir.path().join("load"), 5).await.unwrap(),
            1
        );
        assert_eq!(state(&checks).weight, 150);
    }

    #[tokio::test]
    async fn modified_files_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let checks = start(&dir, Policy::default()).await;
        let health = dir.path().join("health");

        std::fs::write(&health, "7 failing\n").unwrap();
        assert_eq!(checks.file_modified(&health).await.unwrap(), 1);
        assert!(!state(&checks).alive);

        std::fs::remove_file(&health).unwrap();
        assert_eq!(checks.file_modified(&health).await.unwrap(), 1);
        assert!(state(&checks).alive);

        // A directory cannot be read as a status.
        std::fs::create_dir(&health).unwrap();
        assert!(matches!(
            checks.file_modified(&health).await,
            Err(Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn probe_results_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let checks = start(&dir, Policy::default()).await;

        assert!(checks
            .probe_result(service_key(), server_key(), 0, false)
            .await
            .unwrap());
        assert!(!state(&checks).alive);

        // Only probes take results.
        assert!(!checks
            .probe_result(service_key(), server_key(), 1, true)
            .await
            .unwrap());
        let other = ServerKey::new("10.0.0.9:80".parse().unwrap());
        assert!(!checks
            .probe_result(service_key(), other, 0, true)
            .await
            .unwrap());

        assert!(checks
            .probe_result(service_key(), server_key(), 0, true)
            .await
            .unwrap());
        assert!(state(&checks).alive);
    }

    #[tokio::test]
    async fn reload_carries_state() {
        let dir = tempfile::tempdir().unwrap();
        let checks = start(&dir, Policy::default()).await;
        let health = dir.path().join("health");
        checks.file_changed(&health, 1).await.unwrap();
        checks
            .probe_result(service_key(), server_key(), 0, false)
            .await
            .unwrap();

        let diagnostics = checks.reload(config(dir.path())).await.unwrap();
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        assert_eq!(state(&checks), ServerState { weight: 120, alive: false });

        let snapshot = checks.dump().await.unwrap();
        for file in &snapshot.files {
            assert!(file.reloaded, "{} was not reloaded", file.name);
        }
        let checkers = &snapshot.services[0].servers[0].checkers;
        assert!(!checkers[0].up);
        assert!(checkers[0].has_run);
        assert!(!checkers[1].up);

        // The probe result is forgotten once the probe changes.
        let changed = config(dir.path()).replace("connect_timeout 3", "connect_timeout 5");
        checks.reload(changed).await.unwrap();
        let checkers = &checks.dump().await.unwrap().services[0].servers[0].checkers;
        assert!(checkers[0].up);
        assert!(!checkers[0].has_run);
    }

    #[tokio::test]
    async fn reload_renaming_a_file_keeps_it_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let checks = start(&dir, Policy::default()).await;
        let health = dir.path().join("health");

        // The file on disk has already recovered, but the change is
        // delivered after the reload.
        checks.file_changed(&health, 1).await.unwrap();
        let renamed = config(dir.path()).replace("track_file health", "track_file renamed");
        assert!(checks.reload(renamed).await.unwrap().is_empty());
        assert!(!state(&checks).alive);

        assert_eq!(checks.file_changed(&health, 0).await.unwrap(), 1);
        assert!(state(&checks).alive);
    }

    #[tokio::test]
    async fn reload_reports_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let checks = start(&dir, Policy::default()).await;

        let broken = config(dir.path()).replace("track_file health\n", "track_file missing\n");
        let diagnostics = checks.reload(broken).await.unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0].error,
            config::Error::UnresolvedResource("missing".to_string())
        );

        // The rest of the configuration still applies.
        let snapshot = checks.dump().await.unwrap();
        assert_eq!(snapshot.services[0].servers[0].checkers.len(), 2);
    }

    #[tokio::test]
    async fn terminate_stops_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let checks = start(&dir, Policy::default()).await;

        checks.terminate().await.unwrap();
        assert!(matches!(
            checks.file_changed(dir.path().join("health"), 1).await,
            Err(Error::Terminated)
        ));
        assert!(matches!(checks.terminate().await, Err(Error::Terminated)));
    }
}
