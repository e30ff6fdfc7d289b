//! Per-instance refresh-ahead actor.
//!
//! Each [`Refresher`] owns one background task that is the sole writer of that instance's
//! credential state. Callers never touch shared mutable state directly: they send commands
//! over an `mpsc` channel and observe results through a `watch` channel, which keeps the
//! at-most-one-refresh-in-flight invariant structural rather than lock-enforced.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::ConnectorOptions;
use crate::connection_info::ConnectionInfo;
use crate::control_plane::ControlPlaneClient;
use crate::error::ConnectorError;
use crate::instance_uri::InstanceUri;
use crate::keys;
use crate::refresh_policy;

/// Latest observable state of a refresher, broadcast to all callers awaiting
/// `GetConnectionInfo`.
#[derive(Clone)]
enum Snapshot {
    /// No usable credential yet; waiters must wait for the in-flight fetch to resolve.
    Pending,
    /// A credential is present and safe to serve immediately.
    Ready(Arc<ConnectionInfo>),
    /// A credential is present but was explicitly invalidated by `ForceRefresh`; waiters
    /// must wait for the current refresh cycle to resolve rather than reuse it.
    Stale(Arc<ConnectionInfo>),
    /// The most recent fetch failed with no prior credential to fall back on.
    Failed(Arc<String>),
    Closed,
}

enum Command {
    ForceRefresh,
    Close,
}

enum RefreshOutcome {
    Success(Arc<ConnectionInfo>),
    Failure { terminal: bool, message: String },
}

/// Handle to a running per-instance refresher actor.
pub struct Refresher {
    uri: InstanceUri,
    commands: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<Snapshot>,
    task: JoinHandle<()>,
}

impl Refresher {
    /// Spawns the background actor and kicks off the first fetch immediately.
    ///
    /// `on_terminal_failure` is notified (with this refresher's URI) if the initial fetch
    /// fails with a terminal control-plane error, so the owning cache can evict the entry.
    pub fn spawn(
        uri: InstanceUri,
        control_plane: Arc<ControlPlaneClient>,
        options: Arc<ConnectorOptions>,
        on_terminal_failure: mpsc::UnboundedSender<InstanceUri>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::Pending);

        let actor = Actor {
            uri: uri.clone(),
            control_plane,
            options,
            current: None,
            stale: false,
            attempt: 0,
            snapshot_tx,
            commands: commands_rx,
            on_terminal_failure,
        };

        let task = tokio::spawn(actor.run());

        Self {
            uri,
            commands: commands_tx,
            snapshot_rx,
            task,
        }
    }

    pub fn uri(&self) -> &InstanceUri {
        &self.uri
    }

    /// Returns the current credential, waiting on the in-flight fetch if none is usable yet.
    pub async fn get_connection_info(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConnectionInfo>, ConnectorError> {
        let mut rx = self.snapshot_rx.clone();
        loop {
            let snapshot = rx.borrow().clone();
            match snapshot {
                Snapshot::Ready(info) => return Ok(info),
                Snapshot::Closed => return Err(ConnectorError::RefresherClosed),
                Snapshot::Failed(message) => {
                    return Err(ConnectorError::RefreshFailed((*message).clone()));
                }
                Snapshot::Pending | Snapshot::Stale(_) => {
                    tokio::select! {
                        changed = rx.changed() => {
                            changed.map_err(|_| ConnectorError::RefresherClosed)?;
                        }
                        _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                    }
                }
            }
        }
    }

    /// Idempotent: cancels the pending timer and ensures a refresh is (or soon will be)
    /// in flight.
    pub fn force_refresh(&self) {
        let _ = self.commands.try_send(Command::ForceRefresh);
    }

    /// Closes the refresher: cancels the timer and any in-flight fetch, releases resources.
    /// Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    #[cfg(test)]
    pub(crate) async fn join_for_test(self) {
        let _ = self.task.await;
    }
}

struct Actor {
    uri: InstanceUri,
    control_plane: Arc<ControlPlaneClient>,
    options: Arc<ConnectorOptions>,
    current: Option<Arc<ConnectionInfo>>,
    stale: bool,
    attempt: u32,
    snapshot_tx: watch::Sender<Snapshot>,
    commands: mpsc::Receiver<Command>,
    on_terminal_failure: mpsc::UnboundedSender<InstanceUri>,
}

impl Actor {
    #[instrument(skip(self), fields(project = %self.uri.project, instance = %self.uri.instance))]
    async fn run(mut self) {
        let mut refresh_task: Option<JoinHandle<RefreshOutcome>> = Some(self.spawn_refresh_cycle());
        let mut timer: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

        loop {
            let timer_ready = timer.is_some();
            let timer_fut = async {
                match &mut timer {
                    Some(sleep) => sleep.await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(Command::ForceRefresh) => {
                            timer = None;
                            metrics::counter!("alloydb_connector_force_refresh_total").increment(1);
                            if refresh_task.is_none() {
                                refresh_task = Some(self.spawn_refresh_cycle());
                            } else if let Some(current) = &self.current {
                                self.stale = true;
                                let _ = self.snapshot_tx.send(Snapshot::Stale(current.clone()));
                            }
                        }
                        Some(Command::Close) | None => {
                            if let Some(task) = refresh_task.take() {
                                task.abort();
                            }
                            let _ = self.snapshot_tx.send(Snapshot::Closed);
                            info!("refresher closed");
                            return;
                        }
                    }
                }

                result = async { refresh_task.as_mut().unwrap().await }, if refresh_task.is_some() => {
                    refresh_task = None;
                    let outcome = result.unwrap_or_else(|err| RefreshOutcome::Failure {
                        terminal: false,
                        message: format!("refresh task panicked: {}", err),
                    });
                    timer = Some(Box::pin(tokio::time::sleep(self.handle_refresh_outcome(outcome))));
                    if !self.should_keep_running() {
                        return;
                    }
                }

                () = timer_fut, if timer_ready && refresh_task.is_none() => {
                    timer = None;
                    refresh_task = Some(self.spawn_refresh_cycle());
                }
            }
        }
    }

    fn should_keep_running(&self) -> bool {
        true
    }

    /// Applies the result of a completed refresh cycle to actor state and returns the delay
    /// before the next cycle should start.
    fn handle_refresh_outcome(&mut self, outcome: RefreshOutcome) -> Duration {
        match outcome {
            RefreshOutcome::Success(info) => {
                self.attempt = 0;
                self.stale = false;
                let delay = refresh_policy::refresh_delay_with_buffer(
                    info.expiration,
                    Utc::now(),
                    self.options.refresh_buffer_seconds,
                );
                self.current = Some(info.clone());
                let _ = self.snapshot_tx.send(Snapshot::Ready(info));
                metrics::counter!("alloydb_connector_refresh_success_total").increment(1);
                delay
            }
            RefreshOutcome::Failure { terminal, message } => {
                warn!(terminal, message = %message, "refresh attempt failed");
                metrics::counter!("alloydb_connector_refresh_failure_total").increment(1);

                match &self.current {
                    None => {
                        let _ = self.snapshot_tx.send(Snapshot::Failed(Arc::new(message)));
                        if terminal {
                            let _ = self.on_terminal_failure.send(self.uri.clone());
                        }
                    }
                    Some(current) => {
                        self.stale = false;
                        let _ = self.snapshot_tx.send(Snapshot::Ready(current.clone()));
                    }
                }

                self.attempt = self.attempt.saturating_add(1);
                backoff_delay(self.attempt, self.options.max_retry_backoff)
            }
        }
    }

    fn spawn_refresh_cycle(&self) -> JoinHandle<RefreshOutcome> {
        let uri = self.uri.clone();
        let control_plane = self.control_plane.clone();
        tokio::spawn(async move { run_refresh_cycle(uri, control_plane).await })
    }
}

#[instrument(skip(control_plane), fields(project = %uri.project, instance = %uri.instance))]
async fn run_refresh_cycle(
    uri: InstanceUri,
    control_plane: Arc<ControlPlaneClient>,
) -> RefreshOutcome {
    let key_pair = match tokio::task::spawn_blocking(keys::generate_key_pair).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => {
            return RefreshOutcome::Failure {
                terminal: false,
                message: err.to_string(),
            };
        }
        Err(err) => {
            return RefreshOutcome::Failure {
                terminal: false,
                message: format!("key generation task panicked: {}", err),
            };
        }
    };

    let (metadata, certificate) = tokio::join!(
        control_plane.get_metadata(&uri),
        control_plane.generate_certificate(&uri, &key_pair.public_key_pem),
    );

    let metadata = match metadata {
        Ok(metadata) => metadata,
        Err(err) => {
            return RefreshOutcome::Failure {
                terminal: err.is_terminal(),
                message: err.to_string(),
            };
        }
    };

    let certificate = match certificate {
        Ok(certificate) => certificate,
        Err(err) => {
            return RefreshOutcome::Failure {
                terminal: err.is_terminal(),
                message: err.to_string(),
            };
        }
    };

    let expiration = match leaf_expiration(&certificate.cert_chain[0]) {
        Ok(expiration) => expiration,
        Err(err) => {
            return RefreshOutcome::Failure {
                terminal: false,
                message: err.to_string(),
            };
        }
    };

    let info = ConnectionInfo::new(
        certificate.ca_cert,
        certificate.cert_chain,
        key_pair.private_key,
        metadata.ip_addrs,
        expiration,
        metadata.instance_uid,
    );

    RefreshOutcome::Success(Arc::new(info))
}

fn leaf_expiration(leaf_pem: &str) -> Result<DateTime<Utc>, ConnectorError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(leaf_pem.as_bytes())
        .map_err(|err| ConnectorError::Tls(crate::error::TlsError::InvalidCertChain(err.to_string())))?;
    let cert = pem
        .parse_x509()
        .map_err(|err| ConnectorError::Tls(crate::error::TlsError::InvalidCertChain(err.to_string())))?;
    let timestamp = cert.validity().not_after.timestamp();
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| {
            ConnectorError::Tls(crate::error::TlsError::InvalidCertChain(
                "certificate expiration out of range".to_string(),
            ))
        })
}

/// Exponential backoff with full jitter, capped at `max`.
fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    let base_ms = 500u64.saturating_mul(1u64 << attempt.min(16));
    let capped_ms = base_ms.min(max.as_millis() as u64);
    let jittered_ms = rand::thread_rng().gen_range(0..=capped_ms.max(1));
    Duration::from_millis(jittered_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::task::JoinSet;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use crate::control_plane::StaticTokenProvider;

    #[test]
    fn backoff_never_exceeds_the_configured_ceiling() {
        let max = Duration::from_millis(30_000);
        for attempt in 0..20 {
            assert!(backoff_delay(attempt, max) <= max);
        }
    }

    #[test]
    fn backoff_grows_with_attempt_count_on_average() {
        let max = Duration::from_secs(3600);
        assert!(backoff_delay(1, max) <= backoff_delay(10, max) + Duration::from_millis(1));
    }

    /// A self-signed leaf certificate, real enough for `leaf_expiration` to parse.
    fn self_signed_leaf_pem() -> String {
        let mut params = rcgen::CertificateParams::new(Vec::new()).expect("empty SAN list");
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "test-instance");
        let key_pair = rcgen::KeyPair::generate().expect("key pair");
        let cert = params.self_signed(&key_pair).expect("self-signed cert");
        cert.pem()
    }

    async fn mount_control_plane(server: &MockServer, delay: Duration) {
        let leaf_pem = self_signed_leaf_pem();

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "ipAddress": "10.0.0.5",
                        "instanceUid": "uid-1",
                    }))
                    .set_delay(delay),
            )
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "caCert": leaf_pem,
                        "pemCertificateChain": [leaf_pem],
                    }))
                    .set_delay(delay),
            )
            .mount(server)
            .await;
    }

    struct CountingResponder {
        hits: Arc<AtomicUsize>,
        body: serde_json::Value,
        delay: Duration,
    }

    impl Respond for CountingResponder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.hits.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200)
                .set_body_json(self.body.clone())
                .set_delay(self.delay)
        }
    }

    async fn mount_counting_control_plane(
        server: &MockServer,
        metadata_hits: Arc<AtomicUsize>,
        cert_hits: Arc<AtomicUsize>,
        delay: Duration,
    ) {
        let leaf_pem = self_signed_leaf_pem();

        Mock::given(method("GET"))
            .respond_with(CountingResponder {
                hits: metadata_hits,
                body: serde_json::json!({
                    "ipAddress": "10.0.0.5",
                    "instanceUid": "uid-1",
                }),
                delay,
            })
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .respond_with(CountingResponder {
                hits: cert_hits,
                body: serde_json::json!({
                    "caCert": leaf_pem,
                    "pemCertificateChain": [leaf_pem],
                }),
                delay,
            })
            .mount(server)
            .await;
    }

    fn spawn_refresher(server: &MockServer) -> Refresher {
        let control_plane = Arc::new(ControlPlaneClient::new(
            server.uri(),
            Some("generic"),
            None,
            None,
            Arc::new(StaticTokenProvider::new("test-token")),
            Duration::from_secs(5),
        ));
        let options = Arc::new(
            ConnectorOptions::builder(Arc::new(StaticTokenProvider::new("test-token"))).build(),
        );
        let uri =
            InstanceUri::parse("projects/p/locations/l/clusters/c/instances/i").expect("uri");
        let (on_terminal_failure, _rx) = mpsc::unbounded_channel();
        Refresher::spawn(uri, control_plane, options, on_terminal_failure)
    }

    #[tokio::test]
    async fn close_exits_the_actor_even_mid_cycle() {
        let server = MockServer::start().await;
        mount_control_plane(&server, Duration::from_millis(50)).await;
        let refresher = spawn_refresher(&server);

        refresher.close().await;

        tokio::time::timeout(Duration::from_secs(2), refresher.join_for_test())
            .await
            .expect("actor task exited promptly after close");
    }

    #[tokio::test]
    async fn force_refresh_marks_stale_before_resolving_to_a_fresh_credential() {
        let server = MockServer::start().await;
        mount_control_plane(&server, Duration::from_millis(150)).await;
        let refresher = spawn_refresher(&server);
        let cancel = CancellationToken::new();

        let first = refresher
            .get_connection_info(&cancel)
            .await
            .expect("initial fetch resolves");

        let mut rx = refresher.snapshot_rx.clone();
        // The first call starts a new cycle (none was in flight); the second, sent right
        // behind it, lands while that cycle is running and must mark the cache stale.
        refresher.force_refresh();
        refresher.force_refresh();

        rx.wait_for(|snapshot| matches!(snapshot, Snapshot::Stale(_)))
            .await
            .expect("refresher did not close while forcing a refresh");

        let second = refresher
            .get_connection_info(&cancel)
            .await
            .expect("forced refresh resolves");
        assert!(!Arc::ptr_eq(&first, &second));

        refresher.close().await;
    }

    #[tokio::test]
    async fn concurrent_callers_on_a_cold_cache_share_one_fetch() {
        let server = MockServer::start().await;
        let metadata_hits = Arc::new(AtomicUsize::new(0));
        let cert_hits = Arc::new(AtomicUsize::new(0));
        mount_counting_control_plane(
            &server,
            metadata_hits.clone(),
            cert_hits.clone(),
            Duration::from_millis(100),
        )
        .await;

        let refresher = Arc::new(spawn_refresher(&server));
        let cancel = CancellationToken::new();

        let mut callers = JoinSet::new();
        for _ in 0..10 {
            let refresher = refresher.clone();
            let cancel = cancel.clone();
            callers.spawn(async move { refresher.get_connection_info(&cancel).await });
        }

        let mut results = Vec::new();
        while let Some(result) = callers.join_next().await {
            results.push(result.expect("task did not panic").expect("fetch succeeds"));
        }

        assert_eq!(metadata_hits.load(Ordering::SeqCst), 1);
        assert_eq!(cert_hits.load(Ordering::SeqCst), 1);
        let first = &results[0];
        assert!(results.iter().all(|info| Arc::ptr_eq(info, first)));

        refresher.close().await;
    }
}
