//! TCP listener: accepts analyzer connections and supervises one session task per connection.

use std::any::Any;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::ServerError;
use crate::session::{Pipeline, Session, SessionOptions};

/// Exponential back-off for failed `accept()` calls.
///
/// The delay starts at `initial_delay`, doubles on each consecutive failure and is capped at
/// `max_delay`. A successful accept resets it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp both delays to at least 1ms and make sure `initial_delay <= max_delay`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ListenerOptions {
    pub session: SessionOptions,
    /// Bound on how long shutdown waits for open sessions before their storage calls are
    /// cancelled. `None` waits for as long as it takes.
    pub drain_timeout: Option<Duration>,
    pub backoff: BackoffConfig,
}

/// A bound MLLP listener. Nothing is accepted until [`Listener::run`] is awaited.
pub struct Listener {
    listener: TcpListener,
    options: ListenerOptions,
    pipeline: Arc<Pipeline>,
}

impl Listener {
    /// Binds `addr` with the given accept backlog. Must be called from within a tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        backlog: u32,
        options: ListenerOptions,
        pipeline: Arc<Pipeline>,
    ) -> Result<Self, ServerError> {
        let bind_error = |source: io::Error| ServerError::Bind { addr, source };
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;
        #[cfg(unix)]
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;
        let listener = socket.listen(backlog).map_err(bind_error)?;

        Ok(Self {
            listener,
            options,
            pipeline,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until Ctrl+C, then drains open sessions.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(wait_for_signal(tokio::signal::ctrl_c(), "Ctrl+C"))
            .await
    }

    /// Accepts connections until `shutdown` resolves, then stops accepting and waits for every
    /// session to close.
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let shutdown_token = CancellationToken::new();
        let abort = CancellationToken::new();
        let tracker = TaskTracker::new();

        if let Ok(addr) = self.listener.local_addr() {
            info!("MLLP listener started on {addr}");
        }

        let handles = AcceptHandles {
            pipeline: &self.pipeline,
            tracker: &tracker,
            shutdown: &shutdown_token,
            abort: &abort,
            options: &self.options,
        };
        tokio::select! {
            () = shutdown => {}
            () = accept_loop(&self.listener, handles) => {}
        }

        info!(
            "Shutdown requested, no longer accepting connections ({} open)",
            tracker.len()
        );
        shutdown_token.cancel();
        tracker.close();
        drain(&tracker, self.options.drain_timeout, &abort).await;
        info!("MLLP listener stopped");
        Ok(())
    }
}

struct AcceptHandles<'a> {
    pipeline: &'a Arc<Pipeline>,
    tracker: &'a TaskTracker,
    shutdown: &'a CancellationToken,
    abort: &'a CancellationToken,
    options: &'a ListenerOptions,
}

async fn accept_loop(listener: &TcpListener, handles: AcceptHandles<'_>) {
    let backoff = handles.options.backoff.normalized();
    let mut delay = backoff.initial_delay;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                spawn_session(stream, peer, &handles);
                delay = backoff.initial_delay;
            }
            Err(e) => {
                let local_addr = listener.local_addr().ok();
                warn!("accept error: error={e:?}, local_addr={local_addr:?}");
                sleep(delay).await;
                delay = (delay * 2).min(backoff.max_delay);
            }
        }
    }
}

/// Spawn a tracked task for one connection, logging and discarding any panic.
fn spawn_session(stream: TcpStream, peer: SocketAddr, handles: &AcceptHandles<'_>) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {peer}: {e}");
    }
    let session = Session::new(
        stream,
        peer.to_string(),
        Arc::clone(handles.pipeline),
        handles.options.session,
        handles.shutdown.clone(),
        handles.abort.clone(),
    );
    handles.tracker.spawn(async move {
        match AssertUnwindSafe(session.run()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Connection {peer} failed: {e}"),
            Err(panic) => error!(
                "connection task panicked: panic={}, peer_addr={peer}",
                panic_message(panic.as_ref())
            ),
        }
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else {
        format!("{panic:?}")
    }
}

async fn drain(tracker: &TaskTracker, drain_timeout: Option<Duration>, abort: &CancellationToken) {
    if let Some(limit) = drain_timeout {
        if timeout(limit, tracker.wait()).await.is_ok() {
            return;
        }
        warn!(
            "{} connection(s) still busy after {limit:?}, cancelling in-flight storage",
            tracker.len()
        );
        abort.cancel();
    }
    tracker.wait().await;
}

/// Resolves once `signal` fires. If the handler can't be installed this never resolves, so the
/// listener keeps serving instead of shutting down on the spot.
async fn wait_for_signal<F>(signal: F, name: &str)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!("Failed to listen for {name}: {e}");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckBuilder;
    use crate::error::StorageError;
    use crate::model::ParsedObservationMessage;
    use crate::storage::testing::{RecordingRawStore, RecordingRepository};
    use crate::storage::ObservationRepository;
    use async_trait::async_trait;
    use rstest::rstest;
    use crate::codec::MllpCodec;
    use crate::mllp::TerminatorPolicy;
    use bytes::BytesMut;
    use futures::{SinkExt, StreamExt};
    use tokio::sync::{oneshot, Notify};
    use tokio_util::codec::Framed;

    const ORU: &str = "MSH|^~\\&|ANALYZER|LAB|LOGGER|HOST|20240101120000||ORU^R01|42|P|2.5.1\r\
                       PID|1||P1\r\
                       OBX|1|NM|HGB^Hemoglobin||13.5|g/dL\r";

    type Client = Framed<TcpStream, MllpCodec>;

    async fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Framed::new(
            stream,
            MllpCodec::with_policy(TerminatorPolicy::StripOutsideFrame),
        )
    }

    async fn send(client: &mut Client, text: &str) {
        client.send(BytesMut::from(text)).await.expect("send frame");
    }

    /// The next acknowledgment, exactly one frame.
    async fn read_ack(client: &mut Client) -> String {
        client
            .next()
            .await
            .expect("connection closed before the ack was complete")
            .expect("ack should decode")
    }

    fn bind(repository: Arc<dyn ObservationRepository>, options: ListenerOptions) -> Listener {
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(RecordingRawStore::default()),
            repository,
            AckBuilder::default(),
        ));
        Listener::bind("127.0.0.1:0".parse().unwrap(), 16, options, pipeline)
            .expect("bind loopback listener")
    }

    #[tokio::test]
    async fn acknowledges_message_over_tcp_and_shuts_down_while_idle() {
        let repository = Arc::new(RecordingRepository::default());
        let listener = bind(repository.clone(), ListenerOptions::default());
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(listener.run_with_shutdown(async {
            let _ = rx.await;
        }));

        let mut client = connect(addr).await;
        send(&mut client, ORU).await;
        let ack = read_ack(&mut client).await;

        assert!(ack.contains("MSA|AA|1"), "unexpected ack {ack:?}");
        assert_eq!(repository.saved.lock().unwrap()[0].observations.len(), 1);

        // the client stays connected; shutdown must still complete
        let _ = tx.send(());
        server.await.unwrap().expect("clean shutdown");

        assert!(
            !matches!(client.next().await, Some(Ok(_))),
            "server should close the idle connection"
        );
    }

    #[tokio::test]
    async fn serves_concurrent_connections_independently() {
        let repository = Arc::new(RecordingRepository::default());
        let listener = bind(repository.clone(), ListenerOptions::default());
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(listener.run_with_shutdown(async {
            let _ = rx.await;
        }));

        let mut first = connect(addr).await;
        let mut second = connect(addr).await;
        send(&mut second, "garbage").await;
        send(&mut first, ORU).await;

        assert!(read_ack(&mut second).await.contains("MSA|AE|"));
        assert!(read_ack(&mut first).await.contains("MSA|AA|"));

        let _ = tx.send(());
        server.await.unwrap().unwrap();
    }

    /// Blocks every save until cancelled.
    #[derive(Default)]
    struct StuckRepository {
        entered: Notify,
    }

    #[async_trait]
    impl ObservationRepository for StuckRepository {
        async fn save(
            &self,
            _message: ParsedObservationMessage,
            cancel: &CancellationToken,
        ) -> Result<(), StorageError> {
            self.entered.notify_one();
            cancel.cancelled().await;
            Err(StorageError::Cancelled)
        }
    }

    #[tokio::test]
    async fn drain_timeout_cancels_in_flight_storage() {
        let repository = Arc::new(StuckRepository::default());
        let options = ListenerOptions {
            drain_timeout: Some(Duration::from_millis(50)),
            ..ListenerOptions::default()
        };
        let listener = bind(repository.clone(), options);
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(listener.run_with_shutdown(async {
            let _ = rx.await;
        }));

        let mut client = connect(addr).await;
        send(&mut client, ORU).await;
        repository.entered.notified().await;
        let _ = tx.send(());

        let ack = read_ack(&mut client).await;
        assert!(ack.contains("MSA|AE|1|failed to persist observations"), "unexpected ack {ack:?}");
        assert!(ack.contains("cancelled"));
        server.await.unwrap().expect("shutdown completes after abort");
    }

    #[test]
    fn bind_failure_names_the_address() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let addr: SocketAddr = "203.0.113.7:2575".parse().unwrap();
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(RecordingRawStore::default()),
            Arc::new(RecordingRepository::default()),
            AckBuilder::default(),
        ));

        match Listener::bind(addr, 1, ListenerOptions::default(), pipeline) {
            Err(ServerError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            Ok(_) => panic!("binding a foreign address should fail"),
        }
    }

    #[rstest]
    #[case(Duration::from_millis(5), Duration::from_millis(1), Duration::from_millis(1), Duration::from_millis(5))]
    #[case(Duration::ZERO, Duration::ZERO, Duration::from_millis(1), Duration::from_millis(1))]
    #[case(Duration::from_millis(10), Duration::from_secs(1), Duration::from_millis(10), Duration::from_secs(1))]
    fn backoff_is_normalized(
        #[case] initial: Duration,
        #[case] max: Duration,
        #[case] expected_initial: Duration,
        #[case] expected_max: Duration,
    ) {
        let normalized = BackoffConfig {
            initial_delay: initial,
            max_delay: max,
        }
        .normalized();

        assert_eq!(normalized.initial_delay, expected_initial);
        assert_eq!(normalized.max_delay, expected_max);
    }

    #[tokio::test]
    async fn two_acks_in_one_read_are_returned_one_at_a_time() {
        let repository = Arc::new(RecordingRepository::default());
        let listener = bind(repository.clone(), ListenerOptions::default());
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(listener.run_with_shutdown(async {
            let _ = rx.await;
        }));

        let mut client = connect(addr).await;
        send(&mut client, ORU).await;
        send(&mut client, ORU).await;

        assert!(read_ack(&mut client).await.ends_with("\rMSA|AA|1\r"));
        assert!(read_ack(&mut client).await.ends_with("\rMSA|AA|1\r"));
        assert_eq!(repository.saved.lock().unwrap().len(), 2);

        let _ = tx.send(());
        server.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_signal_registration_keeps_waiting() {
        let failed = async { Err::<(), _>(io::Error::new(io::ErrorKind::Other, "no signal driver")) };

        let waited = timeout(Duration::from_secs(60), wait_for_signal(failed, "Ctrl+C")).await;

        assert!(waited.is_err(), "a failed registration must not trigger shutdown");
    }

    #[tokio::test]
    async fn delivered_signal_resolves() {
        wait_for_signal(async { Ok::<(), io::Error>(()) }, "Ctrl+C").await;
    }

    #[test]
    fn panic_payloads_are_rendered() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert!(panic_message(&5_u32).contains("Any"));
    }
}
