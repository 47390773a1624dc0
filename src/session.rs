//! One analyzer connection: receive frames, archive, parse, persist and acknowledge each in turn.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use crate::ack::{AckBuilder, AckOutcome};
use crate::codec::MllpCodec;
use crate::error::{ConnectionError, ProcessError};
use crate::mllp::TerminatorPolicy;
use crate::parser::ObservationParser;
use crate::storage::{ObservationRepository, RawMessageStore};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// The per-message work shared by every connection: store, parse, save, acknowledge.
pub struct Pipeline {
    raw_store: Arc<dyn RawMessageStore>,
    repository: Arc<dyn ObservationRepository>,
    parser: ObservationParser,
    acks: AckBuilder,
}

impl Pipeline {
    pub fn new(
        raw_store: Arc<dyn RawMessageStore>,
        repository: Arc<dyn ObservationRepository>,
        acks: AckBuilder,
    ) -> Self {
        Self {
            raw_store,
            repository,
            parser: ObservationParser::new(),
            acks,
        }
    }

    /// Handles one received payload and returns the framed acknowledgment to send back.
    ///
    /// Never fails: a parse or persistence failure becomes an `AE` acknowledgment, and a raw store
    /// failure is only logged.
    pub async fn process(&self, raw: &str, cancel: &CancellationToken) -> Bytes {
        if let Err(e) = self.raw_store.store(raw, cancel).await {
            warn!("Failed to archive raw message: {e}");
        }

        let (control_id, result) = match self.parser.parse(raw) {
            Ok(message) => {
                let control_id = message.message_control_id.clone();
                let observations = message.observations.len();
                let saved = self
                    .repository
                    .save(message, cancel)
                    .await
                    .map(|()| observations)
                    .map_err(ProcessError::Persistence);
                (control_id, saved)
            }
            Err(e) => (String::new(), Err(ProcessError::from(e))),
        };

        match result {
            Ok(observations) => {
                info!("Accepted message {control_id} with {observations} observation(s)");
                self.acks.build(&control_id, &AckOutcome::Accepted)
            }
            Err(e) => {
                warn!("Rejected message {control_id:?}: {e}");
                self.acks.build(&control_id, &AckOutcome::Error(e.to_string()))
            }
        }
    }
}

/// Per-connection knobs taken from the listener configuration.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Longest wait for the next bytes, and for an acknowledgment write to complete.
    pub receive_timeout: Duration,
    pub terminator_policy: TerminatorPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(120),
            terminator_policy: TerminatorPolicy::default(),
        }
    }
}

/// Drives a single connection until EOF, idle timeout, transport error or shutdown.
///
/// Messages are handled strictly in the order they arrive. `shutdown` is only honoured between
/// messages; `abort` is handed to the storage calls so they can be cut short.
pub struct Session<S> {
    stream: S,
    peer: String,
    codec: MllpCodec,
    pipeline: Arc<Pipeline>,
    receive_timeout: Duration,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        pipeline: Arc<Pipeline>,
        options: SessionOptions,
        shutdown: CancellationToken,
        abort: CancellationToken,
    ) -> Self {
        Self {
            stream,
            peer: peer.into(),
            codec: MllpCodec::with_policy(options.terminator_policy),
            pipeline,
            receive_timeout: options.receive_timeout,
            shutdown,
            abort,
        }
    }

    /// Runs the receive loop. `Ok` means the peer hung up or shutdown was requested.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!("Connection opened: {}", self.peer);
        let result = self.receive_loop().await;
        if result.is_ok() {
            info!("Connection closed: {}", self.peer);
        }
        result
    }

    async fn receive_loop(&mut self) -> Result<(), ConnectionError> {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            let read = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    debug!("Shutdown requested, closing idle connection {}", self.peer);
                    return Ok(());
                }
                read = timeout(self.receive_timeout, self.stream.read_buf(&mut buffer)) => read,
            };
            let count = match read {
                Ok(count) => count?,
                Err(_) => return Err(ConnectionError::Timeout(self.receive_timeout)),
            };
            trace!("Read {count} byte(s) from {}", self.peer);

            if count == 0 {
                while let Some(raw) = self.codec.decode_eof(&mut buffer)? {
                    self.respond(&raw).await?;
                }
                return Ok(());
            }

            while let Some(raw) = self.codec.decode(&mut buffer)? {
                self.respond(&raw).await?;
                if self.shutdown.is_cancelled() {
                    debug!("Shutdown requested, closing connection {} after message", self.peer);
                    return Ok(());
                }
            }
        }
    }

    async fn respond(&mut self, raw: &str) -> Result<(), ConnectionError> {
        debug!("Received {} byte message from {}", raw.len(), self.peer);
        let ack = self.pipeline.process(raw, &self.abort).await;

        let stream = &mut self.stream;
        let write = async {
            stream.write_all(&ack).await?;
            stream.flush().await
        };
        match timeout(self.receive_timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::Timeout(self.receive_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::{RecordingRawStore, RecordingRepository};
    use futures::{SinkExt, StreamExt};
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio_util::codec::Framed;

    const ORU: &str = "MSH|^~\\&|ANALYZER|LAB|LOGGER|HOST|20240101120000||ORU^R01|MSG001|P|2.5.1\r\
                       PID|1||12345^^^HOSP||DOE^JOHN\r\
                       OBR|1|ORD1\r\
                       OBX|1|NM|GLU^Glucose||5.5|mmol/L|3.9-6.1|N|||F\r";

    fn framed(text: &str) -> Vec<u8> {
        let mut bytes = vec![0x0B];
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(&[0x1C, 0x0D]);
        bytes
    }

    struct Harness {
        // the analyzer's end; decoding keeps in-frame CRs so ACK segments stay visible
        client: Framed<DuplexStream, MllpCodec>,
        raw_store: Arc<RecordingRawStore>,
        repository: Arc<RecordingRepository>,
        shutdown: CancellationToken,
        session: JoinHandle<Result<(), ConnectionError>>,
    }

    fn start(raw_store: RecordingRawStore, repository: RecordingRepository) -> Harness {
        start_with(raw_store, repository, SessionOptions::default())
    }

    fn start_with(
        raw_store: RecordingRawStore,
        repository: RecordingRepository,
        options: SessionOptions,
    ) -> Harness {
        let raw_store = Arc::new(raw_store);
        let repository = Arc::new(repository);
        let pipeline = Arc::new(Pipeline::new(
            raw_store.clone(),
            repository.clone(),
            AckBuilder::default(),
        ));
        let (client, server) = duplex(4096);
        let shutdown = CancellationToken::new();
        let session = Session::new(
            server,
            "test-peer",
            pipeline,
            options,
            shutdown.clone(),
            CancellationToken::new(),
        );
        Harness {
            client: Framed::new(
                client,
                MllpCodec::with_policy(TerminatorPolicy::StripOutsideFrame),
            ),
            raw_store,
            repository,
            shutdown,
            session: tokio::spawn(session.run()),
        }
    }

    impl Harness {
        /// Sends one whole frame.
        async fn send(&mut self, text: &str) {
            self.client
                .send(BytesMut::from(text))
                .await
                .expect("send frame");
        }

        /// Writes bytes as they are, framed or not.
        async fn write_raw(&mut self, bytes: &[u8]) {
            let stream = self.client.get_mut();
            stream.write_all(bytes).await.expect("write");
            stream.flush().await.expect("flush");
        }

        /// The next acknowledgment, exactly one frame.
        async fn read_ack(&mut self) -> String {
            self.client
                .next()
                .await
                .expect("connection closed before the ack was complete")
                .expect("ack should decode")
        }
    }

    #[tokio::test]
    async fn result_message_is_stored_saved_and_acknowledged() {
        let mut h = start(RecordingRawStore::default(), RecordingRepository::default());

        h.send(ORU).await;
        let ack = h.read_ack().await;

        assert!(ack.contains("MSA|AA|1"), "unexpected ack {ack:?}");
        {
            let saved = h.repository.saved.lock().unwrap();
            assert_eq!(saved.len(), 1);
            assert_eq!(saved[0].message_control_id, "MSG001");
            assert_eq!(saved[0].patient_id.as_deref(), Some("12345"));
            assert_eq!(saved[0].observations.len(), 1);
            assert_eq!(saved[0].observations[0].observation_id, "GLU");
        }
        {
            let stored = h.raw_store.stored.lock().unwrap();
            assert_eq!(stored.len(), 1);
            assert!(stored[0].starts_with("MSH|^~\\&|ANALYZER"));
        }
        assert!(!h.session.is_finished());

        // still open for the next frame
        h.send(ORU).await;
        h.read_ack().await;
        assert_eq!(h.repository.saved.lock().unwrap().len(), 2);

        drop(h.client);
        h.session.await.unwrap().expect("clean close on EOF");
    }

    #[tokio::test]
    async fn frame_split_across_writes_is_reassembled() {
        let mut h = start(RecordingRawStore::default(), RecordingRepository::default());
        let bytes = framed(ORU);

        for piece in bytes.chunks(7) {
            h.write_raw(piece).await;
            tokio::task::yield_now().await;
        }
        let ack = h.read_ack().await;

        assert!(ack.contains("MSA|AA|"));
        assert_eq!(h.repository.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn back_to_back_frames_are_answered_in_order() {
        let mut h = start(RecordingRawStore::default(), RecordingRepository::default());
        let mut bytes = framed(ORU);
        bytes.extend(framed("not hl7 at all"));

        h.write_raw(&bytes).await;
        let first = h.read_ack().await;
        let second = h.read_ack().await;

        assert!(first.contains("\rMSA|AA|1\r"), "unexpected ack {first:?}");
        assert!(second.contains("\rMSA|AE|1|"), "unexpected ack {second:?}");
        assert_eq!(h.repository.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_message_gets_error_ack_and_connection_survives() {
        let mut h = start(RecordingRawStore::default(), RecordingRepository::default());

        h.send("PID|1||42").await;
        let ack = h.read_ack().await;

        assert!(ack.contains("MSA|AE|1|malformed HL7 message"), "unexpected ack {ack:?}");
        assert!(h.repository.saved.lock().unwrap().is_empty());
        assert_eq!(h.raw_store.stored.lock().unwrap().len(), 1);

        h.send(ORU).await;
        assert!(h.read_ack().await.contains("MSA|AA|"));
    }

    #[tokio::test]
    async fn persistence_failure_gets_error_ack() {
        let repository = RecordingRepository {
            fail: true,
            ..Default::default()
        };
        let mut h = start(RecordingRawStore::default(), repository);

        h.send(ORU).await;
        let ack = h.read_ack().await;

        assert!(ack.contains("MSA|AE|1|failed to persist observations"), "unexpected ack {ack:?}");
        assert!(ack.contains("database unavailable"));
        assert!(!h.session.is_finished());
    }

    #[tokio::test]
    async fn raw_store_failure_does_not_block_acknowledgment() {
        let raw_store = RecordingRawStore {
            fail: true,
            ..Default::default()
        };
        let mut h = start(raw_store, RecordingRepository::default());

        h.send(ORU).await;
        let ack = h.read_ack().await;

        assert!(ack.contains("MSA|AA|"));
        assert_eq!(h.repository.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_frame_at_eof_is_discarded() {
        let mut h = start(RecordingRawStore::default(), RecordingRepository::default());
        let bytes = framed(ORU);

        h.write_raw(&bytes[..bytes.len() / 2]).await;
        drop(h.client);

        h.session.await.unwrap().expect("clean close on EOF");
        assert!(h.repository.saved.lock().unwrap().is_empty());
        assert!(h.raw_store.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_idle_connection() {
        let h = start(RecordingRawStore::default(), RecordingRepository::default());

        h.shutdown.cancel();

        h.session.await.unwrap().expect("shutdown is a clean close");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let options = SessionOptions {
            receive_timeout: Duration::from_secs(5),
            ..SessionOptions::default()
        };
        let h = start_with(
            RecordingRawStore::default(),
            RecordingRepository::default(),
            options,
        );

        let result = h.session.await.unwrap();

        assert!(matches!(result, Err(ConnectionError::Timeout(d)) if d == Duration::from_secs(5)));
        drop(h.client);
    }
}
